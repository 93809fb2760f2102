//! CLI module
//!
//! Provides:
//! - Argument parsing (clap derive)
//! - Subcommand dispatch onto the managers built by [`crate::app::Buildsmith`]

pub mod args;
pub mod dispatch;

// Re-exports
pub use args::{Cli, Command};
pub use dispatch::run;
