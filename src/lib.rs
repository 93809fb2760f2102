//! Buildsmith: compile job orchestrator
//!
//! Queues compile tasks, runs them on a bounded worker pool against managed
//! toolchains, streams compiler output, caches successful results and keeps a
//! queryable history of every finished task.

pub mod app;
pub mod cli;
pub mod execution_engine;
pub mod logging;

pub use app::Buildsmith;
pub use execution_engine::{TaskManager, TaskQueue};
