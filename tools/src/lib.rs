//! Buildsmith Tools Module
//!
//! Process-facing pieces of the compile orchestrator: the spawn capability,
//! the output stream handler that drains and parses process output, and the
//! toolchain manager that installs compilers through the same spawner.

pub mod output;
pub mod process;
pub mod toolchain;

pub use output::{
    classify_line, summarize, LineKind, OutputChannel, OutputEvent, OutputListener,
    OutputStreamHandler, OutputSummary, ProgressTracker,
};
pub use process::{
    terminate_gracefully, InputWriter, OutputReader, ProcessHandle, ProcessScript, ProcessSpawner,
    ScriptedSpawner, SpawnRequest, TokioProcessSpawner,
};
pub use toolchain::{
    compare_versions, extract_version, CommandSpec, InstallPhase, InstallationStatus,
    ToolchainDefinition, ToolchainManager, ToolchainRegistry, ToolchainUpdate,
};
