//! Execution engine: queue, worker pool and result building for compile tasks

mod command;
mod queue;
mod result_builder;
mod task_manager;

pub use command::{compiler_arguments, spawn_request};
pub use queue::TaskQueue;
pub use task_manager::TaskManager;
