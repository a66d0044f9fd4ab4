//! Durable task queue and the task status lifecycle

mod store;
mod task;

pub use store::TaskQueue;
pub use task::{Task, TaskKind, TaskLog, TaskStatus, TaskSummary, TaskUpdate};
