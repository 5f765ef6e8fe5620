//! Session task state, the durable message queue and checklist analysis.

pub mod analyzer;
pub mod followup;
pub mod manager;
pub mod model;
pub mod processors;

pub use analyzer::{NextAction, TaskExecutionState, TaskStateAnalyzer, TodoItem, TodoStatus};
pub use followup::FollowupBroker;
pub use manager::{QueueEvent, TaskManager};
pub use model::{
    ExecutionMetadata, ProcessingContext, QueueItem, QueueStats, QueueStatus, StaleReset,
    TaskState, TaskStateUpdate, TaskStatus,
};
pub use processors::{ProcessorLease, ProcessorRegistry};
