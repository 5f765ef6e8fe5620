//! Agent execution: per-session processing loops and the service that owns them.

pub mod events;
pub mod execution;
pub mod history;
pub mod parser;
pub mod prompt;
pub mod service;

pub use events::{ChannelEvents, ExecutionEvent, ExecutionEvents, NoopEvents, Suggestion};
pub use execution::{ExecutionContext, ExecutionDeps, IterationOutcome, SessionInfo};
pub use service::{AgentService, ContextUsage, ResumeOutcome};
