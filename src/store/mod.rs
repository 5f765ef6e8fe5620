//! Persistence layer: libSQL-backed storage for task state, the message
//! queue and session conversations.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, MessageAuthor, RecordedToolCall, RecordedToolResult, SessionMessage};
