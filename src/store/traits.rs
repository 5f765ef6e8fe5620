//! Unified `Database` trait: a single async interface for all persistence.
//!
//! Covers the per-session task row, the durable message queue and the
//! conversation log that chat history is rebuilt from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::llm::ToolCall;
use crate::tasks::model::{
    QueueItem, QueueStats, QueueStatus, StaleReset, TaskState, TaskStateUpdate, TaskStatus,
};

/// Who authored a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageAuthor {
    User,
    Assistant,
    /// Runtime-generated directives (continuations, corrections).
    System,
}

impl MessageAuthor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => Self::Assistant,
            "system" => Self::System,
            _ => Self::User,
        }
    }
}

/// Result attached to a recorded tool call once it has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedToolResult {
    pub output: String,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// A tool call as persisted on an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RecordedToolResult>,
}

impl RecordedToolCall {
    /// Record a call that has not produced a result yet.
    pub fn pending(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: None,
        }
    }

    pub fn with_result(mut self, output: impl Into<String>, is_error: bool) -> Self {
        self.result = Some(RecordedToolResult {
            output: output.into(),
            is_error,
            timestamp: Utc::now(),
        });
        self
    }
}

/// A persisted conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub id: String,
    pub seq: i64,
    pub session_id: String,
    pub sender_id: String,
    pub author: MessageAuthor,
    pub content: String,
    pub tool_calls: Vec<RecordedToolCall>,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering task state, the queue and conversations.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Task state ──────────────────────────────────────────────────

    /// Return the session's row, creating a pending one if absent.
    async fn get_or_create_task_state(&self, session_id: &str)
    -> Result<TaskState, DatabaseError>;

    async fn get_task_state(&self, session_id: &str) -> Result<Option<TaskState>, DatabaseError>;

    /// Merge `update` into the session's row inside a write transaction.
    ///
    /// Fails with `NotFound` when the row is missing and `Constraint` when
    /// the status change is not allowed.
    async fn update_task_state(
        &self,
        session_id: &str,
        update: &TaskStateUpdate,
    ) -> Result<TaskState, DatabaseError>;

    /// Session ids whose task row is in `status`.
    async fn list_sessions_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<String>, DatabaseError>;

    // ── Message queue ───────────────────────────────────────────────

    async fn enqueue_message(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
        sender_id: &str,
    ) -> Result<QueueItem, DatabaseError>;

    /// Atomically claim the oldest queued item for a session.
    async fn claim_next_queue_item(
        &self,
        session_id: &str,
    ) -> Result<Option<QueueItem>, DatabaseError>;

    /// Mark an item processed, applying `task_update` to its session in the
    /// same transaction.
    async fn complete_queue_item(
        &self,
        item_id: &str,
        result: Option<&serde_json::Value>,
        task_update: Option<&TaskStateUpdate>,
    ) -> Result<(), DatabaseError>;

    async fn fail_queue_item(&self, item_id: &str, error: &str) -> Result<(), DatabaseError>;

    async fn get_queue_item(&self, item_id: &str) -> Result<Option<QueueItem>, DatabaseError>;

    async fn count_queue_items(
        &self,
        session_id: &str,
        status: QueueStatus,
    ) -> Result<u64, DatabaseError>;

    async fn queue_stats(&self, session_id: &str) -> Result<QueueStats, DatabaseError>;

    /// Reset rows left mid-flight by a crashed process: processing items back
    /// to queued, running and waiting-for-approval sessions back to pending.
    async fn reset_stale_processing(&self) -> Result<StaleReset, DatabaseError>;

    // ── Conversation ────────────────────────────────────────────────

    async fn insert_session_message(
        &self,
        session_id: &str,
        sender_id: &str,
        author: MessageAuthor,
        content: &str,
        tool_calls: &[RecordedToolCall],
    ) -> Result<SessionMessage, DatabaseError>;

    /// Replace the recorded tool calls on an existing turn.
    async fn update_session_message_tool_calls(
        &self,
        message_id: &str,
        tool_calls: &[RecordedToolCall],
    ) -> Result<(), DatabaseError>;

    /// All turns for a session in insertion order.
    async fn list_session_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionMessage>, DatabaseError>;
}
