//! Durable session state and queue records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::ToolCall;

/// Lifecycle status of a session's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, no loop has picked it up yet.
    Pending,
    /// A processing loop owns the session.
    Running,
    /// Suspended on a followup question to the user.
    WaitingForApproval,
    Completed,
    /// Halted by a system error until explicitly resumed.
    Error,
    /// Halted by the user until explicitly resumed.
    Stopped,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// Same-status updates are always allowed so merges that only touch
    /// counters or context never fail.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        *self == target
            || matches!(
                (self, target),
                // From Pending
                (Pending, Running) | (Pending, Stopped) | (Pending, Error) |
                // From Running
                (Running, WaitingForApproval) | (Running, Completed) |
                (Running, Error) | (Running, Stopped) | (Running, Pending) |
                // From WaitingForApproval
                (WaitingForApproval, Running) | (WaitingForApproval, Error) |
                (WaitingForApproval, Stopped) |
                // Halted sessions can be resumed
                (Error, Running) | (Error, Stopped) |
                (Stopped, Running) |
                (Completed, Running) | (Completed, Stopped)
            )
    }

    /// Whether an iteration should be skipped for a session in this status.
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Parse a status string from the DB.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "waiting_for_approval" => Self::WaitingForApproval,
            "completed" => Self::Completed,
            "error" => Self::Error,
            "stopped" => Self::Stopped,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient per-iteration state, cleared once a tool call finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
    #[serde(default)]
    pub waiting_for_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Running totals across the whole session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    #[serde(default)]
    pub tools_executed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response_at: Option<DateTime<Utc>>,
}

impl ExecutionMetadata {
    pub fn record_usage(&mut self, input_tokens: u32, output_tokens: u32) {
        self.total_input_tokens += u64::from(input_tokens);
        self.total_output_tokens += u64::from(output_tokens);
    }
}

/// The durable per-session task row.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub id: String,
    pub session_id: String,
    pub status: TaskStatus,
    pub current_loop_count: u32,
    pub consecutive_mistake_count: u32,
    pub last_processed_message_id: Option<String>,
    pub processing_context: Option<ProcessingContext>,
    pub execution_metadata: ExecutionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A partial update merged into a [`TaskState`] under the store's write lock.
///
/// Counter increments are applied to the locked row, so concurrent
/// increments never lose updates.
#[derive(Debug, Clone, Default)]
pub struct TaskStateUpdate {
    pub status: Option<TaskStatus>,
    pub current_loop_count: Option<u32>,
    pub consecutive_mistake_count: Option<u32>,
    pub last_processed_message_id: Option<String>,
    /// `Some(None)` clears the context.
    pub processing_context: Option<Option<ProcessingContext>>,
    pub execution_metadata: Option<ExecutionMetadata>,
    pub increment_loop_count: bool,
    pub increment_mistake_count: bool,
}

impl TaskStateUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_processing_context(mut self, context: Option<ProcessingContext>) -> Self {
        self.processing_context = Some(context);
        self
    }

    pub fn with_execution_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.execution_metadata = Some(metadata);
        self
    }

    pub fn with_mistake_count(mut self, count: u32) -> Self {
        self.consecutive_mistake_count = Some(count);
        self
    }

    /// Apply to a row already read under the lock.
    pub fn apply(&self, state: &mut TaskState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(count) = self.current_loop_count {
            state.current_loop_count = count;
        }
        if self.increment_loop_count {
            state.current_loop_count += 1;
        }
        if let Some(count) = self.consecutive_mistake_count {
            state.consecutive_mistake_count = count;
        }
        if self.increment_mistake_count {
            state.consecutive_mistake_count += 1;
        }
        if let Some(id) = &self.last_processed_message_id {
            state.last_processed_message_id = Some(id.clone());
        }
        if let Some(context) = &self.processing_context {
            state.processing_context = context.clone();
        }
        if let Some(metadata) = &self.execution_metadata {
            state.execution_metadata = metadata.clone();
        }
    }
}

/// Status of a queued inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Processed,
    /// Terminal. Failed items are never retried automatically.
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            "processed" => Self::Processed,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound message waiting for (or done with) processing.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    /// Insertion sequence; claims follow this order.
    pub seq: i64,
    pub session_id: String,
    pub message_id: String,
    pub content: String,
    pub sender_id: String,
    pub status: QueueStatus,
    pub processing_attempts: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub processing_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue counts for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub oldest_unprocessed_at: Option<DateTime<Utc>>,
    pub newest_message_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.processed + self.failed
    }
}

/// Row counts touched by startup recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleReset {
    pub queue_items: u64,
    pub task_states: u64,
}
