//! Callbacks fired by a session's processing loop.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::llm::ToolCall;
use crate::tools::tool::ToolOutput;

/// A suggested answer offered alongside a followup question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub answer: String,
    /// Mode the agent should switch to if this answer is picked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Observer of a session's execution. Every method defaults to a no-op.
pub trait ExecutionEvents: Send + Sync {
    /// A chunk of streamed assistant text.
    fn on_message(&self, _session_id: &str, _chunk: &str) {}

    fn on_tool_call(&self, _session_id: &str, _call: &ToolCall) {}

    fn on_tool_result(&self, _session_id: &str, _call: &ToolCall, _output: &ToolOutput) {}

    /// The agent called `attempt_completion`.
    fn on_complete(&self, _session_id: &str, _result: &str) {}

    /// The loop hit a system error and halted.
    fn on_error(&self, _session_id: &str, _error: &Error) {}

    fn on_followup_question(&self, _session_id: &str, _question: &str, _suggestions: &[Suggestion]) {
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl ExecutionEvents for NoopEvents {}

/// Owned form of an execution callback, for transport over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Message {
        session_id: String,
        chunk: String,
    },
    ToolCall {
        session_id: String,
        call: ToolCall,
    },
    ToolResult {
        session_id: String,
        call: ToolCall,
        output: String,
        is_error: bool,
    },
    Complete {
        session_id: String,
        result: String,
    },
    Error {
        session_id: String,
        message: String,
    },
    FollowupQuestion {
        session_id: String,
        question: String,
        suggestions: Vec<Suggestion>,
    },
}

/// Forwards every callback as an [`ExecutionEvent`] on an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ExecutionEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl ExecutionEvents for ChannelEvents {
    fn on_message(&self, session_id: &str, chunk: &str) {
        self.send(ExecutionEvent::Message {
            session_id: session_id.to_string(),
            chunk: chunk.to_string(),
        });
    }

    fn on_tool_call(&self, session_id: &str, call: &ToolCall) {
        self.send(ExecutionEvent::ToolCall {
            session_id: session_id.to_string(),
            call: call.clone(),
        });
    }

    fn on_tool_result(&self, session_id: &str, call: &ToolCall, output: &ToolOutput) {
        self.send(ExecutionEvent::ToolResult {
            session_id: session_id.to_string(),
            call: call.clone(),
            output: output.output.clone(),
            is_error: output.is_error,
        });
    }

    fn on_complete(&self, session_id: &str, result: &str) {
        self.send(ExecutionEvent::Complete {
            session_id: session_id.to_string(),
            result: result.to_string(),
        });
    }

    fn on_error(&self, session_id: &str, error: &Error) {
        self.send(ExecutionEvent::Error {
            session_id: session_id.to_string(),
            message: error.to_string(),
        });
    }

    fn on_followup_question(&self, session_id: &str, question: &str, suggestions: &[Suggestion]) {
        self.send(ExecutionEvent::FollowupQuestion {
            session_id: session_id.to_string(),
            question: question.to_string(),
            suggestions: suggestions.to_vec(),
        });
    }
}
