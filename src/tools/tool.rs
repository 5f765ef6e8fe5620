//! The `Tool` trait and the types passed to and from tool execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::agent::events::ExecutionEvents;
pub use crate::error::ToolError;

/// Per-call context handed to a tool.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub team_id: String,
    pub user_id: String,
    /// Lets a tool surface events (such as a followup question) to the caller.
    pub events: Arc<dyn ExecutionEvents>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .field("team_id", &self.team_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// What a tool produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub output: String,
    /// The tool ran but reports failure; the text is surfaced to the model.
    pub is_error: bool,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            output: output.into(),
            is_error: false,
            duration,
        }
    }

    pub fn error(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            output: output.into(),
            is_error: true,
            duration,
        }
    }
}

/// How the processing loop proceeds after a tool has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterExecution {
    /// Queue a continuation directive.
    Continue,
    /// Continue only while the checklist has work left.
    ContinueIfTasksRemain,
    /// The task is done; report completion and stop iterating.
    Complete,
}

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the parameters object.
    fn parameters_schema(&self) -> serde_json::Value;

    fn after_execution(&self) -> AfterExecution {
        AfterExecution::Continue
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Extract a required, non-empty string parameter.
pub fn require_str<'a>(
    params: &'a serde_json::Value,
    tool: &str,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing required parameter '{key}'"),
        })
}

/// Extract an optional string parameter.
pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_rejects_missing_and_blank() {
        let params = json!({"query": "rust", "blank": "  "});
        assert_eq!(require_str(&params, "web_search", "query").unwrap(), "rust");
        assert!(matches!(
            require_str(&params, "web_search", "blank"),
            Err(ToolError::InvalidParameters { .. })
        ));
        assert!(require_str(&params, "web_search", "missing").is_err());
        assert_eq!(optional_str(&params, "blank"), None);
    }
}
