//! `attempt_completion`: the agent presents its final result.

use std::time::Instant;

use async_trait::async_trait;

use crate::tools::tool::{AfterExecution, Tool, ToolContext, ToolError, ToolOutput, require_str};

pub const ATTEMPT_COMPLETION: &str = "attempt_completion";

/// Ends the current task with a result for the user.
pub struct AttemptCompletionTool;

#[async_trait]
impl Tool for AttemptCompletionTool {
    fn name(&self) -> &str {
        ATTEMPT_COMPLETION
    }

    fn description(&self) -> &str {
        "Present the final result of the task to the user. Call this once the \
         request is fully handled. The result should be complete and should not \
         end with a question or an offer of further help."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "The final result of the task"
                }
            },
            "required": ["result"]
        })
    }

    fn after_execution(&self) -> AfterExecution {
        AfterExecution::Complete
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let result = require_str(&params, ATTEMPT_COMPLETION, "result")?;
        Ok(ToolOutput::text(
            format!("Task completed: {result}"),
            start.elapsed(),
        ))
    }
}
