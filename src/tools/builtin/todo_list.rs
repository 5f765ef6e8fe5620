//! `update_todo_list`: the agent rewrites its markdown checklist.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::tasks::analyzer::{TaskStateAnalyzer, TodoStatus};
use crate::tools::tool::{AfterExecution, Tool, ToolContext, ToolError, ToolOutput, require_str};

pub const UPDATE_TODO_LIST: &str = "update_todo_list";

/// Replaces the session's checklist and refreshes the analyzer cache.
pub struct UpdateTodoListTool {
    analyzer: Arc<TaskStateAnalyzer>,
}

impl UpdateTodoListTool {
    pub fn new(analyzer: Arc<TaskStateAnalyzer>) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl Tool for UpdateTodoListTool {
    fn name(&self) -> &str {
        UPDATE_TODO_LIST
    }

    fn description(&self) -> &str {
        "Replace the todo list for the current task with a markdown checklist. \
         Send the full list every time. Use [ ] for pending, [-] for in progress \
         and [x] for completed items, one item per line."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "string",
                    "description": "Full markdown checklist, e.g. \"[x] research\\n[-] draft\\n[ ] review\""
                }
            },
            "required": ["todos"]
        })
    }

    fn after_execution(&self) -> AfterExecution {
        AfterExecution::ContinueIfTasksRemain
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let todos = require_str(&params, UPDATE_TODO_LIST, "todos")?;
        let state = self
            .analyzer
            .update_session_task_state(&ctx.session_id, todos);

        if state.todos.is_empty() {
            return Ok(ToolOutput::error(
                "No checklist items found. Use one item per line: '[ ] task', '[-] task' or '[x] task'.",
                start.elapsed(),
            ));
        }

        let count = |status: TodoStatus| state.todos.iter().filter(|t| t.status == status).count();
        Ok(ToolOutput::text(
            format!(
                "Todo list updated: {} items ({} completed, {} in progress, {} pending). {}",
                state.todos.len(),
                count(TodoStatus::Completed),
                count(TodoStatus::InProgress),
                count(TodoStatus::Pending),
                state.action_message
            ),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::analyzer::NextAction;
    use crate::tools::builtin::test_context;

    #[tokio::test]
    async fn updates_the_session_cache() {
        let analyzer = Arc::new(TaskStateAnalyzer::new());
        let tool = UpdateTodoListTool::new(Arc::clone(&analyzer));
        let ctx = test_context();

        let output = tool
            .execute(
                serde_json::json!({"todos": "[x] research\n[ ] write"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(!output.is_error);
        assert!(output.output.contains("2 items (1 completed, 0 in progress, 1 pending)"));

        let state = analyzer.get_session_task_state(&ctx.session_id).unwrap();
        assert_eq!(state.next_action, NextAction::StartNextTask);
        assert!(analyzer.should_continue_execution(&ctx.session_id));
    }

    #[tokio::test]
    async fn empty_checklist_is_reported() {
        let analyzer = Arc::new(TaskStateAnalyzer::new());
        let tool = UpdateTodoListTool::new(analyzer);
        let output = tool
            .execute(serde_json::json!({"todos": "just prose"}), &test_context())
            .await
            .unwrap();
        assert!(output.is_error);
    }
}
