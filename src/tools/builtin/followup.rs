//! `ask_followup_question`: suspend the session until the user answers.

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;

use crate::agent::events::Suggestion;
use crate::store::MessageAuthor;
use crate::tasks::manager::TaskManager;
use crate::tasks::model::{TaskStateUpdate, TaskStatus};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, optional_str, require_str};

pub const ASK_FOLLOWUP_QUESTION: &str = "ask_followup_question";

static SUGGESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<suggest(?:\s+mode=["']([^"']+)["'])?[^>]*>([^<]+)</suggest>"#)
        .expect("suggestion regex is valid")
});

/// Parse `<suggest mode="...">answer</suggest>` entries.
pub fn parse_suggestions(follow_up: &str) -> Vec<Suggestion> {
    SUGGESTION
        .captures_iter(follow_up)
        .map(|caps| Suggestion {
            answer: caps[2].trim().to_string(),
            mode: caps.get(1).map(|m| m.as_str().to_string()),
        })
        .filter(|s| !s.answer.is_empty())
        .collect()
}

/// Asks the user a question and waits for the answer.
///
/// While waiting the session is `waiting_for_approval`. The answer is
/// stored as a user turn and the session returns to `running`.
pub struct AskFollowupQuestionTool {
    manager: Arc<TaskManager>,
}

impl AskFollowupQuestionTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }

    fn failed(reason: impl std::fmt::Display) -> ToolError {
        ToolError::ExecutionFailed {
            name: ASK_FOLLOWUP_QUESTION.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn set_waiting(&self, session_id: &str, waiting: bool) -> Result<(), ToolError> {
        let mut context = self
            .manager
            .get_task_state(session_id)
            .await
            .map_err(Self::failed)?
            .and_then(|s| s.processing_context)
            .unwrap_or_default();
        context.waiting_for_response = waiting;

        let status = if waiting {
            TaskStatus::WaitingForApproval
        } else {
            TaskStatus::Running
        };
        self.manager
            .update_task_state(
                session_id,
                TaskStateUpdate::status(status).with_processing_context(Some(context)),
            )
            .await
            .map_err(Self::failed)?;
        Ok(())
    }
}

#[async_trait]
impl Tool for AskFollowupQuestionTool {
    fn name(&self) -> &str {
        ASK_FOLLOWUP_QUESTION
    }

    fn description(&self) -> &str {
        "Ask the user a question when information needed to continue is missing \
         and cannot be found with other tools. Offer 2-4 suggested answers in \
         follow_up, each wrapped in <suggest></suggest>."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask the user"
                },
                "follow_up": {
                    "type": "string",
                    "description": "Suggested answers, e.g. <suggest>Yes</suggest><suggest mode=\"code\">Write it</suggest>"
                }
            },
            "required": ["question"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let question = require_str(&params, ASK_FOLLOWUP_QUESTION, "question")?;
        let suggestions = optional_str(&params, "follow_up")
            .map(parse_suggestions)
            .unwrap_or_default();

        let answer_rx = self.manager.followups().register(&ctx.session_id);
        if let Err(e) = self.set_waiting(&ctx.session_id, true).await {
            self.manager.followups().cancel(&ctx.session_id);
            return Err(e);
        }

        tracing::info!(session_id = %ctx.session_id, "Waiting for followup answer");
        ctx.events
            .on_followup_question(&ctx.session_id, question, &suggestions);

        let answer = answer_rx.await.map_err(|_| ToolError::Cancelled {
            name: ASK_FOLLOWUP_QUESTION.to_string(),
        })?;

        self.manager
            .store()
            .insert_session_message(
                &ctx.session_id,
                &ctx.user_id,
                MessageAuthor::User,
                &answer,
                &[],
            )
            .await
            .map_err(Self::failed)?;
        self.set_waiting(&ctx.session_id, false).await?;

        Ok(ToolOutput::text(
            format!("<answer>\n{answer}\n</answer>"),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Database, LibSqlBackend};
    use crate::tools::builtin::test_context;

    #[test]
    fn parses_suggestions_with_modes() {
        let suggestions = parse_suggestions(
            "<suggest>Blue</suggest>\n<suggest mode=\"code\">Write it</suggest><suggest> </suggest>",
        );
        assert_eq!(
            suggestions,
            vec![
                Suggestion {
                    answer: "Blue".into(),
                    mode: None
                },
                Suggestion {
                    answer: "Write it".into(),
                    mode: Some("code".into())
                },
            ]
        );
    }

    #[tokio::test]
    async fn waits_for_the_answer_and_records_it() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let manager = Arc::new(TaskManager::new(Arc::clone(&store)));
        let ctx = test_context();
        manager.initialize_task_state(&ctx.session_id).await.unwrap();
        manager
            .update_task_state(&ctx.session_id, TaskStateUpdate::status(TaskStatus::Running))
            .await
            .unwrap();

        let tool = AskFollowupQuestionTool::new(Arc::clone(&manager));
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            tool.execute(
                serde_json::json!({"question": "Which colour?"}),
                &task_ctx,
            )
            .await
        });

        // Wait until the tool is parked on the broker.
        for _ in 0..200 {
            if manager.followups().is_waiting(&ctx.session_id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let state = manager.get_task_state(&ctx.session_id).await.unwrap().unwrap();
        assert_eq!(state.status, TaskStatus::WaitingForApproval);
        assert!(state.processing_context.unwrap().waiting_for_response);

        assert!(manager.followups().submit_answer(&ctx.session_id, "Green"));
        let output = handle.await.unwrap().unwrap();
        assert_eq!(output.output, "<answer>\nGreen\n</answer>");

        let state = manager.get_task_state(&ctx.session_id).await.unwrap().unwrap();
        assert_eq!(state.status, TaskStatus::Running);
        let messages = store.list_session_messages(&ctx.session_id).await.unwrap();
        assert_eq!(messages.last().unwrap().content, "Green");
        assert_eq!(messages.last().unwrap().author, MessageAuthor::User);
    }
}
