//! Session-level service: owns the live execution contexts and exposes the
//! operations callers use to drive sessions.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::agent::events::{ExecutionEvents, Suggestion};
use crate::agent::execution::{ExecutionContext, ExecutionDeps, SessionInfo};
use crate::config::AgentProfile;
use crate::error::{Error, TaskError};
use crate::llm::ToolCall;
use crate::store::MessageAuthor;
use crate::tasks::{QueueItem, QueueStats, TaskState, TaskStateUpdate, TaskStatus};
use crate::tools::ToolOutput;

const CHARS_PER_TOKEN: usize = 4;
const NEAR_LIMIT_RATIO: f64 = 0.8;
const OVER_LIMIT_RATIO: f64 = 0.95;

/// Result of [`AgentService::resume_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOutcome {
    Resumed,
    AlreadyActive,
    NothingQueued,
    /// Not started or recovered by this process.
    UnknownSession,
}

/// What a caller should do about a session's context size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextAction {
    Normal,
    ApproachingLimit,
    ContextLimitReached,
}

/// Rough size of a session's conversation relative to the model's window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextUsage {
    pub message_count: usize,
    pub estimated_tokens: usize,
    pub context_window: usize,
    pub usage_ratio: f64,
    /// Above 80% of the window.
    pub near_limit: bool,
    /// Above 95% of the window.
    pub over_limit: bool,
    pub can_accept_new_messages: bool,
    pub recommended_action: ContextAction,
}

impl ContextUsage {
    fn new(message_count: usize, estimated_tokens: usize, context_window: usize) -> Self {
        let usage_ratio = if context_window == 0 {
            1.0
        } else {
            estimated_tokens as f64 / context_window as f64
        };
        let near_limit = usage_ratio > NEAR_LIMIT_RATIO;
        let over_limit = usage_ratio > OVER_LIMIT_RATIO;
        let recommended_action = if over_limit {
            ContextAction::ContextLimitReached
        } else if near_limit {
            ContextAction::ApproachingLimit
        } else {
            ContextAction::Normal
        };
        Self {
            message_count,
            estimated_tokens,
            context_window,
            usage_ratio,
            near_limit,
            over_limit,
            can_accept_new_messages: !over_limit,
            recommended_action,
        }
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Whether a new message still fits in a session's context window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionCheck {
    pub can_submit: bool,
    pub reason: Option<String>,
    /// Usage with the new message included. `None` when the session could
    /// not be measured.
    pub projected: Option<ContextUsage>,
}

impl SubmissionCheck {
    /// Project `content` onto `usage`. Refused above 95% of the window.
    pub fn project(usage: &ContextUsage, content: &str) -> Self {
        let projected = ContextUsage::new(
            usage.message_count + 1,
            usage.estimated_tokens + estimate_tokens(content),
            usage.context_window,
        );
        let can_submit = projected.usage_ratio <= OVER_LIMIT_RATIO;
        Self {
            can_submit,
            reason: (!can_submit).then(|| {
                "Adding this message would exceed the context limit. Please start a new session."
                    .to_string()
            }),
            projected: Some(projected),
        }
    }
}

/// What is needed to rebuild a session's context.
#[derive(Clone)]
struct SessionRecord {
    info: SessionInfo,
    profile: AgentProfile,
    events: Arc<dyn ExecutionEvents>,
}

type LiveContexts = RwLock<HashMap<String, Arc<ExecutionContext>>>;

/// Forwards events and drops the context from the live registry when it errors.
struct ServiceEvents {
    inner: Arc<dyn ExecutionEvents>,
    live: Weak<LiveContexts>,
}

impl ExecutionEvents for ServiceEvents {
    fn on_message(&self, session_id: &str, chunk: &str) {
        self.inner.on_message(session_id, chunk);
    }

    fn on_tool_call(&self, session_id: &str, call: &ToolCall) {
        self.inner.on_tool_call(session_id, call);
    }

    fn on_tool_result(&self, session_id: &str, call: &ToolCall, output: &ToolOutput) {
        self.inner.on_tool_result(session_id, call, output);
    }

    fn on_complete(&self, session_id: &str, result: &str) {
        self.inner.on_complete(session_id, result);
    }

    fn on_error(&self, session_id: &str, error: &Error) {
        if let Some(live) = self.live.upgrade() {
            live.write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(session_id);
        }
        self.inner.on_error(session_id, error);
    }

    fn on_followup_question(&self, session_id: &str, question: &str, suggestions: &[Suggestion]) {
        self.inner
            .on_followup_question(session_id, question, suggestions);
    }
}

/// Entry point for running persistent agent sessions.
pub struct AgentService {
    deps: ExecutionDeps,
    poll_interval: Duration,
    live: Arc<LiveContexts>,
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl AgentService {
    pub fn new(deps: ExecutionDeps, poll_interval: Duration) -> Self {
        Self {
            deps,
            poll_interval,
            live: Arc::new(RwLock::new(HashMap::new())),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session for `user_id`, queue the first message and start it.
    /// Returns the new session id.
    pub async fn start_new_session(
        &self,
        profile: AgentProfile,
        user_id: &str,
        initial_message: &str,
        events: Arc<dyn ExecutionEvents>,
    ) -> Result<String, Error> {
        let info = SessionInfo {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            team_id: profile.team_id.clone(),
        };
        let session_id = info.session_id.clone();
        let context = self.attach(SessionRecord {
            info,
            profile,
            events,
        });
        context.start(initial_message).await?;
        info!(session_id = %session_id, user_id, "Session started");
        Ok(session_id)
    }

    /// Queue a user message. Goes through the live context when there is
    /// one; otherwise the turn is persisted and queued directly and will be
    /// picked up once the session is resumed.
    pub async fn submit_user_message(
        &self,
        session_id: &str,
        content: &str,
        sender_id: &str,
    ) -> Result<QueueItem, Error> {
        if let Some(context) = self.live_context(session_id) {
            return context.queue_message(content, sender_id).await;
        }

        let manager = &self.deps.manager;
        if manager.get_task_state(session_id).await?.is_none() {
            return Err(TaskError::SessionNotFound {
                session_id: session_id.to_string(),
            }
            .into());
        }
        let message = manager
            .store()
            .insert_session_message(session_id, sender_id, MessageAuthor::User, content, &[])
            .await?;
        Ok(manager
            .queue_message(session_id, &message.id, content, sender_id)
            .await?)
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<(), Error> {
        if let Some(context) = self.live_context(session_id) {
            return context.stop().await;
        }
        let manager = &self.deps.manager;
        if manager.get_task_state(session_id).await?.is_none() {
            return Err(TaskError::SessionNotFound {
                session_id: session_id.to_string(),
            }
            .into());
        }
        manager.followups().cancel(session_id);
        manager
            .update_task_state(session_id, TaskStateUpdate::status(TaskStatus::Stopped))
            .await?;
        Ok(())
    }

    /// Restart polling for a session that has queued work.
    pub async fn resume_session(&self, session_id: &str) -> Result<ResumeOutcome, Error> {
        let context = match self.live_context(session_id) {
            Some(context) if context.is_active() => return Ok(ResumeOutcome::AlreadyActive),
            Some(context) => context,
            None => {
                let record = self
                    .records
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(session_id)
                    .cloned();
                match record {
                    Some(record) => self.attach(record),
                    None => return Ok(ResumeOutcome::UnknownSession),
                }
            }
        };

        if !self.deps.manager.has_pending_messages(session_id).await? {
            return Ok(ResumeOutcome::NothingQueued);
        }
        context.resume_processing();
        Ok(ResumeOutcome::Resumed)
    }

    /// Restart the sessions a previous process left running.
    ///
    /// `resolve` supplies the owner and profile for a session id; sessions it
    /// cannot resolve stay pending. Returns the ids that were resumed.
    pub async fn recover_on_startup<F>(
        &self,
        resolve: F,
        events: Arc<dyn ExecutionEvents>,
    ) -> Result<Vec<String>, Error>
    where
        F: Fn(&str) -> Option<(SessionInfo, AgentProfile)>,
    {
        let manager = &self.deps.manager;
        let sessions = manager.get_sessions_to_resume().await?;
        manager.cleanup_stale_processing_states().await?;

        let mut resumed = Vec::with_capacity(sessions.len());
        for session_id in sessions {
            let Some((info, profile)) = resolve(&session_id) else {
                warn!(session_id = %session_id, "Cannot resolve session owner, left pending");
                continue;
            };
            let context = self.attach(SessionRecord {
                info,
                profile,
                events: Arc::clone(&events),
            });
            context.resume_processing();
            resumed.push(session_id);
        }
        info!(count = resumed.len(), "Sessions recovered");
        Ok(resumed)
    }

    pub async fn get_session_task_status(&self, session_id: &str) -> Result<Option<TaskState>, Error> {
        Ok(self.deps.manager.get_task_state(session_id).await?)
    }

    pub async fn get_session_queue_info(&self, session_id: &str) -> Result<QueueStats, Error> {
        Ok(self.deps.manager.queue_stats(session_id).await?)
    }

    /// Estimate (about four characters per token, rounded up per turn) how
    /// full the model's context window is for this session.
    pub async fn session_context_usage(&self, session_id: &str) -> Result<ContextUsage, Error> {
        let messages = self
            .deps
            .manager
            .store()
            .list_session_messages(session_id)
            .await?;
        let estimated_tokens: usize = messages
            .iter()
            .map(|m| {
                estimate_tokens(&m.content)
                    + m.tool_calls
                        .iter()
                        .map(|c| {
                            estimate_tokens(&c.arguments.to_string())
                                + c.result.as_ref().map_or(0, |r| estimate_tokens(&r.output))
                        })
                        .sum::<usize>()
            })
            .sum();

        let context_window = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map_or_else(
                || AgentProfile::default().context_window_tokens,
                |r| r.profile.context_window_tokens,
            );
        Ok(ContextUsage::new(messages.len(), estimated_tokens, context_window))
    }

    /// Check that `content` fits in the session's context before submitting
    /// it. If usage cannot be measured the message is allowed.
    pub async fn validate_message_submission(&self, session_id: &str, content: &str) -> SubmissionCheck {
        match self.session_context_usage(session_id).await {
            Ok(usage) => {
                let check = SubmissionCheck::project(&usage, content);
                if !check.can_submit {
                    warn!(session_id, estimated_tokens = usage.estimated_tokens, "Message refused, context limit reached");
                }
                check
            }
            Err(e) => {
                warn!(session_id, error = %e, "Context validation failed");
                SubmissionCheck {
                    can_submit: true,
                    reason: Some("Context validation unavailable, proceeding with caution".to_string()),
                    projected: None,
                }
            }
        }
    }

    pub fn submit_followup_answer(&self, session_id: &str, answer: &str) -> Result<(), TaskError> {
        if self
            .deps
            .manager
            .followups()
            .submit_answer(session_id, answer)
        {
            Ok(())
        } else {
            Err(TaskError::NotWaiting {
                session_id: session_id.to_string(),
            })
        }
    }

    pub fn is_waiting_for_followup(&self, session_id: &str) -> bool {
        self.deps.manager.followups().is_waiting(session_id)
    }

    /// Ids of sessions whose loop is running in this process, sorted.
    pub fn active_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.is_active())
            .map(|c| c.session_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    fn live_context(&self, session_id: &str) -> Option<Arc<ExecutionContext>> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Build a context for `record` and put it in the live registry.
    fn attach(&self, record: SessionRecord) -> Arc<ExecutionContext> {
        let session_id = record.info.session_id.clone();
        let events: Arc<dyn ExecutionEvents> = Arc::new(ServiceEvents {
            inner: Arc::clone(&record.events),
            live: Arc::downgrade(&self.live),
        });
        let context = ExecutionContext::new(
            record.info.clone(),
            record.profile.clone(),
            self.deps.clone(),
            events,
            self.poll_interval,
        );
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), record);
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, Arc::clone(&context));
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_usage_thresholds() {
        let usage = ContextUsage::new(3, 100, 1000);
        assert!(!usage.near_limit);
        assert_eq!(usage.recommended_action, ContextAction::Normal);

        let usage = ContextUsage::new(3, 825, 1000);
        assert!(usage.near_limit && !usage.over_limit);
        assert!(usage.can_accept_new_messages);
        assert_eq!(usage.recommended_action, ContextAction::ApproachingLimit);

        // Exactly 95% is still accepted.
        let usage = ContextUsage::new(3, 950, 1000);
        assert!(!usage.over_limit);

        let usage = ContextUsage::new(3, 951, 1000);
        assert!(usage.over_limit);
        assert!(!usage.can_accept_new_messages);
        assert_eq!(usage.recommended_action, ContextAction::ContextLimitReached);

        assert!(ContextUsage::new(0, 0, 0).over_limit);
    }

    #[test]
    fn submission_is_refused_past_ninety_five_percent() {
        let usage = ContextUsage::new(4, 940, 1000);

        // 40 chars = 10 tokens, landing exactly on 95%.
        let check = SubmissionCheck::project(&usage, &"a".repeat(40));
        assert!(check.can_submit);
        assert_eq!(check.reason, None);
        let projected = check.projected.unwrap();
        assert_eq!(projected.estimated_tokens, 950);
        assert_eq!(projected.message_count, 5);

        let check = SubmissionCheck::project(&usage, &"a".repeat(41));
        assert!(!check.can_submit);
        assert!(check.reason.unwrap().contains("exceed the context limit"));
        assert_eq!(check.projected.unwrap().estimated_tokens, 951);
    }

    #[test]
    fn tokens_round_up_per_text() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
