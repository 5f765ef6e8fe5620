//! Per-session execution context: the polling loop that drains a session's
//! durable queue and runs one model turn per claimed message.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::events::ExecutionEvents;
use crate::agent::history::{latest_todo_markdown, rebuild_history};
use crate::agent::parser::parse_inline_tool_calls;
use crate::agent::prompt::{
    GENERIC_CONTINUATION, MULTIPLE_TOOLS_USED, NO_TOOL_USED, build_system_prompt,
};
use crate::config::AgentProfile;
use crate::error::{Error, TaskError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, ToolCall, collect_turn};
use crate::store::{MessageAuthor, RecordedToolCall};
use crate::tasks::analyzer::generate_continuation_message;
use crate::tasks::{
    ExecutionMetadata, ProcessingContext, QueueItem, TaskManager, TaskStateAnalyzer,
    TaskStateUpdate, TaskStatus,
};
use crate::tools::{AfterExecution, ToolContext, ToolOutput, ToolRegistry};

/// Sender id of assistant-authored turns. Queue items from this sender
/// never trigger an iteration.
pub const ASSISTANT_SENDER: &str = "assistant";
/// Sender id of injected directives.
pub const SYSTEM_SENDER: &str = "system";

/// Who a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub team_id: String,
}

/// Shared components every execution context uses.
#[derive(Clone)]
pub struct ExecutionDeps {
    pub manager: Arc<TaskManager>,
    pub llm: Arc<dyn LlmProvider>,
    pub tools: Arc<ToolRegistry>,
    pub analyzer: Arc<TaskStateAnalyzer>,
}

/// What one claimed queue item led to. Stored as the item's processing result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IterationOutcome {
    /// Assistant-authored item, marked processed without a model turn.
    Skipped,
    /// The session is stopped or errored.
    Halted,
    NoToolCall,
    MultipleToolCalls { count: usize },
    ToolExecuted {
        tool: String,
        is_error: bool,
        continued: bool,
    },
    /// `attempt_completion` ran. The session stays running.
    Completed { result: String },
}

/// Drives one session: owns its polling task and control surface.
pub struct ExecutionContext {
    session: SessionInfo,
    profile: AgentProfile,
    deps: ExecutionDeps,
    events: Arc<dyn ExecutionEvents>,
    poll_interval: Duration,
    cancel: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionContext {
    pub fn new(
        session: SessionInfo,
        profile: AgentProfile,
        deps: ExecutionDeps,
        events: Arc<dyn ExecutionEvents>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            profile,
            deps,
            events,
            poll_interval,
            cancel: Mutex::new(CancellationToken::new()),
            handle: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Initialize the session, queue `initial_message` and start polling
    /// unless the loop is already running.
    pub async fn start(self: &Arc<Self>, initial_message: &str) -> Result<QueueItem, Error> {
        self.deps
            .manager
            .initialize_task_state(self.session_id())
            .await?;
        let item = self
            .enqueue(initial_message, &self.session.user_id, MessageAuthor::User)
            .await?;
        if !self.is_active() {
            self.spawn_loop();
        }
        Ok(item)
    }

    /// Persist a user turn and queue it for processing.
    pub async fn queue_message(&self, content: &str, sender_id: &str) -> Result<QueueItem, Error> {
        self.enqueue(content, sender_id, MessageAuthor::User).await
    }

    /// Re-enter the polling loop without sending a message.
    pub fn resume_processing(self: &Arc<Self>) {
        if self.is_active() {
            debug!(session_id = %self.session_id(), "Resume ignored, loop already running");
            return;
        }
        info!(session_id = %self.session_id(), "Resuming session");
        self.spawn_loop();
    }

    /// Stop polling and mark the session stopped.
    ///
    /// Cooperative: an iteration already in flight finishes first, but a
    /// pending followup wait is cancelled right away.
    pub async fn stop(&self) -> Result<(), Error> {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        let manager = &self.deps.manager;
        manager.followups().cancel(self.session_id());
        manager.unregister_processor(self.session_id());
        manager
            .update_task_state(self.session_id(), TaskStateUpdate::status(TaskStatus::Stopped))
            .await?;
        info!(session_id = %self.session_id(), "Session stopped");
        Ok(())
    }

    /// Deliver the answer to a pending `ask_followup_question`.
    pub fn submit_followup_answer(&self, answer: &str) -> Result<(), TaskError> {
        if self
            .deps
            .manager
            .followups()
            .submit_answer(self.session_id(), answer)
        {
            Ok(())
        } else {
            Err(TaskError::NotWaiting {
                session_id: self.session_id().to_string(),
            })
        }
    }

    pub fn is_waiting_for_followup(&self) -> bool {
        self.deps.manager.followups().is_waiting(self.session_id())
    }

    /// Whether this context's polling loop is live.
    pub fn is_active(&self) -> bool {
        !self.is_cancelled()
            && self
                .handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_cancelled()
    }

    fn spawn_loop(self: &Arc<Self>) {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = handle.take();
        *handle = Some(tokio::spawn(Arc::clone(self).run(token, previous)));
    }

    /// The polling loop. Waits for this context's previous loop to exit so
    /// two loops never overlap.
    async fn run(self: Arc<Self>, cancel: CancellationToken, previous: Option<JoinHandle<()>>) {
        let session_id = self.session_id().to_string();
        let manager = Arc::clone(&self.deps.manager);
        if let Some(previous) = previous {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = previous => {}
            }
        }
        if cancel.is_cancelled() {
            debug!(session_id = %session_id, "Stopped before the processing loop started");
            return;
        }
        let Some(lease) = manager.register_processor(&session_id) else {
            debug!(session_id = %session_id, "Session already has a local processor");
            return;
        };
        if cancel.is_cancelled() {
            return;
        }

        if let Err(e) = manager
            .update_task_state(&session_id, TaskStateUpdate::status(TaskStatus::Running))
            .await
        {
            let error = Error::from(e);
            self.halt(None, &error).await;
            drop(lease);
            self.events.on_error(&session_id, &error);
            return;
        }
        // stop() may have landed while the status update was in flight.
        if cancel.is_cancelled() {
            if let Err(e) = manager
                .update_task_state(&session_id, TaskStateUpdate::status(TaskStatus::Stopped))
                .await
            {
                warn!(session_id = %session_id, error = %e, "Could not restore stopped status");
            }
            return;
        }

        let mut wake = manager.subscribe();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(session_id = %session_id, generation = lease.generation(), interval_ms = self.poll_interval.as_millis() as u64, "Processing loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                event = wake.recv() => match event {
                    Ok(event) if event.session_id != session_id => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
            if cancel.is_cancelled() {
                break;
            }
            if let Err(error) = self.try_process_next().await {
                // The claim is released before on_error fires.
                drop(lease);
                self.events.on_error(&session_id, &error);
                return;
            }
        }
        debug!(session_id = %session_id, "Processing loop exited");
    }

    /// Claim and process the session's next queued message, if any.
    ///
    /// A system error halts the session: status becomes `error`, the item
    /// is marked failed and `on_error` fires before the error is returned.
    pub async fn process_next(&self) -> Result<Option<IterationOutcome>, Error> {
        let result = self.try_process_next().await;
        if let Err(error) = &result {
            self.events.on_error(self.session_id(), error);
        }
        result
    }

    async fn try_process_next(&self) -> Result<Option<IterationOutcome>, Error> {
        let item = match self
            .deps
            .manager
            .get_next_message_to_process(self.session_id())
            .await
        {
            Ok(Some(item)) => item,
            Ok(None) => return Ok(None),
            Err(e) => {
                let error = Error::from(e);
                self.halt(None, &error).await;
                return Err(error);
            }
        };

        match self.process_item(&item).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(error) => {
                self.halt(Some(&item), &error).await;
                Err(error)
            }
        }
    }

    async fn process_item(&self, item: &QueueItem) -> Result<IterationOutcome, Error> {
        let manager = &self.deps.manager;
        if item.sender_id == ASSISTANT_SENDER {
            manager.mark_message_processed(&item.id, None, None).await?;
            return Ok(IterationOutcome::Skipped);
        }

        debug!(session_id = %self.session_id(), queue_item_id = %item.id, seq = item.seq, "Processing message");
        let outcome = self.run_iteration().await?;
        let update = TaskStateUpdate {
            increment_loop_count: true,
            last_processed_message_id: Some(item.id.clone()),
            ..Default::default()
        };
        let result = serde_json::to_value(&outcome).ok();
        manager
            .mark_message_processed(&item.id, result, Some(update))
            .await?;
        Ok(outcome)
    }

    async fn run_iteration(&self) -> Result<IterationOutcome, Error> {
        let session_id = self.session_id();
        let manager = &self.deps.manager;
        let state = manager.initialize_task_state(session_id).await?;
        if state.status.is_halted() {
            debug!(session_id = %session_id, status = %state.status, "Iteration skipped");
            return Ok(IterationOutcome::Halted);
        }

        let messages = manager.store().list_session_messages(session_id).await?;
        if self.deps.analyzer.get_session_task_state(session_id).is_none()
            && let Some(markdown) = latest_todo_markdown(&messages)
        {
            self.deps
                .analyzer
                .update_session_task_state(session_id, &markdown);
        }

        let mut chat = vec![ChatMessage::system(build_system_prompt(
            self.profile.system_prompt.as_deref(),
            &messages,
        ))];
        chat.extend(rebuild_history(&messages));

        let tools = self
            .deps
            .tools
            .tool_definitions_for_agent(self.profile.allowed_tools.as_deref())
            .await;
        let tool_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
        let request = CompletionRequest {
            model: self.profile.model.clone(),
            messages: chat,
            tools,
            temperature: self.profile.temperature,
            max_tokens: self.profile.max_tokens,
        };

        let stream = self.deps.llm.stream_completion(request).await?;
        let events = Arc::clone(&self.events);
        let turn = collect_turn(stream, |chunk| events.on_message(session_id, chunk)).await?;

        let mut metadata = state.execution_metadata;
        metadata.record_usage(turn.usage.input_tokens, turn.usage.output_tokens);

        let (text, calls) = if turn.tool_calls.is_empty() {
            let parsed = parse_inline_tool_calls(&turn.text, &tool_names);
            (parsed.text, parsed.tool_calls)
        } else {
            (turn.text.trim().to_string(), turn.tool_calls)
        };

        if calls.len() > 1 {
            let count = calls.len();
            if !text.is_empty() {
                self.persist_assistant_turn(&text, &[]).await?;
            }
            self.record_mistake(metadata, MULTIPLE_TOOLS_USED).await?;
            warn!(session_id = %session_id, count, "Assistant turn had several tool calls, none executed");
            return Ok(IterationOutcome::MultipleToolCalls { count });
        }
        let Some(call) = calls.into_iter().next() else {
            if !text.is_empty() {
                self.persist_assistant_turn(&text, &[]).await?;
            }
            self.record_mistake(metadata, NO_TOOL_USED).await?;
            warn!(session_id = %session_id, "Assistant turn had no tool call");
            return Ok(IterationOutcome::NoToolCall);
        };

        self.execute_call(call, text, metadata).await
    }

    async fn execute_call(
        &self,
        call: ToolCall,
        text: String,
        mut metadata: ExecutionMetadata,
    ) -> Result<IterationOutcome, Error> {
        let session_id = self.session_id();
        let manager = &self.deps.manager;

        let recorded = RecordedToolCall::pending(&call);
        let turn = self
            .persist_assistant_turn(&text, std::slice::from_ref(&recorded))
            .await?;
        let context = ProcessingContext {
            current_tool_call: Some(call.clone()),
            last_response: (!text.is_empty()).then(|| text.clone()),
            ..Default::default()
        };
        manager
            .update_task_state(
                session_id,
                TaskStateUpdate::default().with_processing_context(Some(context)),
            )
            .await?;

        self.events.on_tool_call(session_id, &call);
        info!(session_id = %session_id, tool = %call.name, "Executing tool");
        let (output, after) = self.execute_tool(&call).await;

        manager
            .store()
            .update_session_message_tool_calls(
                &turn,
                &[recorded.with_result(output.output.clone(), output.is_error)],
            )
            .await?;
        let summary = if output.is_error {
            format!("[{}] ERROR: {}", call.name, output.output)
        } else {
            format!("[{}] {}", call.name, output.output)
        };
        self.persist_assistant_turn(&summary, &[]).await?;
        self.events.on_tool_result(session_id, &call, &output);

        metadata.tools_executed.push(call.name.clone());
        let completed = after == AfterExecution::Complete && !output.is_error;
        if completed {
            metadata.last_response_at = Some(Utc::now());
        }
        manager
            .update_task_state(
                session_id,
                TaskStateUpdate::default()
                    .with_processing_context(None)
                    .with_mistake_count(0)
                    .with_execution_metadata(metadata),
            )
            .await?;

        if completed {
            let result = call
                .arguments
                .get("result")
                .and_then(|v| v.as_str())
                .unwrap_or(output.output.as_str())
                .to_string();
            info!(session_id = %session_id, "Task completed");
            self.events.on_complete(session_id, &result);
            return Ok(IterationOutcome::Completed { result });
        }

        let continued = !self.is_cancelled()
            && match after {
                _ if output.is_error => true,
                AfterExecution::ContinueIfTasksRemain => {
                    self.deps.analyzer.should_continue_execution(session_id)
                }
                AfterExecution::Continue | AfterExecution::Complete => true,
            };
        if continued {
            let directive = self
                .deps
                .analyzer
                .get_session_task_state(session_id)
                .filter(|state| !state.todos.is_empty())
                .map(|state| generate_continuation_message(&state))
                .unwrap_or_else(|| GENERIC_CONTINUATION.to_string());
            self.enqueue(&directive, SYSTEM_SENDER, MessageAuthor::System)
                .await?;
        }

        Ok(IterationOutcome::ToolExecuted {
            tool: call.name,
            is_error: output.is_error,
            continued,
        })
    }

    /// Run a tool. Failures become error outputs the model can react to.
    async fn execute_tool(&self, call: &ToolCall) -> (ToolOutput, AfterExecution) {
        let start = Instant::now();
        let tools = &self.deps.tools;
        let tool = match tools.get(&call.name).await {
            Some(tool)
                if tools
                    .is_enabled(&call.name, self.profile.allowed_tools.as_deref())
                    .await =>
            {
                tool
            }
            _ => {
                warn!(session_id = %self.session_id(), tool = %call.name, "Model called an unavailable tool");
                return (
                    ToolOutput::error(
                        format!("Tool '{}' is not available", call.name),
                        start.elapsed(),
                    ),
                    AfterExecution::Continue,
                );
            }
        };

        let ctx = ToolContext {
            session_id: self.session.session_id.clone(),
            team_id: self.session.team_id.clone(),
            user_id: self.session.user_id.clone(),
            events: Arc::clone(&self.events),
        };
        let output = match tool.execute(call.arguments.clone(), &ctx).await {
            Ok(output) => output,
            Err(e) => {
                warn!(session_id = %self.session_id(), tool = %call.name, error = %e, "Tool failed");
                ToolOutput::error(
                    format!("Error executing {}: {e}", call.name),
                    start.elapsed(),
                )
            }
        };
        debug!(
            session_id = %self.session_id(),
            tool = %call.name,
            is_error = output.is_error,
            duration_ms = output.duration.as_millis() as u64,
            "Tool finished"
        );
        (output, tool.after_execution())
    }

    async fn record_mistake(
        &self,
        metadata: ExecutionMetadata,
        directive: &str,
    ) -> Result<(), Error> {
        let update = TaskStateUpdate {
            increment_mistake_count: true,
            ..Default::default()
        }
        .with_execution_metadata(metadata);
        self.deps
            .manager
            .update_task_state(self.session_id(), update)
            .await?;
        self.enqueue(directive, SYSTEM_SENDER, MessageAuthor::System)
            .await?;
        Ok(())
    }

    /// Persist an assistant turn and return its message id.
    async fn persist_assistant_turn(
        &self,
        content: &str,
        tool_calls: &[RecordedToolCall],
    ) -> Result<String, Error> {
        let message = self
            .deps
            .manager
            .store()
            .insert_session_message(
                self.session_id(),
                ASSISTANT_SENDER,
                MessageAuthor::Assistant,
                content,
                tool_calls,
            )
            .await?;
        Ok(message.id)
    }

    async fn enqueue(
        &self,
        content: &str,
        sender_id: &str,
        author: MessageAuthor,
    ) -> Result<QueueItem, Error> {
        let manager = &self.deps.manager;
        let message = manager
            .store()
            .insert_session_message(self.session_id(), sender_id, author, content, &[])
            .await?;
        let item = manager
            .queue_message(self.session_id(), &message.id, content, sender_id)
            .await?;
        Ok(item)
    }

    /// Record a system error: status `error` and the item failed.
    async fn halt(&self, item: Option<&QueueItem>, error: &Error) {
        let session_id = self.session_id();
        tracing::error!(session_id = %session_id, error = %error, "Session halted");
        let manager = &self.deps.manager;

        let context = ProcessingContext {
            error_message: Some(error.to_string()),
            ..Default::default()
        };
        if let Err(e) = manager
            .update_task_state(
                session_id,
                TaskStateUpdate::status(TaskStatus::Error).with_processing_context(Some(context)),
            )
            .await
        {
            warn!(session_id = %session_id, error = %e, "Could not record error status");
        }
        if let Some(item) = item
            && let Err(e) = manager.mark_message_failed(&item.id, &error.to_string()).await
        {
            warn!(session_id = %session_id, queue_item_id = %item.id, error = %e, "Could not mark message failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::NoopEvents;
    use crate::error::LlmError;
    use crate::llm::{CompletionStream, StreamEvent};
    use crate::store::{Database, LibSqlBackend};
    use crate::tasks::QueueStatus;
    use crate::tools::builtin::{BuiltinTools, register_builtin_tools};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays canned turns, one per request.
    struct ScriptedLlm {
        turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    }

    impl ScriptedLlm {
        fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream_completion(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionStream, LlmError> {
            let events = self.turns.lock().unwrap().pop_front().ok_or_else(|| {
                LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "script exhausted".into(),
                }
            })?;
            Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
        }
    }

    fn call(index: usize, name: &str, args: &str) -> StreamEvent {
        StreamEvent::ToolCallDelta {
            index,
            id: Some(format!("call_{index}")),
            name: Some(name.into()),
            arguments: args.into(),
        }
    }

    async fn context(turns: Vec<Vec<StreamEvent>>) -> Arc<ExecutionContext> {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let manager = Arc::new(TaskManager::new(store));
        let analyzer = Arc::new(TaskStateAnalyzer::new());
        let tools = Arc::new(ToolRegistry::new());
        register_builtin_tools(
            &tools,
            BuiltinTools {
                manager: Arc::clone(&manager),
                analyzer: Arc::clone(&analyzer),
                search: None,
                search_max_results: 5,
                bridge: None,
            },
        );
        ExecutionContext::new(
            SessionInfo {
                session_id: "s1".into(),
                user_id: "u1".into(),
                team_id: "t1".into(),
            },
            AgentProfile::default(),
            ExecutionDeps {
                manager,
                llm: Arc::new(ScriptedLlm::new(turns)),
                tools,
                analyzer,
            },
            Arc::new(NoopEvents),
            Duration::from_millis(10),
        )
    }

    async fn queue_user(ctx: &ExecutionContext, content: &str) {
        ctx.deps
            .manager
            .initialize_task_state("s1")
            .await
            .unwrap();
        ctx.deps
            .manager
            .update_task_state("s1", TaskStateUpdate::status(TaskStatus::Running))
            .await
            .unwrap();
        ctx.queue_message(content, "u1").await.unwrap();
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let ctx = context(vec![]).await;
        assert_eq!(ctx.process_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn todo_update_continues_with_the_next_task() {
        let ctx = context(vec![vec![call(
            0,
            "update_todo_list",
            r#"{"todos": "[-] research\n[ ] write"}"#,
        )]])
        .await;
        queue_user(&ctx, "Plan a trip").await;

        let outcome = ctx.process_next().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::ToolExecuted {
                tool: "update_todo_list".into(),
                is_error: false,
                continued: true,
            }
        );

        let store = ctx.deps.manager.store();
        let messages = store.list_session_messages("s1").await.unwrap();
        let directive = messages.last().unwrap();
        assert_eq!(directive.author, MessageAuthor::System);
        assert!(directive.content.contains("Continue working on the in-progress task: \"research\""));

        let recorded = &messages[1].tool_calls[0];
        assert!(recorded.result.as_ref().is_some_and(|r| !r.is_error));

        let state = ctx.deps.manager.get_task_state("s1").await.unwrap().unwrap();
        assert_eq!(state.current_loop_count, 1);
        assert_eq!(state.processing_context, None);
        assert_eq!(state.execution_metadata.tools_executed, vec!["update_todo_list"]);
        assert_eq!(store.count_queue_items("s1", QueueStatus::Queued).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn text_only_turn_is_corrected() {
        let ctx = context(vec![vec![StreamEvent::TextDelta("Sure, here you go.".into())]]).await;
        queue_user(&ctx, "Explain lifetimes").await;

        assert_eq!(
            ctx.process_next().await.unwrap(),
            Some(IterationOutcome::NoToolCall)
        );
        let state = ctx.deps.manager.get_task_state("s1").await.unwrap().unwrap();
        assert_eq!(state.consecutive_mistake_count, 1);
        assert_eq!(state.status, TaskStatus::Running);

        let messages = ctx.deps.manager.store().list_session_messages("s1").await.unwrap();
        assert_eq!(messages[1].content, "Sure, here you go.");
        assert_eq!(messages.last().unwrap().content, NO_TOOL_USED);
    }

    #[tokio::test]
    async fn inline_markup_is_used_when_no_native_calls() {
        let ctx = context(vec![vec![StreamEvent::TextDelta(
            "<attempt_completion><result>42</result></attempt_completion>".into(),
        )]])
        .await;
        queue_user(&ctx, "Answer").await;

        assert_eq!(
            ctx.process_next().await.unwrap(),
            Some(IterationOutcome::Completed {
                result: "42".into()
            })
        );
    }

    #[tokio::test]
    async fn unknown_tool_result_is_an_error_the_model_sees() {
        let ctx = context(vec![vec![call(0, "delete_everything", "{}")]]).await;
        queue_user(&ctx, "Go").await;

        let outcome = ctx.process_next().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::ToolExecuted {
                tool: "delete_everything".into(),
                is_error: true,
                continued: true,
            }
        );
        let messages = ctx.deps.manager.store().list_session_messages("s1").await.unwrap();
        assert!(messages.iter().any(|m| m.content == "[delete_everything] ERROR: Tool 'delete_everything' is not available"));
    }

    #[tokio::test]
    async fn model_failure_halts_the_session() {
        let ctx = context(vec![]).await;
        queue_user(&ctx, "Hello").await;

        assert!(ctx.process_next().await.is_err());
        let state = ctx.deps.manager.get_task_state("s1").await.unwrap().unwrap();
        assert_eq!(state.status, TaskStatus::Error);
        assert!(
            state
                .processing_context
                .and_then(|c| c.error_message)
                .is_some_and(|m| m.contains("script exhausted"))
        );
        let stats = ctx.deps.manager.queue_stats("s1").await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn halted_sessions_skip_iterations() {
        let ctx = context(vec![]).await;
        queue_user(&ctx, "Hello").await;
        ctx.deps
            .manager
            .update_task_state("s1", TaskStateUpdate::status(TaskStatus::Stopped))
            .await
            .unwrap();

        assert_eq!(
            ctx.process_next().await.unwrap(),
            Some(IterationOutcome::Halted)
        );
    }

    #[tokio::test]
    async fn assistant_items_are_skipped() {
        let ctx = context(vec![]).await;
        ctx.deps
            .manager
            .queue_message("s1", "m1", "echo", ASSISTANT_SENDER)
            .await
            .unwrap();
        assert_eq!(
            ctx.process_next().await.unwrap(),
            Some(IterationOutcome::Skipped)
        );
    }
}
