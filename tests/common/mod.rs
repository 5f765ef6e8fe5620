//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use persistent_agent::agent::events::ExecutionEvent;
use persistent_agent::agent::execution::ExecutionDeps;
use persistent_agent::error::LlmError;
use persistent_agent::llm::{
    CompletionRequest, CompletionStream, FinishReason, LlmProvider, StreamEvent, TokenUsage,
};
use persistent_agent::store::{Database, LibSqlBackend};
use persistent_agent::tasks::{TaskManager, TaskStateAnalyzer};
use persistent_agent::tools::builtin::{BuiltinTools, register_builtin_tools};
use persistent_agent::tools::{Tool, ToolContext, ToolError, ToolOutput, ToolRegistry};

/// Maximum time any wait is allowed before the test is considered hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Replays one canned turn per completion request.
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    requests: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
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
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut events = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "script exhausted".into(),
            })?;
        events.push(StreamEvent::Finish {
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            finish_reason: FinishReason::ToolUse,
        });
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}

/// A native tool call fragment carrying the whole call.
pub fn tool_call(index: usize, name: &str, arguments: serde_json::Value) -> StreamEvent {
    StreamEvent::ToolCallDelta {
        index,
        id: Some(format!("call_{index}")),
        name: Some(name.to_string()),
        arguments: arguments.to_string(),
    }
}

/// External tool that counts its executions.
pub struct CountingTool {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "count_things"
    }

    fn description(&self) -> &str {
        "Counts how often it runs"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ToolOutput::text(format!("counted {n}"), Duration::from_millis(1)))
    }
}

pub async fn memory_store() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

/// Dependencies with the built-in tools registered on a fresh registry.
pub fn deps(store: Arc<dyn Database>, llm: Arc<dyn LlmProvider>) -> ExecutionDeps {
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
    ExecutionDeps {
        manager,
        llm,
        tools,
        analyzer,
    }
}

/// Wait for the first event matching `pred`, discarding the rest.
pub async fn wait_for(
    rx: &mut UnboundedReceiver<ExecutionEvent>,
    pred: impl Fn(&ExecutionEvent) -> bool,
) -> ExecutionEvent {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `check` until it holds or the timeout elapses.
pub async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
