//! Adapter from rig's [`CompletionModel`] to the streaming [`LlmProvider`]
//! trait.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::StreamExt;
use rig::OneOrMany;
use rig::completion::message::{AssistantContent, Message, ToolResultContent, UserContent};
use rig::completion::{self as rig_completion, CompletionModel, GetTokenUsage};
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use serde_json::Value;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionStream, FinishReason, LlmProvider, Role,
    StreamEvent, TokenUsage,
};

/// Bridges a rig completion model to [`LlmProvider`].
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// A chat request split the way rig takes it: leading system turns become
/// the preamble and the last message is the prompt.
#[derive(Debug)]
pub(crate) struct RigPrompt {
    pub preamble: Option<String>,
    pub history: Vec<Message>,
    pub prompt: Message,
}

fn call_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| arguments.clone()),
        other => other.clone(),
    }
}

pub(crate) fn to_rig_prompt(messages: &[ChatMessage], provider: &str) -> Result<RigPrompt, LlmError> {
    let mut preamble = Vec::new();
    let mut converted = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::System if converted.is_empty() => preamble.push(message.content.clone()),
            // Injected directives mid-conversation go in as user turns.
            Role::System | Role::User => converted.push(Message::user(message.content.clone())),
            Role::Assistant => {
                let mut content = Vec::with_capacity(message.tool_calls.len() + 1);
                if !message.content.is_empty() {
                    content.push(AssistantContent::text(message.content.clone()));
                }
                content.extend(message.tool_calls.iter().map(|call| {
                    AssistantContent::tool_call(
                        call.id.clone(),
                        call.name.clone(),
                        call_arguments(&call.arguments),
                    )
                }));
                if let Ok(content) = OneOrMany::many(content) {
                    converted.push(Message::Assistant { id: None, content });
                }
            }
            Role::Tool => {
                let result = UserContent::tool_result(
                    message.tool_call_id.clone().unwrap_or_default(),
                    OneOrMany::one(ToolResultContent::text(message.content.clone())),
                );
                converted.push(Message::User {
                    content: OneOrMany::one(result),
                });
            }
        }
    }

    let prompt = converted.pop().ok_or_else(|| LlmError::RequestFailed {
        provider: provider.to_string(),
        reason: "request has no conversation turns".to_string(),
    })?;
    Ok(RigPrompt {
        preamble: (!preamble.is_empty()).then(|| preamble.join("\n\n")),
        history: converted,
        prompt,
    })
}

fn saturate(tokens: u64) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

/// Events emitted once rig's stream ends: the aggregated tool calls, then
/// `Finish`.
pub(crate) fn final_events(
    choice: &OneOrMany<AssistantContent>,
    usage: Option<rig_completion::Usage>,
) -> Vec<StreamEvent> {
    let mut events: Vec<StreamEvent> = choice
        .iter()
        .filter_map(|content| match content {
            AssistantContent::ToolCall(call) => Some(call),
            _ => None,
        })
        .enumerate()
        .map(|(index, call)| StreamEvent::ToolCallDelta {
            index,
            id: Some(call.id.clone()),
            name: Some(call.function.name.clone()),
            arguments: call.function.arguments.to_string(),
        })
        .collect();

    let finish_reason = if events.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolUse
    };
    let usage = usage
        .map(|u| TokenUsage {
            input_tokens: saturate(u.input_tokens),
            output_tokens: saturate(u.output_tokens),
        })
        .unwrap_or_default();
    events.push(StreamEvent::Finish {
        usage,
        finish_reason,
    });
    events
}

struct EventState<R>
where
    R: Clone + Unpin + GetTokenUsage,
{
    inner: Pin<Box<StreamingCompletionResponse<R>>>,
    pending: VecDeque<Result<StreamEvent, LlmError>>,
    done: bool,
    provider: String,
}

/// Text is forwarded as it streams. Tool calls are taken from rig's
/// aggregated choice when the stream ends.
fn event_stream<R>(response: StreamingCompletionResponse<R>, provider: String) -> CompletionStream
where
    R: Clone + Unpin + GetTokenUsage + Send + 'static,
{
    let state = EventState {
        inner: Box::pin(response),
        pending: VecDeque::new(),
        done: false,
        provider,
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(StreamedAssistantContent::Text(text))) if !text.text.is_empty() => {
                    state.pending.push_back(Ok(StreamEvent::TextDelta(text.text)));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    state.done = true;
                    state.pending.push_back(Err(LlmError::StreamInterrupted {
                        provider: state.provider.clone(),
                        reason: e.to_string(),
                    }));
                }
                None => {
                    state.done = true;
                    let usage = state.inner.response.as_ref().and_then(|r| r.token_usage());
                    let events = final_events(&state.inner.choice, usage);
                    state.pending.extend(events.into_iter().map(Ok));
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
    M::StreamingResponse: Send + 'static,
{
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, LlmError> {
        if request.model != self.model_name {
            tracing::debug!(requested = %request.model, model = %self.model_name, "Requested model differs from the configured one");
        }
        let RigPrompt {
            preamble,
            history,
            prompt,
        } = to_rig_prompt(&request.messages, &self.model_name)?;
        let tools: Vec<rig_completion::ToolDefinition> = request
            .tools
            .into_iter()
            .map(|tool| rig_completion::ToolDefinition {
                name: tool.name,
                description: tool.description,
                parameters: tool.parameters,
            })
            .collect();

        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .tools(tools)
            .temperature(f64::from(request.temperature))
            .max_tokens(u64::from(request.max_tokens));
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }

        let response = builder.stream().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;
        tracing::debug!(model = %self.model_name, "Completion stream opened");
        Ok(event_stream(response, self.model_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ToolCall;
    use serde_json::json;

    #[test]
    fn leading_system_turns_become_the_preamble() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "web_search".into(),
            arguments: json!({"query": "rust"}),
        };
        let parts = to_rig_prompt(
            &[
                ChatMessage::system("You are helpful."),
                ChatMessage::user("find rust news"),
                ChatMessage::assistant_with_tool_calls(None, vec![call]),
                ChatMessage::tool_result("call_1", "web_search", "results"),
                ChatMessage::system("Continue with the task."),
            ],
            "test",
        )
        .unwrap();

        assert_eq!(parts.preamble.as_deref(), Some("You are helpful."));
        assert_eq!(parts.history.len(), 3);
        let Message::Assistant { content, .. } = &parts.history[1] else {
            panic!("expected an assistant turn");
        };
        assert!(content.iter().any(|c| matches!(
            c,
            AssistantContent::ToolCall(call) if call.function.name == "web_search"
        )));
        assert!(matches!(parts.history[2], Message::User { .. }));
        assert!(matches!(parts.prompt, Message::User { .. }));
    }

    #[test]
    fn empty_request_is_refused() {
        let err = to_rig_prompt(&[ChatMessage::system("only a preamble")], "test").unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
    }

    #[test]
    fn string_arguments_are_decoded() {
        assert_eq!(
            call_arguments(&Value::String(r#"{"q":"x"}"#.into())),
            json!({"q": "x"})
        );
        assert_eq!(
            call_arguments(&Value::String("not json".into())),
            Value::String("not json".into())
        );
    }

    #[test]
    fn final_events_report_tool_calls_then_finish() {
        let choice = OneOrMany::many(vec![
            AssistantContent::text("Searching."),
            AssistantContent::tool_call("call_1", "web_search", json!({"query": "rust"})),
        ])
        .unwrap();
        assert_eq!(
            final_events(&choice, None),
            vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("call_1".into()),
                    name: Some("web_search".into()),
                    arguments: r#"{"query":"rust"}"#.into(),
                },
                StreamEvent::Finish {
                    usage: TokenUsage::default(),
                    finish_reason: FinishReason::ToolUse,
                },
            ]
        );

        let text_only = OneOrMany::one(AssistantContent::text("Hello"));
        assert_eq!(
            final_events(&text_only, None),
            vec![StreamEvent::Finish {
                usage: TokenUsage::default(),
                finish_reason: FinishReason::Stop,
            }]
        );
    }
}
