//! Folds a completion stream into one assistant turn.

use std::collections::BTreeMap;

use futures::StreamExt;

use crate::error::LlmError;
use crate::llm::provider::{CompletionStream, FinishReason, StreamEvent, TokenUsage, ToolCall};

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// A fully received assistant turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// Accumulates text and tool-call fragments in arrival order.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    text: String,
    calls: BTreeMap<usize, PartialCall>,
    usage: TokenUsage,
    finish_reason: FinishReason,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta(delta) => self.text.push_str(&delta),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let call = self.calls.entry(index).or_default();
                if let Some(id) = id {
                    call.id = Some(id);
                }
                if let Some(name) = name {
                    call.name.push_str(&name);
                }
                call.arguments.push_str(&arguments);
            }
            StreamEvent::Finish {
                usage,
                finish_reason,
            } => {
                self.usage = usage;
                self.finish_reason = finish_reason;
            }
        }
    }

    /// Finish the turn. Calls without a name are dropped; arguments that are
    /// not valid JSON are kept as a raw string so the tool can report them.
    pub fn finish(self) -> AssistantTurn {
        let tool_calls = self
            .calls
            .into_iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| {
                let arguments = if call.arguments.trim().is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    serde_json::from_str(&call.arguments)
                        .unwrap_or(serde_json::Value::String(call.arguments))
                };
                ToolCall {
                    id: call.id.unwrap_or_else(|| format!("call_{index}")),
                    name: call.name,
                    arguments,
                }
            })
            .collect();

        AssistantTurn {
            text: self.text,
            tool_calls,
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}

/// Drain a stream, handing each text delta to `on_text` as it arrives.
pub async fn collect_turn(
    mut stream: CompletionStream,
    mut on_text: impl FnMut(&str),
) -> Result<AssistantTurn, LlmError> {
    let mut acc = TurnAccumulator::new();
    while let Some(event) = stream.next().await {
        let event = event?;
        if let StreamEvent::TextDelta(delta) = &event {
            on_text(delta);
        }
        acc.push(event);
    }
    Ok(acc.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_fragments_merge_by_index() {
        let mut acc = TurnAccumulator::new();
        acc.push(StreamEvent::TextDelta("Let me ".into()));
        acc.push(StreamEvent::TextDelta("check.".into()));
        acc.push(StreamEvent::ToolCallDelta {
            index: 0,
            id: Some("call_a".into()),
            name: Some("web_search".into()),
            arguments: "{\"que".into(),
        });
        acc.push(StreamEvent::ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments: "ry\":\"rust\"}".into(),
        });
        acc.push(StreamEvent::Finish {
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 4,
            },
            finish_reason: FinishReason::ToolUse,
        });

        let turn = acc.finish();
        assert_eq!(turn.text, "Let me check.");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "call_a");
        assert_eq!(turn.tool_calls[0].arguments["query"], "rust");
        assert_eq!(turn.usage.input_tokens, 10);
        assert_eq!(turn.finish_reason, FinishReason::ToolUse);
    }

    #[test]
    fn invalid_arguments_are_kept_raw() {
        let mut acc = TurnAccumulator::new();
        acc.push(StreamEvent::ToolCallDelta {
            index: 0,
            id: None,
            name: Some("attempt_completion".into()),
            arguments: "{not json".into(),
        });
        let turn = acc.finish();
        assert_eq!(turn.tool_calls[0].id, "call_0");
        assert_eq!(
            turn.tool_calls[0].arguments,
            serde_json::Value::String("{not json".into())
        );
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        let mut acc = TurnAccumulator::new();
        acc.push(StreamEvent::ToolCallDelta {
            index: 1,
            id: Some("x".into()),
            name: Some("update_todo_list".into()),
            arguments: String::new(),
        });
        let turn = acc.finish();
        assert!(turn.tool_calls[0].arguments.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn collect_turn_forwards_text() {
        let events = vec![
            Ok(StreamEvent::TextDelta("a".into())),
            Ok(StreamEvent::TextDelta("b".into())),
        ];
        let stream: CompletionStream = Box::pin(futures::stream::iter(events));
        let mut seen = Vec::new();
        let turn = collect_turn(stream, |t| seen.push(t.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(turn.text, "ab");
    }
}
