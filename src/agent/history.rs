//! Rebuilds model-facing chat history from the persisted conversation.

use crate::llm::{ChatMessage, ToolCall};
use crate::store::{MessageAuthor, SessionMessage};
use crate::tools::builtin::UPDATE_TODO_LIST;

const INTERRUPTED_RESULT: &str = "Tool execution was interrupted before it produced a result.";

/// Convert stored turns into chat messages, oldest first.
///
/// A turn with recorded tool calls becomes one assistant message carrying
/// the calls, followed by one tool message per call. Calls that never got
/// a result (the process died mid-execution) are answered with a synthetic
/// interrupted result so the sequence stays well-formed.
pub fn rebuild_history(messages: &[SessionMessage]) -> Vec<ChatMessage> {
    let mut history = Vec::with_capacity(messages.len());
    for message in messages {
        if !message.tool_calls.is_empty() {
            let calls = message
                .tool_calls
                .iter()
                .map(|call| ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
                .collect();
            let text = (!message.content.trim().is_empty()).then(|| message.content.clone());
            history.push(ChatMessage::assistant_with_tool_calls(text, calls));

            for call in &message.tool_calls {
                let content = match &call.result {
                    Some(result) if result.is_error => format!("ERROR: {}", result.output),
                    Some(result) => result.output.clone(),
                    None => INTERRUPTED_RESULT.to_string(),
                };
                history.push(ChatMessage::tool_result(&call.id, &call.name, content));
            }
            continue;
        }

        history.push(match message.author {
            MessageAuthor::System => ChatMessage::system(&message.content),
            MessageAuthor::User => ChatMessage::user(&message.content),
            MessageAuthor::Assistant => ChatMessage::assistant(&message.content),
        });
    }
    history
}

/// The checklist from the most recent `update_todo_list` call, if any.
pub fn latest_todo_markdown(messages: &[SessionMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .flat_map(|m| m.tool_calls.iter().rev())
        .find(|call| call.name == UPDATE_TODO_LIST)
        .and_then(|call| call.arguments.get("todos"))
        .and_then(|todos| todos.as_str())
        .map(str::to_string)
}

/// True until the assistant has produced its first turn.
pub fn is_first_turn(messages: &[SessionMessage]) -> bool {
    !messages
        .iter()
        .any(|m| m.author == MessageAuthor::Assistant)
}

pub fn latest_user_message(messages: &[SessionMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.author == MessageAuthor::User)
        .map(|m| m.content.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::store::RecordedToolCall;
    use chrono::Utc;
    use serde_json::json;

    fn turn(seq: i64, author: MessageAuthor, content: &str) -> SessionMessage {
        SessionMessage {
            id: format!("m{seq}"),
            seq,
            session_id: "s1".into(),
            sender_id: "u1".into(),
            author,
            content: content.into(),
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn call(id: &str, name: &str, arguments: serde_json::Value) -> RecordedToolCall {
        RecordedToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
            result: None,
        }
    }

    #[test]
    fn maps_authors_to_roles() {
        let history = rebuild_history(&[
            turn(1, MessageAuthor::User, "hi"),
            turn(2, MessageAuthor::Assistant, "hello"),
            turn(3, MessageAuthor::System, "SYSTEM: continue"),
        ]);
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::System]);
    }

    #[test]
    fn tool_turns_expand_to_call_and_results() {
        let mut with_calls = turn(2, MessageAuthor::Assistant, "");
        with_calls.tool_calls = vec![
            call("c1", "web_search", json!({"query": "rust"})).with_result("3 hits", false),
            call("c2", "web_search", json!({"query": "go"})),
        ];
        let history = rebuild_history(&[turn(1, MessageAuthor::User, "search"), with_calls]);

        assert_eq!(history.len(), 4);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].tool_calls.len(), 2);
        assert!(history[1].content.is_empty());
        assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(history[2].content, "3 hits");
        assert_eq!(history[3].content, INTERRUPTED_RESULT);
    }

    #[test]
    fn finds_the_latest_checklist() {
        let mut first = turn(2, MessageAuthor::Assistant, "");
        first.tool_calls = vec![call("c1", UPDATE_TODO_LIST, json!({"todos": "[ ] a"}))];
        let mut second = turn(4, MessageAuthor::Assistant, "");
        second.tool_calls = vec![call("c2", UPDATE_TODO_LIST, json!({"todos": "[x] a"}))];
        let messages = vec![
            turn(1, MessageAuthor::User, "plan it"),
            first,
            turn(3, MessageAuthor::System, "continue"),
            second,
        ];
        assert_eq!(latest_todo_markdown(&messages).as_deref(), Some("[x] a"));
        assert!(!is_first_turn(&messages));
        assert_eq!(latest_user_message(&messages), Some("plan it"));
    }

    #[test]
    fn fresh_session_is_first_turn() {
        let messages = vec![turn(1, MessageAuthor::User, "hi")];
        assert!(is_first_turn(&messages));
        assert_eq!(latest_todo_markdown(&messages), None);
    }
}
