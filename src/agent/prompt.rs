//! System prompt assembly and the directives the loop injects.

use std::sync::LazyLock;

use regex::Regex;

use crate::store::SessionMessage;
use crate::tasks::analyzer::{analyze_task_state, generate_continuation_message, parse_todo_list};

use super::history::{is_first_turn, latest_todo_markdown, latest_user_message};

pub const BASE_SYSTEM_PROMPT: &str = "\
You are a capable assistant that works through requests step by step, \
keeping the user informed through tools.

====

TASK-DRIVEN EXECUTION

1. For any request that needs several steps, start by calling update_todo_list \
with a markdown checklist of the work, in execution order.
2. After every update_todo_list call, continue immediately with the next task. \
Never stop after only updating the list.
3. Mark an item [-] when you start it and [x] when it is fully done. Keep \
unfinished items; add new ones as you discover them.
4. Call attempt_completion only when every item is [x] and the request has \
been fully answered.

====

TOOL USE

Every response MUST call exactly one tool. A response with no tool call, or \
with more than one, is rejected and you will be asked to retry.

- Need information only the user has: ask_followup_question.
- Need current facts from the web: web_search, when available.
- Multi-step work: update_todo_list.
- Finished answering the current request: attempt_completion with the full \
answer in `result`. The conversation continues afterwards.

If native tool calling is unavailable, write the call as markup where the \
tool name is the outer tag and each parameter is a child tag:

<attempt_completion>
<result>Your complete answer.</result>
</attempt_completion>

Checklist format for update_todo_list:
[ ] pending item
[-] item in progress
[x] completed item";

const DIRECT_LOOKUP_DIRECTIVE: &str = "\
SYSTEM: The user asked for a direct lookup. Do not create a todo list. Call \
the tool that answers the question right away, then present the result with \
attempt_completion.";

/// Sent when a turn contains no tool call.
pub const NO_TOOL_USED: &str = "\
[ERROR] You did not use a tool in your previous response! Please retry with a tool use.

You MUST use exactly one tool in every response:
- attempt_completion: if you have completed the task
- ask_followup_question: if you need more information from the user
- update_todo_list: to plan or record task progress

Please use one of these tools in your next response.";

/// Sent when a turn contains more than one tool call.
pub const MULTIPLE_TOOLS_USED: &str = "\
[ERROR] You used more than one tool in your previous response. None of them were executed.

Use exactly ONE tool per response. Pick the single most important next step and retry.";

/// Continuation when no checklist exists.
pub const GENERIC_CONTINUATION: &str = "\
SYSTEM: Review the tool result above and continue with the next step. Call \
attempt_completion once the request is fully answered.";

static LOOKUP_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:please\s+)?(?:search(?:\s+(?:for|the\s+web\s+for))?|look\s*up|find(?:\s+out)?|google|what(?:'s|\s+is|\s+are)|who(?:'s|\s+is|\s+are)|when\s+(?:is|was|did)|where\s+is|how\s+(?:much|many|old)|latest|current)\b",
    )
    .expect("lookup regex is valid")
});

/// Whether `message` is a plain information lookup that needs no planning.
pub fn is_lookup_request(message: &str) -> bool {
    LOOKUP_REQUEST.is_match(message)
}

/// Agent instructions, the base prompt and the directive for the session's
/// current position.
///
/// On the first turn of a lookup request the model is told to call the
/// tool directly. Otherwise the continuation directive for the latest
/// checklist in `messages` is appended.
pub fn build_system_prompt(instructions: Option<&str>, messages: &[SessionMessage]) -> String {
    let mut prompt = match instructions {
        Some(extra) => format!("{extra}\n\n{BASE_SYSTEM_PROMPT}"),
        None => BASE_SYSTEM_PROMPT.to_string(),
    };
    prompt.push_str("\n\n====\n\nCURRENT STATE\n\n");

    if is_first_turn(messages) && latest_user_message(messages).is_some_and(is_lookup_request) {
        prompt.push_str(DIRECT_LOOKUP_DIRECTIVE);
        return prompt;
    }

    let todos = latest_todo_markdown(messages)
        .map(|markdown| parse_todo_list(&markdown))
        .unwrap_or_default();
    prompt.push_str(&generate_continuation_message(&analyze_task_state(&todos)));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MessageAuthor, RecordedToolCall};
    use crate::tools::builtin::UPDATE_TODO_LIST;
    use chrono::Utc;

    fn turn(author: MessageAuthor, content: &str) -> SessionMessage {
        SessionMessage {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            session_id: "s1".into(),
            sender_id: "u1".into(),
            author,
            content: content.into(),
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn recognises_lookup_requests() {
        assert!(is_lookup_request("What is the capital of Peru?"));
        assert!(is_lookup_request("please look up the latest tokio release"));
        assert!(is_lookup_request("Search for rust async book"));
        assert!(!is_lookup_request("Write a migration plan for our database"));
        assert!(!is_lookup_request("Refactor the whatever module"));
    }

    #[test]
    fn first_turn_lookup_gets_direct_directive() {
        let prompt = build_system_prompt(None, &[turn(MessageAuthor::User, "Who is Ada Lovelace?")]);
        assert!(prompt.starts_with(BASE_SYSTEM_PROMPT));
        assert!(prompt.ends_with(DIRECT_LOOKUP_DIRECTIVE));
    }

    #[test]
    fn later_turns_follow_the_checklist() {
        let mut planned = turn(MessageAuthor::Assistant, "");
        planned.tool_calls = vec![RecordedToolCall {
            id: "c1".into(),
            name: UPDATE_TODO_LIST.into(),
            arguments: serde_json::json!({"todos": "[x] a\n[ ] b"}),
            result: None,
        }];
        let prompt = build_system_prompt(
            Some("Answer in French."),
            &[turn(MessageAuthor::User, "What is up? Plan it"), planned],
        );
        assert!(prompt.starts_with("Answer in French.\n\n"));
        assert!(prompt.contains(BASE_SYSTEM_PROMPT));
        assert!(prompt.contains("Start the next pending task: \"b\""));
    }

    #[test]
    fn no_checklist_yields_planning_hint() {
        let prompt = build_system_prompt(None, &[turn(MessageAuthor::User, "Draft a release plan")]);
        assert!(prompt.contains("No todo list is defined yet"));
    }
}
