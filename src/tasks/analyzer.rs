//! Checklist analysis: turns the markdown todo list the model maintains
//! into a next-step decision and a continuation directive.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::sync::RwLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static TODO_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:-\s*)?\[\s*([ xX\-~])\s*\]\s+(.+)$").expect("todo line regex is valid")
});

/// Status of one checklist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// One parsed checklist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    /// `todo_N`, 1-based over the parsed entries.
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    pub original_line: String,
}

/// What the agent should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    NoTasks,
    ContinueTask,
    StartNextTask,
    AllCompleted,
}

/// Analysis of a checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionState {
    pub todos: Vec<TodoItem>,
    pub all_completed: bool,
    pub has_in_progress: bool,
    pub has_pending: bool,
    pub next_action: NextAction,
    pub action_message: String,
    pub current_task_index: Option<usize>,
}

impl TaskExecutionState {
    /// The todo the agent should be working on, if any.
    pub fn current_task(&self) -> Option<&TodoItem> {
        self.current_task_index.and_then(|i| self.todos.get(i))
    }

    /// Whether the agent should keep going without user input.
    pub fn should_continue(&self) -> bool {
        matches!(
            self.next_action,
            NextAction::ContinueTask | NextAction::StartNextTask | NextAction::AllCompleted
        )
    }
}

/// Parse a markdown checklist. Lines that are not checklist entries are ignored.
pub fn parse_todo_list(markdown: &str) -> Vec<TodoItem> {
    markdown
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let caps = TODO_LINE.captures(line)?;
            let status = match &caps[1] {
                "x" | "X" => TodoStatus::Completed,
                "-" | "~" => TodoStatus::InProgress,
                _ => TodoStatus::Pending,
            };
            Some((status, caps[2].trim().to_string(), line.to_string()))
        })
        .enumerate()
        .map(|(i, (status, content, original_line))| TodoItem {
            id: format!("todo_{}", i + 1),
            content,
            status,
            original_line,
        })
        .collect()
}

/// Decide the next action. The first matching rule wins: no todos, all
/// completed, first in-progress item, first pending item.
pub fn analyze_task_state(todos: &[TodoItem]) -> TaskExecutionState {
    let all_completed = !todos.is_empty() && todos.iter().all(|t| t.status == TodoStatus::Completed);
    let first_in_progress = todos.iter().position(|t| t.status == TodoStatus::InProgress);
    let first_pending = todos.iter().position(|t| t.status == TodoStatus::Pending);

    let (next_action, action_message, current_task_index) = if todos.is_empty() {
        (
            NextAction::NoTasks,
            "No tasks defined. Please create a todo list for complex requests.".to_string(),
            None,
        )
    } else if all_completed {
        (
            NextAction::AllCompleted,
            "All tasks completed! Use attempt_completion to present the final result.".to_string(),
            Some(todos.len() - 1),
        )
    } else if let Some(i) = first_in_progress {
        (
            NextAction::ContinueTask,
            format!("Continue working on: \"{}\"", todos[i].content),
            Some(i),
        )
    } else if let Some(i) = first_pending {
        (
            NextAction::StartNextTask,
            format!("Start next task: \"{}\"", todos[i].content),
            Some(i),
        )
    } else {
        (
            NextAction::NoTasks,
            "No actionable tasks found.".to_string(),
            None,
        )
    };

    TaskExecutionState {
        todos: todos.to_vec(),
        all_completed,
        has_in_progress: first_in_progress.is_some(),
        has_pending: first_pending.is_some(),
        next_action,
        action_message,
        current_task_index,
    }
}

/// Directive sent back to the model to keep it moving.
pub fn generate_continuation_message(state: &TaskExecutionState) -> String {
    let current = state
        .current_task()
        .map(|t| t.content.as_str())
        .unwrap_or_default();
    match state.next_action {
        NextAction::NoTasks => "SYSTEM: No todo list is defined yet. If the request needs more \
             than one step, call update_todo_list with a markdown checklist before doing \
             anything else. Otherwise complete the request and call attempt_completion."
            .to_string(),
        NextAction::ContinueTask => format!(
            "SYSTEM: Continue working on the in-progress task: \"{current}\". \
             When it is done, call update_todo_list to mark it [x] and move on."
        ),
        NextAction::StartNextTask => format!(
            "SYSTEM: Start the next pending task: \"{current}\". \
             Call update_todo_list to mark it [-] in progress, then work on it."
        ),
        NextAction::AllCompleted => "SYSTEM: Every task in the todo list is completed. \
             Call attempt_completion now with a summary of the final result."
            .to_string(),
    }
}

/// Per-session cache of the latest checklist analysis.
#[derive(Debug, Default)]
pub struct TaskStateAnalyzer {
    sessions: RwLock<HashMap<String, TaskExecutionState>>,
}

impl TaskStateAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and analyze `markdown`, cache the result for the session and return it.
    pub fn update_session_task_state(&self, session_id: &str, markdown: &str) -> TaskExecutionState {
        let state = analyze_task_state(&parse_todo_list(markdown));
        tracing::debug!(
            session_id,
            todos = state.todos.len(),
            next_action = ?state.next_action,
            "Checklist analyzed"
        );
        self.sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session_id.to_string(), state.clone());
        state
    }

    pub fn get_session_task_state(&self, session_id: &str) -> Option<TaskExecutionState> {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// False when no checklist is cached for the session.
    pub fn should_continue_execution(&self, session_id: &str) -> bool {
        self.get_session_task_state(session_id)
            .is_some_and(|state| state.should_continue())
    }

    pub fn clear_session_task_state(&self, session_id: &str) {
        self.sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(session_id);
    }
}
