//! Built-in tools: completion, checklist, followup questions, web search
//! and resource access.

pub mod completion;
pub mod followup;
pub mod resource;
pub mod search;
pub mod todo_list;

use std::sync::Arc;

pub use completion::{ATTEMPT_COMPLETION, AttemptCompletionTool};
pub use followup::{ASK_FOLLOWUP_QUESTION, AskFollowupQuestionTool, parse_suggestions};
pub use resource::{
    ACCESS_MCP_RESOURCE, AccessMcpResource, ExternalToolSpec, ResourceBridge, USE_MCP_TOOL,
    UseMcpTool, register_external_tools,
};
pub use search::{HttpSearchBackend, SearchBackend, SearchHit, WEB_SEARCH, WebSearchTool};
pub use todo_list::{UPDATE_TODO_LIST, UpdateTodoListTool};

use crate::tasks::{TaskManager, TaskStateAnalyzer};
use crate::tools::registry::ToolRegistry;

/// Collaborators the built-in tools need.
pub struct BuiltinTools {
    pub manager: Arc<TaskManager>,
    pub analyzer: Arc<TaskStateAnalyzer>,
    /// `web_search` is only offered when a backend is configured.
    pub search: Option<Arc<dyn SearchBackend>>,
    pub search_max_results: usize,
    /// Resource tools are only offered when a bridge is configured.
    pub bridge: Option<Arc<dyn ResourceBridge>>,
}

/// Register the built-in tools on `registry`.
pub fn register_builtin_tools(registry: &ToolRegistry, tools: BuiltinTools) {
    registry.register_builtin(Arc::new(AttemptCompletionTool));
    registry.register_builtin(Arc::new(UpdateTodoListTool::new(tools.analyzer)));
    registry.register_builtin(Arc::new(AskFollowupQuestionTool::new(tools.manager)));

    if let Some(backend) = tools.search {
        registry.register_builtin(Arc::new(WebSearchTool::new(
            backend,
            tools.search_max_results,
        )));
    }

    if let Some(bridge) = tools.bridge {
        registry.register_builtin(Arc::new(UseMcpTool::new(Arc::clone(&bridge))));
        registry.register_builtin(Arc::new(AccessMcpResource::new(bridge)));
    }

    tracing::info!(count = registry.count(), "Built-in tools registered");
}

#[cfg(test)]
pub(crate) fn test_context() -> crate::tools::tool::ToolContext {
    crate::tools::tool::ToolContext {
        session_id: "test-session".to_string(),
        team_id: "team".to_string(),
        user_id: "user".to_string(),
        events: Arc::new(crate::agent::events::NoopEvents),
    }
}
