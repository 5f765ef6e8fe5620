//! Tool registry for managing available tools.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::llm::ToolDefinition;
use crate::tools::tool::Tool;

/// Registry of available tools.
///
/// Built-in tools are always offered to the model. External tools are
/// offered only when the agent's allow-list names them (or it has none).
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Names registered as built-in, protected from shadowing.
    builtin_names: RwLock<HashSet<String>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            builtin_names: RwLock::new(HashSet::new()),
        }
    }

    /// Register an external tool. Rejects tools that try to shadow a built-in name.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        if self.builtin_names.read().await.contains(&name) {
            tracing::warn!(
                tool = %name,
                "Rejected tool registration: would shadow a built-in tool"
            );
            return false;
        }
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!(tool = %name, "Registered tool");
        true
    }

    /// Register a built-in tool (sync version for startup).
    pub fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Ok(mut tools) = self.tools.try_write()
            && let Ok(mut builtins) = self.builtin_names.try_write()
        {
            tools.insert(name.clone(), tool);
            builtins.insert(name.clone());
            tracing::debug!(tool = %name, "Registered built-in tool");
        } else {
            tracing::warn!(tool = %name, "Registry busy, built-in tool not registered");
        }
    }

    /// Unregister an external tool. Built-ins stay.
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if self.builtin_names.read().await.contains(name) {
            return None;
        }
        self.tools.write().await.remove(name)
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Check if a tool exists.
    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn is_builtin(&self, name: &str) -> bool {
        self.builtin_names.read().await.contains(name)
    }

    /// List all tool names.
    pub async fn list(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    /// Get the number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.try_read().map(|t| t.len()).unwrap_or(0)
    }

    /// Whether an agent with `allowed` may call `name`.
    pub async fn is_enabled(&self, name: &str, allowed: Option<&[String]>) -> bool {
        if !self.has(name).await {
            return false;
        }
        if self.is_builtin(name).await {
            return true;
        }
        allowed.is_none_or(|list| list.iter().any(|n| n == name))
    }

    /// Definitions of every registered tool, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tool_definitions_for_agent(None).await
    }

    /// Definitions an agent may use: built-ins plus allowed external tools,
    /// sorted by name so prompts are stable across calls.
    pub async fn tool_definitions_for_agent(
        &self,
        allowed: Option<&[String]>,
    ) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let builtins = self.builtin_names.read().await;
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .filter(|tool| {
                builtins.contains(tool.name())
                    || allowed.is_none_or(|list| list.iter().any(|n| n == tool.name()))
            })
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool::{ToolContext, ToolError, ToolOutput};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Debug)]
    struct MockTool {
        name: String,
    }

    fn mock(name: &str) -> Arc<dyn Tool> {
        Arc::new(MockTool {
            name: name.to_string(),
        })
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A mock tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("mock", Duration::from_millis(1)))
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ToolRegistry::new();
        assert!(registry.register(mock("test_tool")).await);
        assert!(registry.has("test_tool").await);
        assert!(!registry.has("nonexistent").await);

        let retrieved = registry.get("test_tool").await;
        assert_eq!(retrieved.unwrap().name(), "test_tool");
    }

    #[tokio::test]
    async fn builtins_cannot_be_shadowed_or_removed() {
        let registry = ToolRegistry::new();
        registry.register_builtin(mock("attempt_completion"));
        assert!(!registry.register(mock("attempt_completion")).await);
        assert!(registry.unregister("attempt_completion").await.is_none());
        assert!(registry.is_builtin("attempt_completion").await);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn allow_list_filters_external_tools_only() {
        let registry = ToolRegistry::new();
        registry.register_builtin(mock("attempt_completion"));
        registry.register(mock("crm_lookup")).await;
        registry.register(mock("calendar")).await;

        let allowed = vec!["calendar".to_string()];
        let names: Vec<_> = registry
            .tool_definitions_for_agent(Some(allowed.as_slice()))
            .await
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["attempt_completion", "calendar"]);

        assert_eq!(registry.tool_definitions().await.len(), 3);
        assert!(registry.is_enabled("attempt_completion", Some(&[][..])).await);
        assert!(!registry.is_enabled("crm_lookup", Some(allowed.as_slice())).await);
        assert!(registry.is_enabled("crm_lookup", None).await);
        assert!(!registry.is_enabled("missing", None).await);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = ToolRegistry::new();
        registry.register(mock("temp")).await;
        assert!(registry.has("temp").await);
        registry.unregister("temp").await;
        assert!(!registry.has("temp").await);
    }
}
