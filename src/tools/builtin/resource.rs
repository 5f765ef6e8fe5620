//! Tools backed by an external resource bridge (MCP-style servers).
//!
//! `use_mcp_tool` and `access_mcp_resource` are built-ins; tools the bridge
//! advertises are registered as external tools that proxy through it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::llm::ToolDefinition;
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

pub const USE_MCP_TOOL: &str = "use_mcp_tool";
pub const ACCESS_MCP_RESOURCE: &str = "access_mcp_resource";

/// A tool exposed by a bridged server.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalToolSpec {
    pub server: String,
    pub definition: ToolDefinition,
}

/// Connection to external tool and resource servers.
#[async_trait]
pub trait ResourceBridge: Send + Sync {
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError>;

    async fn read_resource(
        &self,
        server: &str,
        uri: &str,
        ctx: &ToolContext,
    ) -> Result<String, ToolError>;

    /// Tools to register as first-class external tools.
    async fn list_tools(&self) -> Result<Vec<ExternalToolSpec>, ToolError> {
        Ok(Vec::new())
    }
}

/// Calls a named tool on a bridged server.
pub struct UseMcpTool {
    bridge: Arc<dyn ResourceBridge>,
}

impl UseMcpTool {
    pub fn new(bridge: Arc<dyn ResourceBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Tool for UseMcpTool {
    fn name(&self) -> &str {
        USE_MCP_TOOL
    }

    fn description(&self) -> &str {
        "Call a tool provided by a connected server."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "server_name": {"type": "string", "description": "Server providing the tool"},
                "tool_name": {"type": "string", "description": "Tool to call"},
                "arguments": {"type": "string", "description": "JSON object with the tool's arguments"}
            },
            "required": ["server_name", "tool_name"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let server = require_str(&params, USE_MCP_TOOL, "server_name")?;
        let tool = require_str(&params, USE_MCP_TOOL, "tool_name")?;
        let arguments = match params.get("arguments") {
            None | Some(serde_json::Value::Null) => serde_json::json!({}),
            Some(serde_json::Value::String(raw)) if raw.trim().is_empty() => serde_json::json!({}),
            Some(serde_json::Value::String(raw)) => {
                serde_json::from_str(raw).map_err(|_| ToolError::InvalidParameters {
                    name: USE_MCP_TOOL.to_string(),
                    reason: "Invalid JSON arguments format".to_string(),
                })?
            }
            Some(other) => other.clone(),
        };

        let output = self.bridge.call_tool(server, tool, arguments, ctx).await?;
        let output = if output.is_empty() {
            "No response".to_string()
        } else {
            output
        };
        Ok(ToolOutput::text(output, start.elapsed()))
    }
}

/// Reads a resource from a bridged server.
pub struct AccessMcpResource {
    bridge: Arc<dyn ResourceBridge>,
}

impl AccessMcpResource {
    pub fn new(bridge: Arc<dyn ResourceBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Tool for AccessMcpResource {
    fn name(&self) -> &str {
        ACCESS_MCP_RESOURCE
    }

    fn description(&self) -> &str {
        "Read a resource (file, API response, system data) from a connected server."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "server_name": {"type": "string", "description": "Server providing the resource"},
                "uri": {"type": "string", "description": "URI of the resource"}
            },
            "required": ["server_name", "uri"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let server = require_str(&params, ACCESS_MCP_RESOURCE, "server_name")?;
        let uri = require_str(&params, ACCESS_MCP_RESOURCE, "uri")?;
        let contents = self.bridge.read_resource(server, uri, ctx).await?;
        let contents = if contents.is_empty() {
            "Empty response".to_string()
        } else {
            contents
        };
        Ok(ToolOutput::text(contents, start.elapsed()))
    }
}

/// An advertised server tool, proxied through the bridge.
pub struct ExternalTool {
    bridge: Arc<dyn ResourceBridge>,
    spec: ExternalToolSpec,
}

#[async_trait]
impl Tool for ExternalTool {
    fn name(&self) -> &str {
        &self.spec.definition.name
    }

    fn description(&self) -> &str {
        &self.spec.definition.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.spec.definition.parameters.clone()
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let output = self
            .bridge
            .call_tool(&self.spec.server, &self.spec.definition.name, params, ctx)
            .await?;
        Ok(ToolOutput::text(output, start.elapsed()))
    }
}

/// Register every tool the bridge advertises. Returns how many were accepted.
pub async fn register_external_tools(
    registry: &ToolRegistry,
    bridge: Arc<dyn ResourceBridge>,
) -> Result<usize, ToolError> {
    let mut registered = 0;
    for spec in bridge.list_tools().await? {
        let tool = Arc::new(ExternalTool {
            bridge: Arc::clone(&bridge),
            spec,
        });
        if registry.register(tool).await {
            registered += 1;
        }
    }
    tracing::info!(count = registered, "External tools registered");
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_context;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBridge {
        calls: Mutex<Vec<(String, String, serde_json::Value)>>,
    }

    #[async_trait]
    impl ResourceBridge for RecordingBridge {
        async fn call_tool(
            &self,
            server: &str,
            tool: &str,
            arguments: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<String, ToolError> {
            self.calls
                .lock()
                .unwrap()
                .push((server.to_string(), tool.to_string(), arguments));
            Ok(format!("{server}/{tool} ok"))
        }

        async fn read_resource(
            &self,
            server: &str,
            uri: &str,
            _ctx: &ToolContext,
        ) -> Result<String, ToolError> {
            Ok(format!("contents of {uri} on {server}"))
        }

        async fn list_tools(&self) -> Result<Vec<ExternalToolSpec>, ToolError> {
            Ok(vec![ExternalToolSpec {
                server: "crm".into(),
                definition: ToolDefinition {
                    name: "crm_lookup".into(),
                    description: "Look up a customer".into(),
                    parameters: serde_json::json!({"type": "object"}),
                },
            }])
        }
    }

    #[tokio::test]
    async fn use_mcp_tool_parses_string_arguments() {
        let bridge = Arc::new(RecordingBridge::default());
        let tool = UseMcpTool::new(bridge.clone());
        let output = tool
            .execute(
                serde_json::json!({"server_name": "crm", "tool_name": "find", "arguments": "{\"id\": 7}"}),
                &test_context(),
            )
            .await
            .unwrap();
        assert_eq!(output.output, "crm/find ok");
        let calls = bridge.calls.lock().unwrap();
        assert_eq!(calls[0].2, serde_json::json!({"id": 7}));
    }

    #[tokio::test]
    async fn use_mcp_tool_rejects_bad_json() {
        let tool = UseMcpTool::new(Arc::new(RecordingBridge::default()));
        let err = tool
            .execute(
                serde_json::json!({"server_name": "crm", "tool_name": "find", "arguments": "{oops"}),
                &test_context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn access_resource_requires_uri() {
        let tool = AccessMcpResource::new(Arc::new(RecordingBridge::default()));
        assert!(
            tool.execute(serde_json::json!({"server_name": "crm"}), &test_context())
                .await
                .is_err()
        );
        let output = tool
            .execute(
                serde_json::json!({"server_name": "crm", "uri": "crm://accounts"}),
                &test_context(),
            )
            .await
            .unwrap();
        assert_eq!(output.output, "contents of crm://accounts on crm");
    }

    #[tokio::test]
    async fn advertised_tools_proxy_through_the_bridge() {
        let bridge = Arc::new(RecordingBridge::default());
        let registry = ToolRegistry::new();
        let count = register_external_tools(&registry, bridge.clone())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let tool = registry.get("crm_lookup").await.unwrap();
        let output = tool
            .execute(serde_json::json!({"name": "Ada"}), &test_context())
            .await
            .unwrap();
        assert_eq!(output.output, "crm/crm_lookup ok");
        assert!(!registry.is_builtin("crm_lookup").await);
    }
}
