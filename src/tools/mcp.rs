//! MCP tool wrapper: bridges a remote MCP tool into the tool registry.
//!
//! The wrapper stores only `(server_name, remote_name)` and a resolver
//! handle; the live client is looked up on every call, so a reconnected
//! server serves existing registrations without re-binding.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, YoctoError};
use crate::mcp::{ClientResolver, McpRemoteTool};

use super::{Tool, ToolContext};

/// A remote MCP tool registered under the local name
/// `mcp.<server>.<remote>`.
pub struct McpTool {
    local_name: String,
    server_name: String,
    remote_name: String,
    description: String,
    parameters: Value,
    resolver: Arc<dyn ClientResolver>,
}

impl McpTool {
    /// Wrap a remote tool. Blank descriptions get a generated one; a
    /// missing input schema was already defaulted by the client.
    pub fn new(remote: &McpRemoteTool, resolver: Arc<dyn ClientResolver>) -> Self {
        let local_name = format!(
            "mcp.{}.{}",
            sanitize_token(&remote.server_name),
            sanitize_token(&remote.name)
        );
        let description = if remote.description.trim().is_empty() {
            format!(
                "MCP tool {} from server {}",
                remote.name, remote.server_name
            )
        } else {
            remote.description.trim().to_string()
        };
        Self {
            local_name,
            server_name: remote.server_name.clone(),
            remote_name: remote.name.clone(),
            description,
            parameters: remote.input_schema.clone(),
            resolver,
        }
    }

    /// The server this tool belongs to.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The tool's name on the server (unprefixed).
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.local_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let client = self
            .resolver
            .client(&self.server_name)
            .await
            .ok_or_else(|| {
                YoctoError::Mcp(format!(
                    "mcp server {:?} is not connected",
                    self.server_name
                ))
            })?;

        let outcome = client.call_tool(&self.remote_name, args).await?;
        if outcome.is_error {
            return Err(YoctoError::Tool(outcome.text));
        }
        Ok(outcome.text)
    }
}

/// Lowercase a name token and replace whitespace and `/` with `_`.
fn sanitize_token(value: &str) -> String {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return "unknown".to_string();
    }
    value
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::McpClient;
    use serde_json::json;

    struct NoClients;

    #[async_trait]
    impl ClientResolver for NoClients {
        async fn client(&self, _server_name: &str) -> Option<Arc<McpClient>> {
            None
        }
    }

    fn remote(server: &str, name: &str, description: &str) -> McpRemoteTool {
        McpRemoteTool {
            server_name: server.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn test_local_name_prefixed() {
        let tool = McpTool::new(&remote("fs", "read_file", "Read a file"), Arc::new(NoClients));
        assert_eq!(tool.name(), "mcp.fs.read_file");
        assert_eq!(tool.server_name(), "fs");
        assert_eq!(tool.remote_name(), "read_file");
    }

    #[test]
    fn test_local_name_sanitized() {
        let tool = McpTool::new(
            &remote("My Server", "Read/File", "d"),
            Arc::new(NoClients),
        );
        assert_eq!(tool.name(), "mcp.my_server.read_file");
    }

    #[test]
    fn test_blank_description_generated() {
        let tool = McpTool::new(&remote("fs", "read", "   "), Arc::new(NoClients));
        assert_eq!(tool.description(), "MCP tool read from server fs");
    }

    #[test]
    fn test_parameters_pass_through() {
        let mut r = remote("fs", "read", "d");
        r.input_schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        let tool = McpTool::new(&r, Arc::new(NoClients));
        assert_eq!(tool.parameters(), r.input_schema);
    }

    #[tokio::test]
    async fn test_execute_without_client_fails_not_connected() {
        let tool = McpTool::new(&remote("fs", "read", "d"), Arc::new(NoClients));
        let result = tool.execute(json!({"path": "/x"}), &ToolContext::new()).await;
        match result {
            Err(YoctoError::Mcp(msg)) => assert!(msg.contains("not connected")),
            other => panic!("expected Mcp error, got {:?}", other),
        }
    }

    #[test]
    fn test_sanitize_token() {
        assert_eq!(sanitize_token("Simple"), "simple");
        assert_eq!(sanitize_token("two words"), "two_words");
        assert_eq!(sanitize_token("a/b"), "a_b");
        assert_eq!(sanitize_token("  "), "unknown");
        assert_eq!(sanitize_token(""), "unknown");
    }
}
