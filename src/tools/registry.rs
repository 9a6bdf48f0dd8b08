//! Tool registry: named tools with JSON-schema parameters, context-aware
//! execution, and per-session MCP policy filtering.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde_json::Value;
use tracing::{error, info};

use crate::error::Result;
use crate::providers::ToolDefinition;

use super::{Tool, ToolContext};

/// A session's MCP restriction: the set of MCP server names it may use.
///
/// An empty set means unrestricted. Non-MCP tools always pass regardless.
#[derive(Debug, Clone, Default)]
pub struct McpPolicy {
    pub allowed: HashSet<String>,
}

impl McpPolicy {
    /// An unrestricted policy.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// A policy allowing only the named servers (blank names ignored).
    pub fn allowing<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        Self { allowed }
    }

    pub fn is_restricted(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Whether a tool passes this policy. Non-MCP names always pass; an MCP
    /// name passes iff its server is in the allowed set or the set is empty.
    pub fn allows(&self, tool_name: &str) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        match mcp_server_name(tool_name) {
            Some(server) => self.allowed.contains(server),
            None => true,
        }
    }

    /// Allowed server names, sorted for stable prompt text.
    pub fn allowed_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.allowed.iter().cloned().collect();
        names.sort();
        names
    }
}

/// Extract the MCP server name from a registered tool name.
///
/// Recognized shapes: `mcp.<server>.<rest>` (preferred),
/// `mcp_<server>_<rest>`, and `mcp__<server>__<rest>`. Anything else is a
/// non-MCP tool and yields `None`.
pub fn mcp_server_name(tool_name: &str) -> Option<&str> {
    let name = tool_name.trim();
    if let Some(rest) = name.strip_prefix("mcp.") {
        let (server, remainder) = rest.split_once('.')?;
        if server.is_empty() || remainder.is_empty() {
            return None;
        }
        return Some(server);
    }
    if let Some(rest) = name.strip_prefix("mcp__") {
        let (server, remainder) = rest.split_once("__")?;
        if server.is_empty() || remainder.is_empty() {
            return None;
        }
        return Some(server);
    }
    if let Some(rest) = name.strip_prefix("mcp_") {
        let (server, remainder) = rest.split_once('_')?;
        if server.is_empty() || remainder.is_empty() {
            return None;
        }
        return Some(server);
    }
    None
}

/// A registry that holds and executes tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        info!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    /// Remove every tool belonging to the given MCP server.
    pub fn unregister_mcp_server(&mut self, server: &str) {
        self.tools
            .retain(|name, _| mcp_server_name(name) != Some(server));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Whether a tool exists.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names of all registered tools, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name.
    ///
    /// An unknown name is an error; tool failures propagate so the caller
    /// can fold them into the conversation as `Error: <reason>`.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| crate::error::YoctoError::NotFound(format!("tool {}", name)))?;

        let start = Instant::now();
        match tool.execute(args, ctx).await {
            Ok(output) => {
                info!(
                    tool = name,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Tool executed successfully"
                );
                Ok(output)
            }
            Err(e) => {
                error!(
                    tool = name,
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Tool execution failed"
                );
                Err(e)
            }
        }
    }

    /// All tool definitions, as presented to the LLM.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Tool definitions filtered by a session's MCP policy.
    pub fn definitions_for_policy(&self, policy: &McpPolicy) -> Vec<ToolDefinition> {
        self.definitions()
            .into_iter()
            .filter(|d| policy.allows(&d.name))
            .collect()
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
    use crate::tools::EchoTool;
    use serde_json::json;

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(Box::new(EchoTool));
        assert!(registry.has("echo"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().name(), "echo");
        assert!(registry.get("nonexistent").is_none());
    }

    #[tokio::test]
    async fn test_registry_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));

        let ctx = ToolContext::new();
        let result = registry
            .execute("echo", json!({"message": "hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result, "hello");
    }

    #[tokio::test]
    async fn test_registry_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nope", json!({}), &ToolContext::new()).await;
        assert!(matches!(
            result,
            Err(crate::error::YoctoError::NotFound(_))
        ));
    }

    #[test]
    fn test_registry_replace_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        registry.register(Box::new(EchoTool));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_definitions_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert!(defs[0].parameters.is_object());
    }

    #[test]
    fn test_mcp_server_name_dot_form() {
        assert_eq!(mcp_server_name("mcp.fs.read_file"), Some("fs"));
        assert_eq!(mcp_server_name("mcp.web.get.page"), Some("web"));
    }

    #[test]
    fn test_mcp_server_name_underscore_forms() {
        assert_eq!(mcp_server_name("mcp_fs_read"), Some("fs"));
        assert_eq!(mcp_server_name("mcp__fs__read_file"), Some("fs"));
    }

    #[test]
    fn test_mcp_server_name_non_mcp() {
        assert_eq!(mcp_server_name("read_file"), None);
        assert_eq!(mcp_server_name("message"), None);
        assert_eq!(mcp_server_name("mcp."), None);
        assert_eq!(mcp_server_name("mcp.fs"), None);
        assert_eq!(mcp_server_name("mcpish_tool"), None);
    }

    #[test]
    fn test_policy_empty_allows_everything() {
        let policy = McpPolicy::unrestricted();
        assert!(!policy.is_restricted());
        assert!(policy.allows("mcp.fs.read"));
        assert!(policy.allows("message"));
    }

    #[test]
    fn test_policy_restricts_mcp_only() {
        let policy = McpPolicy::allowing(["fs"]);
        assert!(policy.is_restricted());
        assert!(policy.allows("mcp.fs.read"));
        assert!(!policy.allows("mcp.web.get"));
        // Non-MCP tools remain available.
        assert!(policy.allows("message"));
        assert!(policy.allows("read_file"));
    }

    #[test]
    fn test_policy_ignores_blank_names() {
        let policy = McpPolicy::allowing(["  ", ""]);
        assert!(!policy.is_restricted());
    }

    #[test]
    fn test_policy_allowed_sorted() {
        let policy = McpPolicy::allowing(["web", "fs"]);
        assert_eq!(policy.allowed_sorted(), vec!["fs", "web"]);
    }

    struct FakeMcpTool(&'static str);

    #[async_trait::async_trait]
    impl Tool for FakeMcpTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
            Ok("ok".to_string())
        }
    }

    #[test]
    fn test_definitions_for_policy() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        registry.register(Box::new(FakeMcpTool("mcp.fs.read")));
        registry.register(Box::new(FakeMcpTool("mcp.web.get")));

        let unrestricted = registry.definitions_for_policy(&McpPolicy::unrestricted());
        assert_eq!(unrestricted.len(), 3);

        let restricted = registry.definitions_for_policy(&McpPolicy::allowing(["fs"]));
        let names: Vec<&str> = restricted.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "mcp.fs.read"]);
    }

    #[test]
    fn test_unregister_mcp_server() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        registry.register(Box::new(FakeMcpTool("mcp.fs.read")));
        registry.register(Box::new(FakeMcpTool("mcp.fs.write")));
        registry.register(Box::new(FakeMcpTool("mcp.web.get")));

        registry.unregister_mcp_server("fs");
        assert_eq!(registry.names(), vec!["echo", "mcp.web.get"]);
    }
}
