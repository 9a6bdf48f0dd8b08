//! Tools module - tool definitions and execution for LLM function calling
//!
//! - [`Tool`] trait: the interface every tool implements
//! - [`ToolContext`]: execution context (channel, chat_id, workspace)
//! - [`ToolRegistry`]: named registry with policy-aware definitions
//! - [`McpPolicy`]: per-session MCP server allow-list
//!
//! Built-in tools: [`MessageTool`] (proactive outbound sends through the
//! bus), [`McpTool`] (bridges a remote MCP tool through the runtime), and
//! [`EchoTool`] (trivial; mainly a test anchor).

pub mod mcp;
pub mod message;
mod registry;
mod types;

pub use mcp::McpTool;
pub use message::MessageTool;
pub use registry::{mcp_server_name, McpPolicy, ToolRegistry};
pub use types::{Tool, ToolContext};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A tool that echoes back its `message` argument.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the provided message"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo back"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        Ok(message.to_string())
    }
}
