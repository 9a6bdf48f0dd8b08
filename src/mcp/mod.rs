//! MCP module - Model-Context-Protocol client runtime
//!
//! [`McpClient`] speaks JSON-RPC 2.0 to one tool-server subprocess over
//! stdio; [`McpRuntime`] owns the fleet of clients for one agent profile,
//! watching health and reconnecting with backoff. Registered tools reach
//! their client through the [`ClientResolver`] indirection so reconnects
//! never invalidate a registration.

pub mod client;
pub mod runtime;

pub use client::{McpClient, ToolCallOutcome, WireMode};
pub use runtime::{ClientResolver, McpRuntime, McpServerStatus};

use serde_json::Value;

/// A tool advertised by an MCP server, as returned by `tools/list`.
#[derive(Debug, Clone)]
pub struct McpRemoteTool {
    /// The server that advertised the tool.
    pub server_name: String,
    /// The tool's name on the server (unprefixed).
    pub name: String,
    /// Human-readable description; may be empty.
    pub description: String,
    /// JSON schema of the tool's input; defaults to the empty object schema.
    pub input_schema: Value,
}
