//! MCP runtime: fleet health for one agent profile's tool servers.
//!
//! The runtime starts every enabled server concurrently, keeps a shared
//! snapshot of clients, remote tools, and per-server status, and watches
//! each connected client for failure. A crashed server is retried on a
//! fixed backoff schedule; a successful reconnect restores its tools and
//! resets the attempt counter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{McpClient, McpRemoteTool};
use crate::config::McpServerSpec;
use crate::error::{Result, YoctoError};

/// Deadline for starting one server (spawn + framing race + initialize).
const START_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for the post-connect `tools/list`.
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(20);

/// Reconnect delays; one entry per attempt, at most five per disconnect.
const RECONNECT_BACKOFF: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(60),
];

/// Looks up the current live client for a server.
///
/// Registered MCP tools resolve their client through this on every call, so
/// the runtime can swap clients across reconnects without invalidating the
/// registration.
#[async_trait]
pub trait ClientResolver: Send + Sync {
    async fn client(&self, server_name: &str) -> Option<Arc<McpClient>>;
}

/// Point-in-time status of one configured server.
#[derive(Debug, Clone, Serialize)]
pub struct McpServerStatus {
    pub server_name: String,
    pub enabled: bool,
    pub command: String,
    pub connected: bool,
    pub tool_count: usize,
    pub error: String,
}

#[derive(Default)]
struct RuntimeState {
    clients: HashMap<String, Arc<McpClient>>,
    tools: Vec<McpRemoteTool>,
    status: HashMap<String, McpServerStatus>,
}

/// Owns the MCP clients for one agent profile.
pub struct McpRuntime {
    agent_id: String,
    servers: Vec<McpServerSpec>,
    state: Arc<tokio::sync::RwLock<RuntimeState>>,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl McpRuntime {
    /// Create a runtime for `servers`; nothing is started yet.
    pub fn new(agent_id: &str, servers: Vec<McpServerSpec>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            servers,
            state: Arc::new(tokio::sync::RwLock::new(RuntimeState::default())),
            cancel: std::sync::Mutex::new(None),
        }
    }

    /// Start every enabled server concurrently; returns when all attempts
    /// have resolved. Failures are absorbed into the status table and do
    /// not prevent other servers from starting.
    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let cancel = parent.child_token();
        {
            let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(cancel.clone());
        }

        let mut joins = JoinSet::new();
        for spec in self.servers.clone() {
            let name = spec.name.trim().to_string();
            if name.is_empty() {
                continue;
            }

            {
                let mut state = self.state.write().await;
                state.status.insert(
                    name.clone(),
                    McpServerStatus {
                        server_name: name.clone(),
                        enabled: spec.enabled,
                        command: spec.command.clone(),
                        connected: false,
                        tool_count: 0,
                        error: String::new(),
                    },
                );
            }

            if !spec.enabled {
                continue;
            }

            let runtime = Arc::clone(self);
            let cancel = cancel.clone();
            joins.spawn(async move {
                if runtime.connect_server(&spec, &cancel).await.is_ok() {
                    let watcher = Arc::clone(&runtime);
                    tokio::spawn(async move {
                        watcher.watch_server(spec, cancel).await;
                    });
                }
            });
        }
        while joins.join_next().await.is_some() {}
    }

    /// Remote tools currently advertised across all connected servers.
    pub async fn tools(&self) -> Vec<McpRemoteTool> {
        self.state.read().await.tools.clone()
    }

    /// The live client for a server, if connected. The returned handle may
    /// change across reconnects; resolve it per call.
    pub async fn client(&self, server_name: &str) -> Option<Arc<McpClient>> {
        self.state.read().await.clients.get(server_name).cloned()
    }

    /// A copy of the status table, sorted by server name.
    pub async fn status_snapshot(&self) -> Vec<McpServerStatus> {
        let state = self.state.read().await;
        let mut statuses: Vec<McpServerStatus> = state.status.values().cloned().collect();
        statuses.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        statuses
    }

    /// Shut down the runtime: cancel watchers and close every client.
    pub async fn close(&self) {
        let token = {
            let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(token) = token {
            token.cancel();
        }

        let mut state = self.state.write().await;
        let RuntimeState { clients, status, tools } = &mut *state;
        for (name, client) in clients.drain() {
            client.close("runtime stopped").await;
            if let Some(status) = status.get_mut(&name) {
                status.connected = false;
                status.error = "stopped".to_string();
            }
        }
        tools.clear();
    }

    /// Attempt one start + list-tools sequence and commit it to the shared
    /// state on success.
    async fn connect_server(
        &self,
        spec: &McpServerSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let name = spec.name.trim();

        // A scoped token so a start timeout also aborts the framing race
        // instead of leaving candidates running toward their own deadline.
        let attempt = cancel.child_token();
        let started = tokio::time::timeout(
            START_TIMEOUT,
            McpClient::start(&attempt, name, &spec.command, &spec.args, &spec.env),
        )
        .await;
        let client = match started {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                self.record_failure(name, &e.to_string()).await;
                warn!(
                    agent_id = %self.agent_id,
                    server = %name,
                    error = %e,
                    "Failed to start MCP server"
                );
                return Err(e);
            }
            Err(_) => {
                attempt.cancel();
                let e = YoctoError::Mcp(format!("start of {:?} timed out", name));
                self.record_failure(name, &e.to_string()).await;
                warn!(agent_id = %self.agent_id, server = %name, "MCP server start timed out");
                return Err(e);
            }
        };

        let tools = match tokio::time::timeout(LIST_TOOLS_TIMEOUT, client.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                self.record_failure(name, &e.to_string()).await;
                warn!(
                    agent_id = %self.agent_id,
                    server = %name,
                    error = %e,
                    "Failed to list MCP tools"
                );
                client.close("tools/list failed").await;
                return Err(e);
            }
            Err(_) => {
                let e = YoctoError::Mcp(format!("tools/list for {:?} timed out", name));
                self.record_failure(name, &e.to_string()).await;
                client.close("tools/list timed out").await;
                return Err(e);
            }
        };

        let tool_count = tools.len();
        {
            let mut state = self.state.write().await;
            state.clients.insert(name.to_string(), Arc::new(client));
            state.tools.extend(tools);
            if let Some(status) = state.status.get_mut(name) {
                status.connected = true;
                status.tool_count = tool_count;
                status.error.clear();
            }
        }

        info!(
            agent_id = %self.agent_id,
            server = %name,
            tool_count = tool_count,
            "MCP server connected"
        );
        Ok(())
    }

    /// Watch one connected server; on close, reconnect with backoff.
    async fn watch_server(self: Arc<Self>, spec: McpServerSpec, cancel: CancellationToken) {
        let name = spec.name.trim().to_string();

        'watch: loop {
            let Some(client) = self.client(&name).await else {
                return;
            };

            let closed = client.closed();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = closed.cancelled() => {}
            }
            if cancel.is_cancelled() {
                return;
            }

            self.detach_server(&name).await;

            for (attempt, delay) in RECONNECT_BACKOFF.iter().enumerate() {
                warn!(
                    agent_id = %self.agent_id,
                    server = %name,
                    attempt = attempt + 1,
                    delay_s = delay.as_secs(),
                    "MCP server disconnected, attempting reconnect"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(*delay) => {}
                }

                if self.connect_server(&spec, &cancel).await.is_ok() {
                    info!(
                        agent_id = %self.agent_id,
                        server = %name,
                        attempt = attempt + 1,
                        "MCP server reconnected"
                    );
                    // Attempt counter resets; keep watching the new client.
                    continue 'watch;
                }
            }

            error!(
                agent_id = %self.agent_id,
                server = %name,
                max_retries = RECONNECT_BACKOFF.len(),
                "MCP server reconnection exhausted"
            );
            let mut state = self.state.write().await;
            if let Some(status) = state.status.get_mut(&name) {
                status.connected = false;
                status.error = "reconnection exhausted".to_string();
            }
            return;
        }
    }

    /// Remove a server's client and tools from the shared snapshot and mark
    /// it disconnected.
    async fn detach_server(&self, name: &str) {
        let mut state = self.state.write().await;
        state.clients.remove(name);
        state.tools.retain(|t| t.server_name != name);
        if let Some(status) = state.status.get_mut(name) {
            status.connected = false;
            status.tool_count = 0;
            status.error = "disconnected, reconnecting...".to_string();
        }
    }

    async fn record_failure(&self, name: &str, error: &str) {
        let mut state = self.state.write().await;
        if let Some(status) = state.status.get_mut(name) {
            status.connected = false;
            status.tool_count = 0;
            status.error = error.to_string();
        }
    }
}

#[async_trait]
impl ClientResolver for McpRuntime {
    async fn client(&self, server_name: &str) -> Option<Arc<McpClient>> {
        McpRuntime::client(self, server_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, command: &str, enabled: bool) -> McpServerSpec {
        McpServerSpec {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled,
        }
    }

    #[tokio::test]
    async fn test_runtime_empty_servers() {
        let runtime = Arc::new(McpRuntime::new("default", Vec::new()));
        let cancel = CancellationToken::new();
        runtime.start(&cancel).await;
        assert!(runtime.tools().await.is_empty());
        assert!(runtime.status_snapshot().await.is_empty());
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_runtime_disabled_server_recorded_not_started() {
        let runtime = Arc::new(McpRuntime::new(
            "default",
            vec![spec("sleepy", "/bin/true", false)],
        ));
        let cancel = CancellationToken::new();
        runtime.start(&cancel).await;

        let statuses = runtime.status_snapshot().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].server_name, "sleepy");
        assert!(!statuses[0].enabled);
        assert!(!statuses[0].connected);
        assert!(runtime.client("sleepy").await.is_none());
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_runtime_blank_name_skipped() {
        let runtime = Arc::new(McpRuntime::new(
            "default",
            vec![spec("  ", "/bin/true", true)],
        ));
        let cancel = CancellationToken::new();
        runtime.start(&cancel).await;
        assert!(runtime.status_snapshot().await.is_empty());
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_runtime_failed_start_records_error() {
        let runtime = Arc::new(McpRuntime::new(
            "default",
            vec![spec("ghost", "/nonexistent/not-a-binary", true)],
        ));
        let cancel = CancellationToken::new();
        runtime.start(&cancel).await;

        let statuses = runtime.status_snapshot().await;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].connected);
        assert!(!statuses[0].error.is_empty());
        assert_eq!(statuses[0].tool_count, 0);
        assert!(runtime.client("ghost").await.is_none());
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_status_snapshot_sorted_and_copied() {
        let runtime = Arc::new(McpRuntime::new(
            "default",
            vec![spec("zeta", "/bin/true", false), spec("alpha", "/bin/true", false)],
        ));
        let cancel = CancellationToken::new();
        runtime.start(&cancel).await;

        let mut statuses = runtime.status_snapshot().await;
        assert_eq!(statuses[0].server_name, "alpha");
        assert_eq!(statuses[1].server_name, "zeta");

        // Mutating the snapshot does not affect the runtime.
        statuses[0].connected = true;
        let fresh = runtime.status_snapshot().await;
        assert!(!fresh[0].connected);
        runtime.close().await;
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(RECONNECT_BACKOFF.len(), 5);
        assert_eq!(RECONNECT_BACKOFF[0], Duration::from_secs(5));
        assert_eq!(RECONNECT_BACKOFF[1], Duration::from_secs(10));
        assert_eq!(RECONNECT_BACKOFF[2], Duration::from_secs(30));
        assert_eq!(RECONNECT_BACKOFF[3], Duration::from_secs(60));
        assert_eq!(RECONNECT_BACKOFF[4], Duration::from_secs(60));
    }
}
