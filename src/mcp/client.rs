//! MCP client: one JSON-RPC 2.0 session to one tool-server subprocess.
//!
//! Transports are framed JSON-RPC messages over the child's stdin/stdout.
//! Two wire framings exist in the wild and servers do not advertise which
//! they speak, so startup races one candidate per framing:
//!
//! - *LSP-style*: each message prefixed by `Content-Length: N\r\n\r\n`
//! - *JSON-line*: each message terminated by `\n`
//!
//! The first candidate whose `initialize` round-trip succeeds wins; the
//! loser is closed and its process killed.
//!
//! Requests are correlated through a pending map of integer ids to oneshot
//! waiters. Stdout EOF, a framing decode error, process exit, or an
//! explicit close all transition the client to its terminal closed state:
//! stdin is shut, the process killed, and every pending request fails with
//! the close reason. A reply arriving for an abandoned id is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::McpRemoteTool;
use crate::error::{Result, YoctoError};

/// Overall deadline for one framing candidate's `initialize` round-trip.
/// Generous because `uvx`/`npx` servers may download on first run.
const INITIALIZE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// The MCP protocol revision this client speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Wire framing for JSON-RPC messages on the stdio pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// `Content-Length: N\r\n\r\n` prefixed frames.
    Lsp,
    /// One JSON document per line.
    JsonLine,
}

impl std::fmt::Display for WireMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireMode::Lsp => write!(f, "LSP"),
            WireMode::JsonLine => write!(f, "JSON-line"),
        }
    }
}

/// Result of one `tools/call`: the flattened text plus the server's error
/// flag. `is_error` still carries text the model should see.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub text: String,
    pub is_error: bool,
}

type RpcReply = std::result::Result<Value, YoctoError>;

struct Shared {
    server_name: String,
    stdin: Mutex<ChildStdin>,
    pending: Mutex<HashMap<i64, oneshot::Sender<RpcReply>>>,
    closed: CancellationToken,
    close_reason: std::sync::Mutex<Option<String>>,
}

impl Shared {
    /// Transition to the terminal closed state. Only the first reason
    /// sticks; later calls are no-ops.
    async fn close_with_reason(&self, reason: &str) {
        {
            let mut guard = self
                .close_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return;
            }
            *guard = Some(reason.to_string());
        }
        self.closed.cancel();
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let waiters: Vec<(i64, oneshot::Sender<RpcReply>)> =
            self.pending.lock().await.drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(YoctoError::Mcp(reason.to_string())));
        }
    }

    fn reason(&self) -> String {
        self.close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }
}

/// One JSON-RPC session to one MCP server subprocess.
pub struct McpClient {
    shared: Arc<Shared>,
    wire_mode: WireMode,
    next_id: AtomicI64,
}

impl McpClient {
    /// Start a client for `command`, racing both wire framings.
    ///
    /// The child inherits the parent environment extended by `env`; argv is
    /// passed verbatim (no shell). The first framing whose `initialize`
    /// succeeds within the deadline wins; the loser is killed. Both failing
    /// yields the first error.
    pub async fn start(
        cancel: &CancellationToken,
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        if server_name.trim().is_empty() {
            return Err(YoctoError::Mcp("server name is required".to_string()));
        }
        if command.trim().is_empty() {
            return Err(YoctoError::Mcp("command is required".to_string()));
        }

        let race = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<(WireMode, Result<McpClient>)>(2);

        for mode in [WireMode::Lsp, WireMode::JsonLine] {
            let tx = tx.clone();
            let race = race.clone();
            let server_name = server_name.to_string();
            let command = command.to_string();
            let args = args.to_vec();
            let env = env.clone();
            tokio::spawn(async move {
                let result =
                    Self::start_with_mode(race, mode, &server_name, &command, &args, &env).await;
                if let Err(send_err) = tx.send((mode, result)).await {
                    // The caller stopped listening; don't leak the process.
                    let (_, result) = send_err.0;
                    if let Ok(client) = result {
                        client.close("start abandoned").await;
                    }
                }
            });
        }
        drop(tx);

        let mut first_err: Option<YoctoError> = None;
        let mut winner: Option<(WireMode, McpClient)> = None;
        for _ in 0..2 {
            match rx.recv().await {
                Some((mode, Ok(client))) => {
                    winner = Some((mode, client));
                    break;
                }
                Some((_, Err(e))) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                None => break,
            }
        }

        if let Some((mode, client)) = winner {
            race.cancel();
            // Close the losing candidate if it connects after the winner.
            tokio::spawn(async move {
                while let Some((_, result)) = rx.recv().await {
                    if let Ok(loser) = result {
                        loser.close("lost framing race").await;
                    }
                }
            });
            info!(server = %client.server_name(), wire_mode = %mode, "MCP client connected");
            return Ok(client);
        }

        Err(first_err.unwrap_or_else(|| {
            YoctoError::Mcp(format!("all wire modes failed for {:?}", server_name))
        }))
    }

    async fn start_with_mode(
        race: CancellationToken,
        mode: WireMode,
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| YoctoError::Mcp(format!("start command {:?}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| YoctoError::Mcp("failed to capture child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| YoctoError::Mcp("failed to capture child stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| YoctoError::Mcp("failed to capture child stderr".to_string()))?;

        let shared = Arc::new(Shared {
            server_name: server_name.to_string(),
            stdin: Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
            close_reason: std::sync::Mutex::new(None),
        });

        Self::spawn_read_loop(Arc::clone(&shared), mode, BufReader::new(stdout));
        Self::spawn_stderr_loop(Arc::clone(&shared), BufReader::new(stderr));
        Self::spawn_wait_loop(Arc::clone(&shared), child);

        let client = Self {
            shared,
            wire_mode: mode,
            next_id: AtomicI64::new(0),
        };

        let init = tokio::select! {
            _ = race.cancelled() => Err(YoctoError::Cancelled),
            result = tokio::time::timeout(INITIALIZE_TIMEOUT, client.initialize()) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(YoctoError::Mcp(format!(
                        "initialize mcp server {:?} timed out",
                        server_name
                    ))),
                }
            }
        };
        if let Err(e) = init {
            client.close("initialize failed").await;
            return Err(e);
        }
        Ok(client)
    }

    /// The server name this client was started for.
    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    /// The wire framing the server negotiated.
    pub fn wire_mode(&self) -> WireMode {
        self.wire_mode
    }

    /// A token cancelled when the client reaches its terminal closed state.
    pub fn closed(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    /// `(closed, reason)`; the reason is empty for an explicit clean close.
    pub fn state(&self) -> (bool, String) {
        if self.shared.closed.is_cancelled() {
            (true, self.shared.reason())
        } else {
            (false, String::new())
        }
    }

    /// Close the client: shut stdin, kill the process, fail all pending
    /// requests.
    pub async fn close(&self, reason: &str) {
        self.shared.close_with_reason(reason).await;
    }

    /// List the server's tools, following `nextCursor` pagination.
    pub async fn list_tools(&self) -> Result<Vec<McpRemoteTool>> {
        #[derive(Deserialize)]
        struct ToolEntry {
            name: String,
            #[serde(default)]
            description: String,
            #[serde(default, rename = "inputSchema")]
            input_schema: Option<Value>,
        }
        #[derive(Deserialize)]
        struct ToolsListResult {
            #[serde(default)]
            tools: Vec<ToolEntry>,
            #[serde(default, rename = "nextCursor")]
            next_cursor: Option<String>,
        }

        let mut tools = Vec::new();
        let mut cursor = String::new();

        loop {
            let mut params = serde_json::Map::new();
            if !cursor.is_empty() {
                params.insert("cursor".to_string(), Value::String(cursor.clone()));
            }

            let raw = self.request("tools/list", Value::Object(params)).await?;
            let page: ToolsListResult = serde_json::from_value(raw)
                .map_err(|e| YoctoError::Mcp(format!("decode tools/list: {}", e)))?;

            for entry in page.tools {
                tools.push(McpRemoteTool {
                    server_name: self.shared.server_name.clone(),
                    name: entry.name,
                    description: entry.description,
                    input_schema: entry
                        .input_schema
                        .unwrap_or_else(default_input_schema),
                });
            }

            match page.next_cursor.as_deref().map(str::trim) {
                Some(next) if !next.is_empty() => cursor = next.to_string(),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Call a remote tool. `is_error` results still carry the text output.
    pub async fn call_tool(&self, remote_name: &str, args: Value) -> Result<ToolCallOutcome> {
        let raw = self
            .request(
                "tools/call",
                json!({ "name": remote_name, "arguments": args }),
            )
            .await?;

        #[derive(Deserialize)]
        struct CallResult {
            #[serde(default)]
            content: Vec<Value>,
            #[serde(default, rename = "structuredContent")]
            structured_content: Option<Value>,
            #[serde(default, rename = "isError")]
            is_error: bool,
        }

        let result: CallResult = serde_json::from_value(raw)
            .map_err(|e| YoctoError::Mcp(format!("decode tools/call result: {}", e)))?;

        let mut parts = Vec::with_capacity(result.content.len());
        for item in &result.content {
            if item.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        parts.push(text.to_string());
                        continue;
                    }
                }
            }
            parts.push(item.to_string());
        }

        let text = if !parts.is_empty() {
            parts.join("\n")
        } else if let Some(structured) = &result.structured_content {
            structured.to_string()
        } else {
            "{}".to_string()
        };

        Ok(ToolCallOutcome {
            text,
            is_error: result.is_error,
        })
    }

    async fn initialize(&self) -> Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
        .await
        .map_err(|e| {
            YoctoError::Mcp(format!(
                "initialize mcp server {:?}: {}",
                self.shared.server_name, e
            ))
        })?;

        self.notify("notifications/initialized", json!({})).await
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.shared.closed.is_cancelled() {
            return Err(YoctoError::Mcp(self.close_reason_or_default()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let msg = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_message(&msg).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        tokio::select! {
            _ = self.shared.closed.cancelled() => {
                self.shared.pending.lock().await.remove(&id);
                Err(YoctoError::Mcp(self.close_reason_or_default()))
            }
            reply = rx => match reply {
                Ok(result) => result,
                Err(_) => Err(YoctoError::Mcp(self.close_reason_or_default())),
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_message(&msg).await
    }

    async fn write_message(&self, msg: &Value) -> Result<()> {
        let body = serde_json::to_vec(msg)?;
        let mut stdin = self.shared.stdin.lock().await;
        match self.wire_mode {
            WireMode::Lsp => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                stdin.write_all(header.as_bytes()).await?;
                stdin.write_all(&body).await?;
            }
            WireMode::JsonLine => {
                stdin.write_all(&body).await?;
                stdin.write_all(b"\n").await?;
            }
        }
        stdin.flush().await?;
        Ok(())
    }

    fn close_reason_or_default(&self) -> String {
        let reason = self.shared.reason();
        if reason.is_empty() {
            "mcp client closed".to_string()
        } else {
            reason
        }
    }

    fn spawn_read_loop<R>(shared: Arc<Shared>, mode: WireMode, mut reader: BufReader<R>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let reason = loop {
                let body = match mode {
                    WireMode::Lsp => match read_lsp_frame(&mut reader).await {
                        Ok(body) => body,
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            break format!(
                                "mcp server {:?} closed stdout",
                                shared.server_name
                            );
                        }
                        Err(e) => {
                            break format!(
                                "read frame from {:?}: {}",
                                shared.server_name, e
                            );
                        }
                    },
                    WireMode::JsonLine => {
                        let mut line = String::new();
                        match reader.read_line(&mut line).await {
                            Ok(0) => {
                                break format!(
                                    "mcp server {:?} closed stdout",
                                    shared.server_name
                                );
                            }
                            Ok(_) if line.trim().is_empty() => continue,
                            Ok(_) => line.into_bytes(),
                            Err(e) => {
                                break format!(
                                    "read line from {:?}: {}",
                                    shared.server_name, e
                                );
                            }
                        }
                    }
                };

                let msg: RpcMessage = match serde_json::from_slice(&body) {
                    Ok(msg) => msg,
                    Err(e) => match mode {
                        // An LSP frame is well-delimited; garbage inside one
                        // frame does not desynchronize the stream.
                        WireMode::Lsp => {
                            warn!(
                                server = %shared.server_name,
                                error = %e,
                                "invalid JSON from MCP server"
                            );
                            continue;
                        }
                        WireMode::JsonLine => {
                            break format!(
                                "decode json-line message from {:?}: {}",
                                shared.server_name, e
                            );
                        }
                    },
                };

                let Some(id) = parse_id(msg.id.as_ref()) else {
                    // Request or notification from the server; ignored.
                    continue;
                };

                let waiter = shared.pending.lock().await.remove(&id);
                let Some(waiter) = waiter else {
                    // Late reply for an abandoned request.
                    continue;
                };

                let reply = match msg.error {
                    Some(err) => Err(YoctoError::Mcp(format!(
                        "mcp error {}: {}",
                        err.code, err.message
                    ))),
                    None => Ok(msg.result.unwrap_or(Value::Null)),
                };
                let _ = waiter.send(reply);
            };

            shared.close_with_reason(&reason).await;
        });
    }

    fn spawn_stderr_loop<R>(shared: Arc<Shared>, reader: BufReader<R>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                debug!(server = %shared.server_name, line = %line, "MCP server stderr");
            }
        });
    }

    fn spawn_wait_loop(shared: Arc<Shared>, mut child: Child) {
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!(
                            "mcp process {:?} exited: {}",
                            shared.server_name, status
                        ),
                        Err(e) => format!(
                            "mcp process {:?} wait failed: {}",
                            shared.server_name, e
                        ),
                    };
                    shared.close_with_reason(&reason).await;
                }
                _ = shared.closed.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        });
    }
}

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// The empty object schema used when a server omits `inputSchema`.
pub(crate) fn default_input_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Parse a JSON-RPC id into the integer space this client allocates from.
fn parse_id(id: Option<&Value>) -> Option<i64> {
    match id? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Read one `Content-Length`-framed message body.
///
/// Header lines are consumed up to the blank separator; unknown headers are
/// skipped. A missing `Content-Length` is an `InvalidData` error.
async fn read_lsp_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "eof while reading frame header",
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let parsed = value.trim().parse::<usize>().map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid Content-Length: {}", e),
                    )
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let Some(len) = content_length else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing Content-Length header",
        ));
    };
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_variants() {
        assert_eq!(parse_id(Some(&json!(7))), Some(7));
        assert_eq!(parse_id(Some(&json!(7.0))), Some(7));
        assert_eq!(parse_id(Some(&json!("12"))), Some(12));
        assert_eq!(parse_id(Some(&json!("abc"))), None);
        assert_eq!(parse_id(Some(&json!(null))), None);
        assert_eq!(parse_id(None), None);
    }

    #[tokio::test]
    async fn test_read_lsp_frame() {
        let body = br#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let framed = format!(
            "Content-Length: {}\r\n\r\n{}",
            body.len(),
            String::from_utf8_lossy(body)
        );
        let mut reader = BufReader::new(framed.as_bytes());
        let frame = read_lsp_frame(&mut reader).await.unwrap();
        assert_eq!(frame, body);
    }

    #[tokio::test]
    async fn test_read_lsp_frame_extra_headers() {
        let framed = "Content-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
        let mut reader = BufReader::new(framed.as_bytes());
        let frame = read_lsp_frame(&mut reader).await.unwrap();
        assert_eq!(frame, b"{}");
    }

    #[tokio::test]
    async fn test_read_lsp_frame_missing_length() {
        let framed = "Content-Type: application/json\r\n\r\n{}";
        let mut reader = BufReader::new(framed.as_bytes());
        let err = read_lsp_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_lsp_frame_eof() {
        let mut reader = BufReader::new(&b""[..]);
        let err = read_lsp_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_lsp_frame_consecutive() {
        let framed = "Content-Length: 2\r\n\r\n{}Content-Length: 4\r\n\r\ntrue";
        let mut reader = BufReader::new(framed.as_bytes());
        assert_eq!(read_lsp_frame(&mut reader).await.unwrap(), b"{}");
        assert_eq!(read_lsp_frame(&mut reader).await.unwrap(), b"true");
    }

    #[test]
    fn test_rpc_message_decode() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#;
        let msg: RpcMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parse_id(msg.id.as_ref()), Some(3));
        assert!(msg.result.is_some());
        assert!(msg.error.is_none());

        let raw = r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"no such method"}}"#;
        let msg: RpcMessage = serde_json::from_str(raw).unwrap();
        let err = msg.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "no such method");
    }

    #[test]
    fn test_default_input_schema_shape() {
        let schema = default_input_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_wire_mode_display() {
        assert_eq!(WireMode::Lsp.to_string(), "LSP");
        assert_eq!(WireMode::JsonLine.to_string(), "JSON-line");
    }

    #[tokio::test]
    async fn test_start_rejects_blank_inputs() {
        let cancel = CancellationToken::new();
        let env = HashMap::new();
        assert!(McpClient::start(&cancel, "", "cmd", &[], &env).await.is_err());
        assert!(McpClient::start(&cancel, "srv", " ", &[], &env)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_start_nonexistent_command_fails() {
        let cancel = CancellationToken::new();
        let env = HashMap::new();
        let result = McpClient::start(
            &cancel,
            "ghost",
            "/nonexistent/definitely-not-a-binary",
            &[],
            &env,
        )
        .await;
        assert!(result.is_err());
    }
}
