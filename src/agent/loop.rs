//! Agent loop: one per agent profile.
//!
//! Turns one inbound message into an LLM tool-calling iteration: build
//! context, call the provider, execute requested tools under the session's
//! MCP policy, persist the transcript, and hand back (or publish) the
//! reply. Summarization of long histories runs as a detached task so it
//! never blocks a turn.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::config::ResolvedProfile;
use crate::contacts::ContactStore;
use crate::error::{Result, YoctoError};
use crate::mcp::{ClientResolver, McpRuntime, McpServerStatus};
use crate::providers::{ChatOptions, LLMProvider};
use crate::session::{Message, Role, SessionStore, ToolCall};
use crate::tools::{
    EchoTool, McpPolicy, McpTool, MessageTool, Tool, ToolContext, ToolRegistry,
};

use super::context::ContextBuilder;

/// Fixed refusal recorded as the tool result for policy-blocked MCP calls.
pub const MCP_REFUSAL: &str = "Error: MCP tool is not allowed for this contact.";

/// Hard cap on one summarization task.
const SUMMARIZE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// History length above which summarization triggers.
const SUMMARY_HISTORY_THRESHOLD: usize = 20;

/// Messages kept verbatim when history is compacted.
const SUMMARY_KEEP_RECENT: usize = 4;

/// How one turn is processed.
struct TurnOptions {
    session_key: String,
    channel: String,
    chat_id: String,
    user_message: String,
    default_response: String,
    enable_summary: bool,
    send_response: bool,
}

/// The main agent loop: consumes inbound messages for its profile and
/// coordinates provider, tools, sessions, and MCP servers.
pub struct AgentLoop {
    agent_id: String,
    bus: Arc<MessageBus>,
    provider: Arc<dyn LLMProvider>,
    workspace: PathBuf,
    model: String,
    context_window: usize,
    max_iterations: usize,
    default_response: String,
    sessions: SessionStore,
    context_builder: ContextBuilder,
    tools: Arc<RwLock<ToolRegistry>>,
    contacts: Option<Arc<ContactStore>>,
    contacts_only: bool,
    summarizing: std::sync::Mutex<HashSet<String>>,
    mcp_runtime: Arc<McpRuntime>,
}

impl AgentLoop {
    /// Build the loop for one profile: workspace and session storage,
    /// built-in tools, and the MCP runtime (started here; its tools are
    /// bound into the registry).
    pub async fn new(
        profile: ResolvedProfile,
        default_response: &str,
        bus: Arc<MessageBus>,
        provider: Arc<dyn LLMProvider>,
        contacts: Option<Arc<ContactStore>>,
        contacts_only: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&profile.workspace)?;
        let session_path = profile.workspace.join("sessions").join(&profile.agent_id);
        let sessions = SessionStore::with_path(session_path)?;

        let mut registry = ToolRegistry::new();
        registry.register(Box::new(MessageTool::new(Arc::clone(&bus))));
        registry.register(Box::new(EchoTool));

        let mcp_runtime = Arc::new(McpRuntime::new(
            &profile.agent_id,
            profile.mcp_servers.clone(),
        ));
        mcp_runtime.start(cancel).await;
        let mut mcp_tool_count = 0;
        for remote in mcp_runtime.tools().await {
            let resolver: Arc<dyn ClientResolver> = Arc::clone(&mcp_runtime) as Arc<dyn ClientResolver>;
            let tool = McpTool::new(&remote, resolver);
            if registry.has(tool.name()) {
                warn!(
                    agent_id = %profile.agent_id,
                    tool = %tool.name(),
                    "Skipping duplicated MCP tool name"
                );
                continue;
            }
            registry.register(Box::new(tool));
            mcp_tool_count += 1;
        }
        if mcp_tool_count > 0 {
            info!(
                agent_id = %profile.agent_id,
                mcp_tools = mcp_tool_count,
                "Bound MCP tools"
            );
        }

        let mut context_builder = ContextBuilder::new(&profile.workspace);
        if let Some(contacts) = &contacts {
            context_builder = context_builder.with_contacts(Arc::clone(contacts));
        }

        Ok(Arc::new(Self {
            agent_id: profile.agent_id,
            bus,
            provider,
            workspace: profile.workspace,
            model: profile.model,
            context_window: profile.context_window_tokens,
            max_iterations: profile.max_tool_iterations,
            default_response: default_response.to_string(),
            sessions,
            context_builder,
            tools: Arc::new(RwLock::new(registry)),
            contacts,
            contacts_only,
            summarizing: std::sync::Mutex::new(HashSet::new()),
            mcp_runtime,
        }))
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Register an additional tool.
    pub async fn register_tool(&self, tool: Box<dyn Tool>) {
        self.tools.write().await.register(tool);
    }

    /// Status of this profile's MCP servers.
    pub async fn mcp_status(&self) -> Vec<McpServerStatus> {
        self.mcp_runtime.status_snapshot().await
    }

    /// Shut down this loop's MCP runtime.
    pub async fn shutdown(&self) {
        self.mcp_runtime.close().await;
    }

    /// Process one inbound message; `Ok(None)` means no reply should be
    /// published (gated, or the turn already published it itself).
    pub async fn process(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        msg: &InboundMessage,
    ) -> Result<Option<String>> {
        info!(
            agent_id = %self.agent_id,
            channel = %msg.channel,
            chat_id = %msg.chat_id,
            sender = %msg.sender_id,
            session_key = %msg.session_key,
            "Processing message"
        );

        // System messages route back to their origin session.
        if msg.channel == "system" {
            self.process_system(cancel, msg).await?;
            return Ok(None);
        }

        // Contact gate: when contacts_only is enabled, only registered
        // contacts get responses. Internal channels always pass.
        if self.contacts_only && msg.channel != "cli" && msg.channel != "cron" {
            if let Some(contacts) = &self.contacts {
                if !contacts.is_registered(&msg.session_key).await {
                    info!(
                        channel = %msg.channel,
                        session_key = %msg.session_key,
                        "Message ignored: contact not registered"
                    );
                    return Ok(None);
                }
            }
        }

        let content = self
            .run_turn(
                cancel,
                TurnOptions {
                    session_key: msg.session_key.clone(),
                    channel: msg.channel.clone(),
                    chat_id: msg.chat_id.clone(),
                    user_message: msg.content.clone(),
                    default_response: self.default_response.clone(),
                    enable_summary: true,
                    send_response: false,
                },
            )
            .await?;
        Ok(Some(content))
    }

    /// Process a message on the `system` channel: `chat_id` encodes the
    /// origin as `channel:chat_id`; the reply goes straight back to that
    /// origin and summarization is disabled for the turn.
    async fn process_system(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        msg: &InboundMessage,
    ) -> Result<String> {
        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((channel, chat_id)) if !channel.is_empty() => {
                (channel.to_string(), chat_id.to_string())
            }
            _ => ("cli".to_string(), msg.chat_id.clone()),
        };
        let session_key = format!("{}:{}", origin_channel, origin_chat_id);

        self.run_turn(
            cancel,
            TurnOptions {
                session_key,
                channel: origin_channel,
                chat_id: origin_chat_id,
                user_message: format!("[System: {}] {}", msg.sender_id, msg.content),
                default_response: "Background task completed.".to_string(),
                enable_summary: false,
                send_response: true,
            },
        )
        .await
    }

    /// The core turn: build context, iterate LLM/tool calls, persist, and
    /// optionally publish.
    async fn run_turn(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        opts: TurnOptions,
    ) -> Result<String> {
        let policy = self.session_mcp_policy(&opts.session_key).await;

        let history = self.sessions.get_history(&opts.session_key).await;
        let summary = self.sessions.get_summary(&opts.session_key).await;
        let tool_names: Vec<String> = {
            let tools = self.tools.read().await;
            tools.names().iter().map(|s| s.to_string()).collect()
        };
        let mut messages = self
            .context_builder
            .build_messages(
                history,
                summary,
                &opts.user_message,
                &opts.channel,
                &opts.chat_id,
                &tool_names,
                &policy,
            )
            .await;

        self.sessions
            .append(&opts.session_key, Message::user(&opts.user_message))
            .await?;

        let (final_content, iterations) = self
            .run_iterations(cancel, &mut messages, &opts, &policy)
            .await?;

        let final_content = if final_content.is_empty() {
            opts.default_response.clone()
        } else {
            final_content
        };

        self.sessions
            .append(&opts.session_key, Message::assistant(&final_content))
            .await?;
        self.sessions.persist(&opts.session_key).await?;

        if opts.enable_summary {
            self.maybe_summarize(&opts.session_key).await;
        }

        if opts.send_response {
            self.publish_with_delay(
                cancel,
                OutboundMessage::new(&opts.channel, &opts.chat_id, &final_content),
                &opts.session_key,
            )
            .await;
        }

        info!(
            session_key = %opts.session_key,
            iterations = iterations,
            final_length = final_content.len(),
            "Turn completed"
        );
        Ok(final_content)
    }

    /// The LLM call loop with tool handling. Returns the final content and
    /// the iteration count.
    async fn run_iterations(
        &self,
        cancel: &CancellationToken,
        messages: &mut Vec<Message>,
        opts: &TurnOptions,
        policy: &McpPolicy,
    ) -> Result<(String, usize)> {
        let mut iteration = 0;
        let mut final_content = String::new();

        while iteration < self.max_iterations {
            iteration += 1;
            debug!(
                iteration = iteration,
                max = self.max_iterations,
                "LLM iteration"
            );

            let tool_definitions = {
                let tools = self.tools.read().await;
                tools.definitions_for_policy(policy)
            };
            let options = ChatOptions::new().with_max_tokens(8192).with_temperature(0.7);

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(YoctoError::Cancelled),
                result = self.provider.chat(
                    messages.clone(),
                    tool_definitions,
                    Some(&self.model),
                    options,
                ) => result.map_err(|e| {
                    error!(iteration = iteration, error = %e, "LLM call failed");
                    e
                })?,
            };

            if response.tool_calls.is_empty() {
                final_content = response.content;
                info!(
                    iteration = iteration,
                    content_chars = final_content.len(),
                    "LLM response without tool calls"
                );
                break;
            }

            let calls: Vec<ToolCall> = response
                .tool_calls
                .iter()
                .map(|tc| ToolCall::new(&tc.id, &tc.name, &tc.arguments_json()))
                .collect();
            let assistant = Message::assistant_with_tools(&response.content, calls);
            messages.push(assistant.clone());
            self.sessions.append(&opts.session_key, assistant).await?;

            let ctx = ToolContext::new()
                .with_channel(&opts.channel, &opts.chat_id)
                .with_workspace(&self.workspace.to_string_lossy());

            for tool_call in &response.tool_calls {
                info!(tool = %tool_call.name, id = %tool_call.id, "Executing tool");

                let result = if !policy.allows(&tool_call.name) {
                    MCP_REFUSAL.to_string()
                } else {
                    let tools = self.tools.read().await;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(YoctoError::Cancelled),
                        result = tools.execute(
                            &tool_call.name,
                            tool_call.arguments.clone(),
                            &ctx,
                        ) => match result {
                            Ok(output) => output,
                            Err(e) => format!("Error: {}", e),
                        },
                    }
                };

                let tool_msg = Message::tool_result(&tool_call.id, &result);
                messages.push(tool_msg.clone());
                self.sessions.append(&opts.session_key, tool_msg).await?;
            }
        }

        Ok((final_content, iteration))
    }

    /// Publish an outbound message, honouring the contact's response delay.
    /// Cancellation during the delay drops the message.
    pub async fn publish_with_delay(
        &self,
        cancel: &CancellationToken,
        msg: OutboundMessage,
        session_key: &str,
    ) {
        if let Some(contacts) = &self.contacts {
            if let Some(policy) = contacts.policy_for_session(session_key).await {
                let delay = policy.response_delay_seconds;
                if delay > 0 {
                    info!(
                        session_key = %session_key,
                        response_delay_seconds = delay,
                        "Applying contact response delay"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(session_key = %session_key, "Delay cancelled, dropping reply");
                            return;
                        }
                        _ = tokio::time::sleep(std::time::Duration::from_secs(delay)) => {}
                    }
                }
            }
        }

        if let Err(e) = self.bus.publish_outbound(msg).await {
            warn!(error = %e, "Failed to publish outbound message");
        }
    }

    async fn session_mcp_policy(&self, session_key: &str) -> McpPolicy {
        let Some(contacts) = &self.contacts else {
            return McpPolicy::unrestricted();
        };
        match contacts.policy_for_session(session_key).await {
            Some(policy) => McpPolicy::allowing(policy.allowed_mcp_servers.iter()),
            None => McpPolicy::unrestricted(),
        }
    }

    /// Kick off background summarization when the session's history has
    /// outgrown its thresholds. A session already being summarized is left
    /// alone until that task finishes.
    async fn maybe_summarize(self: &Arc<Self>, session_key: &str) {
        let history = self.sessions.get_history(session_key).await;
        if !needs_summary(&history, self.context_window) {
            return;
        }

        {
            let mut summarizing = self
                .summarizing
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !summarizing.insert(session_key.to_string()) {
                return;
            }
        }

        let this = Arc::clone(self);
        let key = session_key.to_string();
        tokio::spawn(async move {
            let result = tokio::time::timeout(SUMMARIZE_TIMEOUT, this.summarize_session(&key)).await;
            if result.is_err() {
                warn!(session_key = %key, "Summarization timed out, history left untouched");
            }
            this.summarizing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        });
    }

    /// Compact a session: summarize everything but the last few messages,
    /// replace the rolling summary, and truncate. Any LLM failure leaves
    /// the session untouched. Normally triggered automatically after a
    /// turn; public so operators can force a pass.
    pub async fn summarize_session(&self, session_key: &str) {
        let history = self.sessions.get_history(session_key).await;
        let existing = self
            .sessions
            .get_summary(session_key)
            .await
            .unwrap_or_default();

        if history.len() <= SUMMARY_KEEP_RECENT {
            return;
        }
        let prefix = &history[..history.len() - SUMMARY_KEEP_RECENT];

        // Oversized guard: a single message above half the context window
        // is dropped from the summarization input (it stays in history).
        let max_message_tokens = self.context_window / 2;
        let mut omitted = false;
        let mut valid: Vec<&Message> = Vec::with_capacity(prefix.len());
        for message in prefix {
            if message.role != Role::User && message.role != Role::Assistant {
                continue;
            }
            if message.content.len() / 4 > max_message_tokens {
                omitted = true;
                continue;
            }
            valid.push(message);
        }
        if valid.is_empty() {
            return;
        }

        let mut final_summary = if valid.len() > 10 {
            let mid = valid.len() / 2;
            let first = match self.summarize_batch(&valid[..mid], "").await {
                Ok(s) => s,
                Err(e) => {
                    warn!(session_key = %session_key, error = %e, "Summarization failed");
                    return;
                }
            };
            let second = match self.summarize_batch(&valid[mid..], "").await {
                Ok(s) => s,
                Err(e) => {
                    warn!(session_key = %session_key, error = %e, "Summarization failed");
                    return;
                }
            };

            let merge_prompt = format!(
                "Merge these two conversation summaries into one cohesive summary:\n\n1: {}\n\n2: {}",
                first, second
            );
            match self
                .provider
                .chat(
                    vec![Message::user(&merge_prompt)],
                    vec![],
                    Some(&self.model),
                    ChatOptions::new().with_max_tokens(1024).with_temperature(0.3),
                )
                .await
            {
                Ok(response) if !response.content.is_empty() => response.content,
                _ => format!("{} {}", first, second),
            }
        } else {
            match self.summarize_batch(&valid, &existing).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(session_key = %session_key, error = %e, "Summarization failed");
                    return;
                }
            }
        };

        if final_summary.is_empty() {
            return;
        }
        if omitted {
            final_summary.push_str("\n[Note: Some oversized messages were omitted from this summary.]");
        }

        let applied = async {
            self.sessions.set_summary(session_key, &final_summary).await?;
            self.sessions
                .truncate_keep_last(session_key, SUMMARY_KEEP_RECENT)
                .await?;
            self.sessions.persist(session_key).await
        }
        .await;
        match applied {
            Ok(()) => info!(session_key = %session_key, "Session summarized"),
            Err(e) => warn!(session_key = %session_key, error = %e, "Failed to apply summary"),
        }
    }

    async fn summarize_batch(&self, batch: &[&Message], existing: &str) -> Result<String> {
        let mut prompt = String::from(
            "Provide a concise summary of this conversation segment, preserving core context and key points.\n",
        );
        if !existing.is_empty() {
            prompt.push_str("Existing context: ");
            prompt.push_str(existing);
            prompt.push('\n');
        }
        prompt.push_str("\nCONVERSATION:\n");
        for message in batch {
            prompt.push_str(&format!("{}: {}\n", message.role, message.content));
        }

        let response = self
            .provider
            .chat(
                vec![Message::user(&prompt)],
                vec![],
                Some(&self.model),
                ChatOptions::new().with_max_tokens(1024).with_temperature(0.3),
            )
            .await?;
        Ok(response.content)
    }

}

/// Whether a session's history has outgrown the summarization thresholds.
pub(crate) fn needs_summary(history: &[Message], context_window: usize) -> bool {
    history.len() > SUMMARY_HISTORY_THRESHOLD
        || estimate_tokens(history) > context_window * 3 / 4
}

/// Rough token estimate: four characters per token.
fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.content.len() / 4).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_of(n: usize, content: &str) -> Vec<Message> {
        (0..n).map(|_| Message::user(content)).collect()
    }

    #[test]
    fn test_needs_summary_history_boundary() {
        // Exactly 20 messages does not trigger; 21 does.
        let window = 1_000_000;
        assert!(!needs_summary(&history_of(20, "short"), window));
        assert!(needs_summary(&history_of(21, "short"), window));
    }

    #[test]
    fn test_needs_summary_token_threshold() {
        // 2 messages well under the count threshold, but over 75% of a
        // tiny context window by estimated tokens.
        let long = "x".repeat(4000); // ~1000 tokens
        let history = vec![Message::user(&long), Message::assistant(&long)];
        assert!(needs_summary(&history, 1000));
        assert!(!needs_summary(&history, 100_000));
    }

    #[test]
    fn test_estimate_tokens() {
        let history = vec![Message::user(&"a".repeat(400))];
        assert_eq!(estimate_tokens(&history), 100);
    }

    #[test]
    fn test_refusal_string() {
        assert_eq!(MCP_REFUSAL, "Error: MCP tool is not allowed for this contact.");
    }
}
