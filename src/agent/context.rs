//! Context builder for agent conversations.
//!
//! Assembles the ordered message list for one LLM call: system prompt
//! (identity, time, workspace, tools, optional skill/memory snippets,
//! contact instructions), a session block, the rolling summary, the
//! session history, the current user message, and (for restricted
//! sessions) a trailing MCP policy notice. The builder never mutates the
//! session; every call returns a fresh list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::contacts::ContactStore;
use crate::session::Message;
use crate::tools::McpPolicy;

/// Identity text opening every system prompt.
const IDENTITY_PROMPT: &str = "You are YoctoClaw, a personal AI gateway agent. \
You relay conversations from messaging channels and act on them with tools.\n\
\n\
You have access to tools to help accomplish tasks. Use them when needed.\n\
Be concise but helpful. Focus on completing the user's request efficiently.";

/// Builder for the message list sent to the LLM.
pub struct ContextBuilder {
    workspace: PathBuf,
    contacts: Option<Arc<ContactStore>>,
    skills_prompt: Option<String>,
    memory_prompt: Option<String>,
}

impl ContextBuilder {
    /// Create a builder rooted at `workspace`.
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            contacts: None,
            skills_prompt: None,
            memory_prompt: None,
        }
    }

    /// Attach the contact store used for per-contact instructions.
    pub fn with_contacts(mut self, contacts: Arc<ContactStore>) -> Self {
        self.contacts = Some(contacts);
        self
    }

    /// Append a skills snippet to the system prompt (collaborator-provided).
    pub fn with_skills(mut self, skills: &str) -> Self {
        self.skills_prompt = Some(skills.to_string());
        self
    }

    /// Append a memory snippet to the system prompt (collaborator-provided).
    pub fn with_memory(mut self, memory: &str) -> Self {
        self.memory_prompt = Some(memory.to_string());
        self
    }

    /// Build the system message for a session.
    pub async fn build_system_message(
        &self,
        channel: &str,
        session_key: &str,
        tool_names: &[String],
    ) -> Message {
        let mut content = String::from(IDENTITY_PROMPT);
        content.push_str(&format!(
            "\n\nCurrent time: {}\nWorkspace: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            self.workspace.display()
        ));

        if !tool_names.is_empty() {
            content.push_str("\n\n## Tools\n");
            content.push_str(&tool_names.join(", "));
        }

        if let Some(skills) = &self.skills_prompt {
            content.push_str("\n\n## Available Skills\n");
            content.push_str(skills);
        }
        if let Some(memory) = &self.memory_prompt {
            content.push_str("\n\n## Memory\n");
            content.push_str(memory);
        }

        if let Some(instructions) = self.contact_instructions(channel, session_key).await {
            content.push_str("\n\n## Contact Instructions\n");
            content.push_str(&instructions);
        }

        Message::system(&content)
    }

    /// Build the full message list for one LLM call.
    #[allow(clippy::too_many_arguments)]
    pub async fn build_messages(
        &self,
        history: Vec<Message>,
        summary: Option<String>,
        user_message: &str,
        channel: &str,
        chat_id: &str,
        tool_names: &[String],
        policy: &McpPolicy,
    ) -> Vec<Message> {
        let session_key = format!("{}:{}", channel, chat_id);
        let mut messages = Vec::with_capacity(history.len() + 4);

        messages.push(
            self.build_system_message(channel, &session_key, tool_names)
                .await,
        );
        messages.push(Message::system(&format!(
            "Current session: channel={} chat_id={}",
            channel, chat_id
        )));

        if let Some(summary) = summary.filter(|s| !s.is_empty()) {
            messages.push(Message::system(&format!(
                "[Conversation Summary]\n{}",
                summary
            )));
        }

        messages.extend(history);

        if !user_message.is_empty() {
            messages.push(Message::user(user_message));
        }

        if policy.is_restricted() {
            messages.push(Message::system(&format!(
                "MCP access for this contact is restricted. You can only use \
                 MCP servers: {}. If MCP access is needed outside this list, \
                 ask for permission first.",
                policy.allowed_sorted().join(", ")
            )));
        }

        messages
    }

    /// The contact's instructions, or the channel default, or nothing.
    async fn contact_instructions(&self, channel: &str, session_key: &str) -> Option<String> {
        let contacts = self.contacts.as_ref()?;
        if let Some(policy) = contacts.policy_for_session(session_key).await {
            if !policy.instructions.trim().is_empty() {
                return Some(policy.instructions);
            }
        }
        contacts
            .get_default(channel)
            .await
            .filter(|s| !s.trim().is_empty())
    }
}
