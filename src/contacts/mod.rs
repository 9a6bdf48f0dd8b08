//! Contact policy store - per-session overrides
//!
//! A [`ContactPolicy`] attaches an agent profile, an MCP allow-list, custom
//! instructions, and a response delay to one conversation. Lookup is by
//! session key: exact `"channel:chat_id"` first, then (for WhatsApp-shaped
//! JIDs) a retry with the chat id truncated at the first `@`. That
//! stripping rule lives here and nowhere else.
//!
//! Channel-level default instructions are kept separately, with `"*"` as
//! the global fallback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, YoctoError};

/// Upper bound for a contact's response delay.
pub const MAX_RESPONSE_DELAY_SECONDS: u64 = 3600;

/// Per-contact overrides for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactPolicy {
    /// Contact identifier within the channel (the chat id side of the key).
    pub contact_id: String,
    /// Channel the contact lives on (e.g. "whatsapp").
    pub channel: String,
    /// Display name for listings.
    #[serde(default)]
    pub display_name: String,
    /// Agent profile handling this contact; empty means the default agent.
    #[serde(default)]
    pub agent_id: String,
    /// MCP servers this contact may use; empty means unrestricted.
    #[serde(default)]
    pub allowed_mcp_servers: Vec<String>,
    /// Custom instructions appended to the system prompt.
    #[serde(default)]
    pub instructions: String,
    /// Delay applied before replies are published, in seconds.
    #[serde(default)]
    pub response_delay_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContactPolicy {
    /// Create a policy for `channel:contact_id` with empty overrides.
    pub fn new(channel: &str, contact_id: &str) -> Self {
        let now = Utc::now();
        Self {
            contact_id: contact_id.to_string(),
            channel: channel.to_string(),
            display_name: String::new(),
            agent_id: String::new(),
            allowed_mcp_servers: Vec::new(),
            instructions: String::new(),
            response_delay_seconds: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The session key this policy binds to.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.contact_id)
    }
}

/// Store of contact policies and channel default instructions.
pub struct ContactStore {
    policies: Arc<RwLock<HashMap<String, ContactPolicy>>>,
    defaults: Arc<RwLock<HashMap<String, String>>>,
    storage_dir: Option<PathBuf>,
}

impl ContactStore {
    /// Create an in-memory store without persistence.
    pub fn new_memory() -> Self {
        Self {
            policies: Arc::new(RwLock::new(HashMap::new())),
            defaults: Arc::new(RwLock::new(HashMap::new())),
            storage_dir: None,
        }
    }

    /// Create a store persisting under `dir` and load existing state.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub async fn with_dir(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let store = Self {
            policies: Arc::new(RwLock::new(HashMap::new())),
            defaults: Arc::new(RwLock::new(HashMap::new())),
            storage_dir: Some(dir),
        };
        store.load().await;
        Ok(store)
    }

    /// Get a policy by channel and contact id.
    pub async fn get(&self, channel: &str, contact_id: &str) -> Option<ContactPolicy> {
        let policies = self.policies.read().await;
        policies.get(&make_key(channel, contact_id)).cloned()
    }

    /// Insert or update a policy. The response delay is clamped to
    /// `[0, 3600]`; timestamps are managed by the store.
    pub async fn set(&self, mut policy: ContactPolicy) -> Result<()> {
        policy.response_delay_seconds = policy
            .response_delay_seconds
            .min(MAX_RESPONSE_DELAY_SECONDS);
        let key = policy.session_key();
        {
            let mut policies = self.policies.write().await;
            match policies.get_mut(&key) {
                Some(existing) => {
                    policy.created_at = existing.created_at;
                    policy.updated_at = Utc::now();
                    *existing = policy;
                }
                None => {
                    let now = Utc::now();
                    policy.created_at = now;
                    policy.updated_at = now;
                    policies.insert(key, policy);
                }
            }
        }
        self.save_policies().await
    }

    /// Remove a policy.
    ///
    /// # Errors
    /// [`YoctoError::NotFound`] when no policy exists for the key.
    pub async fn delete(&self, channel: &str, contact_id: &str) -> Result<()> {
        let key = make_key(channel, contact_id);
        {
            let mut policies = self.policies.write().await;
            if policies.remove(&key).is_none() {
                return Err(YoctoError::NotFound(format!("contact policy {}", key)));
            }
        }
        self.save_policies().await
    }

    /// All policies, sorted by session key.
    pub async fn list(&self) -> Vec<ContactPolicy> {
        let policies = self.policies.read().await;
        let mut all: Vec<ContactPolicy> = policies.values().cloned().collect();
        all.sort_by(|a, b| a.session_key().cmp(&b.session_key()));
        all
    }

    /// Number of registered policies.
    pub async fn count(&self) -> usize {
        self.policies.read().await.len()
    }

    /// Look up the policy for a session key.
    ///
    /// Tries the exact key first; on a miss, WhatsApp-shaped chat ids are
    /// retried with everything after the first `@` stripped
    /// (`whatsapp:5511@s.whatsapp.net` → `whatsapp:5511`).
    pub async fn policy_for_session(&self, session_key: &str) -> Option<ContactPolicy> {
        let policies = self.policies.read().await;
        if let Some(policy) = policies.get(session_key) {
            return Some(policy.clone());
        }

        let (channel, chat_id) = session_key.split_once(':')?;
        if channel.is_empty() {
            return None;
        }
        let at = chat_id.find('@')?;
        if at == 0 {
            return None;
        }
        policies
            .get(&make_key(channel, &chat_id[..at]))
            .cloned()
    }

    /// Whether a session has a registered contact policy.
    pub async fn is_registered(&self, session_key: &str) -> bool {
        self.policy_for_session(session_key).await.is_some()
    }

    /// Default instructions for a channel, falling back to the `"*"` entry.
    pub async fn get_default(&self, channel: &str) -> Option<String> {
        let defaults = self.defaults.read().await;
        defaults
            .get(channel)
            .or_else(|| defaults.get("*"))
            .cloned()
    }

    /// Set default instructions for a channel (use `"*"` for global).
    pub async fn set_default(&self, channel: &str, instructions: &str) -> Result<()> {
        {
            let mut defaults = self.defaults.write().await;
            defaults.insert(channel.to_string(), instructions.to_string());
        }
        self.save_defaults().await
    }

    /// Remove a channel's default instructions.
    ///
    /// # Errors
    /// [`YoctoError::NotFound`] when the channel has no default.
    pub async fn delete_default(&self, channel: &str) -> Result<()> {
        {
            let mut defaults = self.defaults.write().await;
            if defaults.remove(channel).is_none() {
                return Err(YoctoError::NotFound(format!(
                    "default instructions for channel {}",
                    channel
                )));
            }
        }
        self.save_defaults().await
    }

    /// All channel defaults.
    pub async fn list_defaults(&self) -> HashMap<String, String> {
        self.defaults.read().await.clone()
    }

    async fn load(&self) {
        let Some(dir) = &self.storage_dir else {
            return;
        };

        if let Ok(content) = tokio::fs::read_to_string(dir.join("policies.json")).await {
            if let Ok(items) = serde_json::from_str::<Vec<ContactPolicy>>(&content) {
                let mut policies = self.policies.write().await;
                for item in items {
                    policies.insert(item.session_key(), item);
                }
            }
        }

        if let Ok(content) = tokio::fs::read_to_string(dir.join("defaults.json")).await {
            if let Ok(items) = serde_json::from_str::<HashMap<String, String>>(&content) {
                *self.defaults.write().await = items;
            }
        }
    }

    async fn save_policies(&self) -> Result<()> {
        let Some(dir) = &self.storage_dir else {
            return Ok(());
        };
        let items = self.list().await;
        let content = serde_json::to_string_pretty(&items)?;
        tokio::fs::write(dir.join("policies.json"), content).await?;
        Ok(())
    }

    async fn save_defaults(&self) -> Result<()> {
        let Some(dir) = &self.storage_dir else {
            return Ok(());
        };
        let items = self.list_defaults().await;
        let content = serde_json::to_string_pretty(&items)?;
        tokio::fs::write(dir.join("defaults.json"), content).await?;
        Ok(())
    }
}

impl Clone for ContactStore {
    fn clone(&self) -> Self {
        Self {
            policies: Arc::clone(&self.policies),
            defaults: Arc::clone(&self.defaults),
            storage_dir: self.storage_dir.clone(),
        }
    }
}

impl Default for ContactStore {
    fn default() -> Self {
        Self::new_memory()
    }
}

fn make_key(channel: &str, contact_id: &str) -> String {
    format!("{}:{}", channel, contact_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = ContactStore::new_memory();
        let mut policy = ContactPolicy::new("telegram", "42");
        policy.display_name = "Alice".to_string();
        store.set(policy).await.unwrap();

        let found = store.get("telegram", "42").await.unwrap();
        assert_eq!(found.display_name, "Alice");
        assert_eq!(store.count().await, 1);

        store.delete("telegram", "42").await.unwrap();
        assert!(store.get("telegram", "42").await.is_none());
        assert!(matches!(
            store.delete("telegram", "42").await,
            Err(YoctoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_preserves_created_at() {
        let store = ContactStore::new_memory();
        store
            .set(ContactPolicy::new("telegram", "42"))
            .await
            .unwrap();
        let created = store.get("telegram", "42").await.unwrap().created_at;

        let mut update = ContactPolicy::new("telegram", "42");
        update.instructions = "be brief".to_string();
        store.set(update).await.unwrap();

        let found = store.get("telegram", "42").await.unwrap();
        assert_eq!(found.created_at, created);
        assert_eq!(found.instructions, "be brief");
    }

    #[tokio::test]
    async fn test_response_delay_clamped() {
        let store = ContactStore::new_memory();
        let mut policy = ContactPolicy::new("telegram", "42");
        policy.response_delay_seconds = 90_000;
        store.set(policy).await.unwrap();
        assert_eq!(
            store
                .get("telegram", "42")
                .await
                .unwrap()
                .response_delay_seconds,
            MAX_RESPONSE_DELAY_SECONDS
        );
    }

    #[tokio::test]
    async fn test_policy_for_session_exact() {
        let store = ContactStore::new_memory();
        store
            .set(ContactPolicy::new("telegram", "42"))
            .await
            .unwrap();
        assert!(store.policy_for_session("telegram:42").await.is_some());
        assert!(store.policy_for_session("telegram:43").await.is_none());
        assert!(store.is_registered("telegram:42").await);
    }

    #[tokio::test]
    async fn test_policy_for_session_strips_whatsapp_jid() {
        let store = ContactStore::new_memory();
        store
            .set(ContactPolicy::new("whatsapp", "5511982650676"))
            .await
            .unwrap();

        let found = store
            .policy_for_session("whatsapp:5511982650676@s.whatsapp.net")
            .await;
        assert!(found.is_some());
        assert_eq!(found.unwrap().contact_id, "5511982650676");

        // The stripped form is also a direct hit.
        assert!(store
            .policy_for_session("whatsapp:5511982650676")
            .await
            .is_some());
        // A different number does not match.
        assert!(store
            .policy_for_session("whatsapp:999@s.whatsapp.net")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_policy_for_session_malformed_keys() {
        let store = ContactStore::new_memory();
        store.set(ContactPolicy::new("whatsapp", "x")).await.unwrap();
        assert!(store.policy_for_session("no-colon-here").await.is_none());
        assert!(store.policy_for_session(":justchat").await.is_none());
        assert!(store.policy_for_session("whatsapp:@host").await.is_none());
    }

    #[tokio::test]
    async fn test_defaults_with_global_fallback() {
        let store = ContactStore::new_memory();
        assert!(store.get_default("telegram").await.is_none());

        store.set_default("*", "global rules").await.unwrap();
        store.set_default("telegram", "tg rules").await.unwrap();

        assert_eq!(
            store.get_default("telegram").await.as_deref(),
            Some("tg rules")
        );
        assert_eq!(
            store.get_default("discord").await.as_deref(),
            Some("global rules")
        );
    }

    #[tokio::test]
    async fn test_set_default_overwrites() {
        let store = ContactStore::new_memory();
        store.set_default("telegram", "x").await.unwrap();
        store.set_default("telegram", "y").await.unwrap();
        assert_eq!(store.get_default("telegram").await.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_delete_default() {
        let store = ContactStore::new_memory();
        store.set_default("telegram", "x").await.unwrap();
        store.delete_default("telegram").await.unwrap();
        assert!(store.get_default("telegram").await.is_none());
        assert!(matches!(
            store.delete_default("telegram").await,
            Err(YoctoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().to_path_buf();

        {
            let store = ContactStore::with_dir(dir.clone()).await.unwrap();
            let mut policy = ContactPolicy::new("whatsapp", "5511");
            policy.agent_id = "work".to_string();
            policy.allowed_mcp_servers = vec!["fs".to_string()];
            policy.response_delay_seconds = 30;
            store.set(policy).await.unwrap();
            store.set_default("*", "be nice").await.unwrap();
        }

        let store = ContactStore::with_dir(dir).await.unwrap();
        let policy = store.get("whatsapp", "5511").await.unwrap();
        assert_eq!(policy.agent_id, "work");
        assert_eq!(policy.allowed_mcp_servers, vec!["fs"]);
        assert_eq!(policy.response_delay_seconds, 30);
        assert_eq!(store.get_default("qq").await.as_deref(), Some("be nice"));
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let store = ContactStore::new_memory();
        store.set(ContactPolicy::new("b", "2")).await.unwrap();
        store.set(ContactPolicy::new("a", "1")).await.unwrap();
        let all = store.list().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_key(), "a:1");
        assert_eq!(all[1].session_key(), "b:2");
    }
}
