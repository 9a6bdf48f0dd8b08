//! Session module - per-session conversation state
//!
//! The [`SessionStore`] keeps one entry per session key with shared reads
//! and exclusive writes per key. Every accessor hands out copies, never
//! live references; persistence to disk happens only when the agent loop
//! calls [`SessionStore::persist`].

pub mod types;

pub use types::{Message, Role, Session, SessionMeta, ToolCall};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;

/// Store for conversation sessions, keyed by `"channel:chat_id"`.
///
/// Entries live behind per-key locks so concurrent turns on different
/// sessions never contend. With a storage path set, `persist` writes each
/// session as a JSON file whose name is the percent-encoded key.
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Arc<RwLock<Session>>>>>,
    storage_path: Option<PathBuf>,
}

impl SessionStore {
    /// Create an in-memory store without persistence.
    pub fn new_memory() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: None,
        }
    }

    /// Create a store persisting sessions under `path`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: Some(path),
        })
    }

    /// Get a copy of an existing session or create a new empty one.
    ///
    /// With persistence enabled, a session absent from memory is loaded
    /// from disk before a fresh one is created.
    pub async fn get_or_create(&self, key: &str) -> Result<Session> {
        let entry = self.entry(key).await?;
        let session = entry.read().await;
        Ok(session.clone())
    }

    /// Append a message to a session, creating the session if needed.
    pub async fn append(&self, key: &str, message: Message) -> Result<()> {
        let entry = self.entry(key).await?;
        let mut session = entry.write().await;
        session.add_message(message);
        Ok(())
    }

    /// Get a copy of a session's message history. Mutating the returned
    /// value never affects the store.
    pub async fn get_history(&self, key: &str) -> Vec<Message> {
        if let Some(entry) = self.lookup(key).await {
            let session = entry.read().await;
            return session.messages.clone();
        }
        Vec::new()
    }

    /// Get a session's rolling summary, if any.
    pub async fn get_summary(&self, key: &str) -> Option<String> {
        let entry = self.lookup(key).await?;
        let session = entry.read().await;
        session.summary.clone().filter(|s| !s.is_empty())
    }

    /// Replace a session's rolling summary.
    pub async fn set_summary(&self, key: &str, summary: &str) -> Result<()> {
        let entry = self.entry(key).await?;
        let mut session = entry.write().await;
        session.set_summary(summary);
        Ok(())
    }

    /// Truncate a session's history to the last `n` messages.
    ///
    /// Leading orphan `tool` messages left by the cut are dropped too, so
    /// every remaining tool result still follows its assistant parent.
    pub async fn truncate_keep_last(&self, key: &str, n: usize) -> Result<()> {
        let entry = self.entry(key).await?;
        let mut session = entry.write().await;
        let len = session.messages.len();
        if len > n {
            session.messages.drain(..len - n);
        }
        let orphans = session
            .messages
            .iter()
            .take_while(|m| m.role == Role::Tool)
            .count();
        if orphans > 0 {
            session.messages.drain(..orphans);
        }
        session.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Metadata for every session currently known to the store.
    pub async fn list(&self) -> Vec<SessionMeta> {
        let sessions = self.sessions.read().await;
        let mut metas = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            let session = entry.read().await;
            metas.push(SessionMeta::from(&*session));
        }
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        metas
    }

    /// Write a session to disk (no-op without a storage path).
    pub async fn persist(&self, key: &str) -> Result<()> {
        let Some(storage_path) = &self.storage_path else {
            return Ok(());
        };
        let Some(entry) = self.lookup(key).await else {
            return Ok(());
        };
        let content = {
            let session = entry.read().await;
            serde_json::to_string_pretty(&*session)?
        };
        let file_path = storage_path.join(format!("{}.json", sanitize_key(key)));
        tokio::fs::write(&file_path, content).await?;
        Ok(())
    }

    /// Delete a session from memory and disk.
    pub async fn delete(&self, key: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(key);
        }
        if let Some(storage_path) = &self.storage_path {
            let file_path = storage_path.join(format!("{}.json", sanitize_key(key)));
            if file_path.exists() {
                tokio::fs::remove_file(&file_path).await?;
            }
        }
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Option<Arc<RwLock<Session>>> {
        let sessions = self.sessions.read().await;
        sessions.get(key).cloned()
    }

    async fn entry(&self, key: &str) -> Result<Arc<RwLock<Session>>> {
        if let Some(entry) = self.lookup(key).await {
            return Ok(entry);
        }

        // Load from disk before creating fresh.
        let mut loaded = None;
        if let Some(storage_path) = &self.storage_path {
            let file_path = storage_path.join(format!("{}.json", sanitize_key(key)));
            if file_path.exists() {
                let content = tokio::fs::read_to_string(&file_path).await?;
                loaded = Some(serde_json::from_str::<Session>(&content)?);
            }
        }

        let mut sessions = self.sessions.write().await;
        // Another task may have created the entry while we awaited.
        if let Some(entry) = sessions.get(key) {
            return Ok(Arc::clone(entry));
        }
        let session = loaded.unwrap_or_else(|| Session::new(key));
        let entry = Arc::new(RwLock::new(session));
        sessions.insert(key.to_string(), Arc::clone(&entry));
        Ok(entry)
    }
}

impl Clone for SessionStore {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            storage_path: self.storage_path.clone(),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new_memory()
    }
}

/// Sanitize a session key for use as a filename.
///
/// Percent-encodes filename-hostile characters so the mapping is bijective:
/// `"telegram:chat123"` → `"telegram%3Achat123"`.
fn sanitize_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len() * 3);
    for c in key.chars() {
        match c {
            '/' => result.push_str("%2F"),
            '\\' => result.push_str("%5C"),
            ':' => result.push_str("%3A"),
            '*' => result.push_str("%2A"),
            '?' => result.push_str("%3F"),
            '"' => result.push_str("%22"),
            '<' => result.push_str("%3C"),
            '>' => result.push_str("%3E"),
            '|' => result.push_str("%7C"),
            '%' => result.push_str("%25"),
            c => result.push(c),
        }
    }
    result
}
