//! Per-conversation response cache
//!
//! A pure projection of delivered responses, keyed by (chat id, artifact
//! id) and written through to a durable key-value backend so a reloaded
//! client can resume an in-progress token chain without re-issuing
//! requests. The cache never originates data, and a missing or failing
//! backend is a cache miss, never a caller error.

use crate::protocol::{AssertionsFrame, EvidenceFrame, TokenFrame};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A cached response. Serialized with the same `type` tags as the wire, so
/// a cache entry is byte-compatible with the frame that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CachedArtifact {
    TaskToken(TokenFrame),
    Assertions(AssertionsFrame),
    Evidence(EvidenceFrame),
}

/// Durable key-value surface behind the cache: one JSON map of artifact id
/// to last response per conversation.
pub trait CacheBackend: Send + Sync {
    fn load_chat(&self, chat_id: &str) -> Result<Option<HashMap<String, CachedArtifact>>, String>;
    fn store_chat(
        &self,
        chat_id: &str,
        entries: &HashMap<String, CachedArtifact>,
    ) -> Result<(), String>;
    fn remove_chat(&self, chat_id: &str) -> Result<(), String>;
}

/// In-process backend for tests and cache-less operation.
#[derive(Default)]
pub struct MemoryBackend {
    chats: Mutex<HashMap<String, HashMap<String, CachedArtifact>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn load_chat(&self, chat_id: &str) -> Result<Option<HashMap<String, CachedArtifact>>, String> {
        Ok(self.chats.lock().unwrap().get(chat_id).cloned())
    }

    fn store_chat(
        &self,
        chat_id: &str,
        entries: &HashMap<String, CachedArtifact>,
    ) -> Result<(), String> {
        self.chats
            .lock()
            .unwrap()
            .insert(chat_id.to_string(), entries.clone());
        Ok(())
    }

    fn remove_chat(&self, chat_id: &str) -> Result<(), String> {
        self.chats.lock().unwrap().remove(chat_id);
        Ok(())
    }
}

/// Synchronous, write-through store of completed responses.
pub struct CacheStore {
    entries: Mutex<HashMap<String, HashMap<String, CachedArtifact>>>,
    backend: Arc<dyn CacheBackend>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            backend,
        }
    }

    /// Purely in-memory store (no durable backing).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Load the persisted maps for the given conversations, typically at
    /// startup with the ids of every known topic.
    pub fn restore(&self, chat_ids: &[String]) {
        let mut entries = self.entries.lock().unwrap();
        for chat_id in chat_ids {
            match self.backend.load_chat(chat_id) {
                Ok(Some(map)) => {
                    entries.insert(chat_id.clone(), map);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(chat_id, error = %e, "cache restore failed"),
            }
        }
    }

    /// Overwrite the entry for (chat, artifact) and write the chat's map
    /// through to the backend.
    pub fn put(&self, chat_id: &str, artifact_id: &str, artifact: CachedArtifact) {
        let mut entries = self.entries.lock().unwrap();
        let chat = entries.entry(chat_id.to_string()).or_default();
        chat.insert(artifact_id.to_string(), artifact);
        self.persist(chat_id, chat);
    }

    pub fn get(&self, chat_id: &str, artifact_id: &str) -> Option<CachedArtifact> {
        self.entries
            .lock()
            .unwrap()
            .get(chat_id)
            .and_then(|chat| chat.get(artifact_id))
            .cloned()
    }

    pub fn contains(&self, chat_id: &str, artifact_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(chat_id)
            .is_some_and(|chat| chat.contains_key(artifact_id))
    }

    /// Drop a single entry (used when a continuation token is consumed).
    pub fn delete_one(&self, chat_id: &str, artifact_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(chat) = entries.get_mut(chat_id) {
            chat.remove(artifact_id);
            self.persist(chat_id, chat);
        }
    }

    /// Keep only the entries whose ids appear in `keep`; used after an
    /// edit truncates the conversation.
    pub fn retain_only(&self, chat_id: &str, keep: &[String]) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(chat) = entries.get_mut(chat_id) {
            chat.retain(|id, _| keep.iter().any(|k| k == id));
            self.persist(chat_id, chat);
        }
    }

    /// Drop every entry for a conversation (topic deletion).
    pub fn remove_chat(&self, chat_id: &str) {
        self.entries.lock().unwrap().remove(chat_id);
        if let Err(e) = self.backend.remove_chat(chat_id) {
            tracing::warn!(chat_id, error = %e, "cache removal failed");
        }
    }

    /// Push a (id, text) pair onto the parallel sequences of a cached
    /// assertions success. No-op when the entry is missing, a different
    /// kind, or the error variant.
    pub fn append_assertion(&self, chat_id: &str, statement_id: &str, id: &str, text: &str) {
        let mut entries = self.entries.lock().unwrap();
        let Some(chat) = entries.get_mut(chat_id) else {
            return;
        };
        let Some(CachedArtifact::Assertions(frame)) = chat.get_mut(statement_id) else {
            return;
        };
        if frame.is_error() {
            return;
        }
        frame.ids.push(id.to_string());
        frame.assertions.push(text.to_string());
        self.persist(chat_id, chat);
    }

    fn persist(&self, chat_id: &str, chat: &HashMap<String, CachedArtifact>) {
        if let Err(e) = self.backend.store_chat(chat_id, chat) {
            tracing::warn!(chat_id, error = %e, "cache write-through failed");
        }
    }
}
