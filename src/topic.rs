//! Conversation (topic) model
//!
//! An ordered list of topics, each an append-only message sequence except
//! for explicit edit (truncate-and-replace) and delete. The list is owned
//! here and written through to the persistence collaborator; the cache
//! store references topics only by id.

use crate::protocol::Evidence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Titles are truncated to this many characters at creation.
pub const TITLE_DISPLAY_LEN: usize = 25;

/// A message in a conversation, discriminated the way the service labels
/// authors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    User {
        id: String,
        text: String,
    },
    Bot {
        id: String,
        text: String,
    },
    Error {
        id: String,
        text: String,
    },
    Evidence {
        id: String,
        text: String,
        evidence: Evidence,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message::User {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
        }
    }

    pub fn bot(id: impl Into<String>, text: impl Into<String>) -> Self {
        Message::Bot {
            id: id.into(),
            text: text.into(),
        }
    }

    /// Error messages get a derived id so they never collide with the
    /// artifact they report on.
    pub fn error(artifact_id: &str, text: impl Into<String>) -> Self {
        Message::Error {
            id: format!("{artifact_id}error"),
            text: text.into(),
        }
    }

    pub fn evidence(id: impl Into<String>, text: impl Into<String>, evidence: Evidence) -> Self {
        Message::Evidence {
            id: id.into(),
            text: text.into(),
            evidence,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Message::User { id, .. }
            | Message::Bot { id, .. }
            | Message::Error { id, .. }
            | Message::Evidence { id, .. } => id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Message::User { text, .. }
            | Message::Bot { text, .. }
            | Message::Error { text, .. }
            | Message::Evidence { text, .. } => text,
        }
    }
}

/// One conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Topic {
    pub fn new(id: impl Into<String>, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: truncate_title(title),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }
}

fn truncate_title(title: &str) -> String {
    title.chars().take(TITLE_DISPLAY_LEN).collect()
}

/// Load/save of the full ordered topic list; the core is opaque to how it
/// is stored.
pub trait TopicStore: Send + Sync {
    fn load(&self) -> Result<Vec<Topic>, String>;
    fn save(&self, topics: &[Topic]) -> Result<(), String>;
}

/// In-process store for tests and store-less operation.
#[derive(Default)]
pub struct MemoryTopicStore {
    topics: Mutex<Vec<Topic>>,
}

impl MemoryTopicStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TopicStore for MemoryTopicStore {
    fn load(&self) -> Result<Vec<Topic>, String> {
        Ok(self.topics.lock().unwrap().clone())
    }

    fn save(&self, topics: &[Topic]) -> Result<(), String> {
        *self.topics.lock().unwrap() = topics.to_vec();
        Ok(())
    }
}

/// The in-memory topic list, newest first, written through to the store on
/// every mutation.
pub struct TopicBook {
    topics: Mutex<Vec<Topic>>,
    store: Arc<dyn TopicStore>,
}

impl TopicBook {
    /// Construct from the persisted list; a load fault starts empty.
    pub fn load(store: Arc<dyn TopicStore>) -> Self {
        let topics = store.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "topic load failed, starting empty");
            Vec::new()
        });
        Self {
            topics: Mutex::new(topics),
            store,
        }
    }

    pub fn add(&self, id: &str, title: &str) -> Topic {
        let topic = Topic::new(id, title);
        let mut topics = self.topics.lock().unwrap();
        topics.insert(0, topic.clone());
        self.persist(&topics);
        topic
    }

    pub fn list(&self) -> Vec<Topic> {
        self.topics.lock().unwrap().clone()
    }

    pub fn get(&self, id: &str) -> Option<Topic> {
        self.topics
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.topics
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn rename(&self, id: &str, title: &str) -> bool {
        self.with_topic(id, |topic| {
            topic.title = title.to_string();
        })
    }

    /// Bump the updated timestamp (every new user message does this).
    pub fn touch(&self, id: &str) -> bool {
        self.with_topic(id, |topic| {
            topic.updated_at = Utc::now();
        })
    }

    pub fn push_message(&self, id: &str, message: Message) -> bool {
        self.with_topic(id, |topic| {
            topic.messages.push(message);
        })
    }

    pub fn delete_message(&self, id: &str, message_id: &str) -> bool {
        self.with_topic(id, |topic| {
            topic.messages.retain(|m| m.id() != message_id);
        })
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut topics = self.topics.lock().unwrap();
        let before = topics.len();
        topics.retain(|t| t.id != id);
        let removed = topics.len() != before;
        if removed {
            self.persist(&topics);
        }
        removed
    }

    /// Truncate the conversation at `message_id`, discarding it and
    /// everything after it. Returns the ids of the kept messages, or
    /// `None` when the topic or message does not exist.
    pub fn truncate_at(&self, id: &str, message_id: &str) -> Option<Vec<String>> {
        let mut topics = self.topics.lock().unwrap();
        let topic = topics.iter_mut().find(|t| t.id == id)?;
        let index = topic.messages.iter().position(|m| m.id() == message_id)?;
        topic.messages.truncate(index);
        let kept = topic.messages.iter().map(|m| m.id().to_string()).collect();
        self.persist(&topics);
        Some(kept)
    }

    fn with_topic(&self, id: &str, f: impl FnOnce(&mut Topic)) -> bool {
        let mut topics = self.topics.lock().unwrap();
        let Some(topic) = topics.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        f(topic);
        self.persist(&topics);
        true
    }

    fn persist(&self, topics: &[Topic]) {
        if let Err(e) = self.store.save(topics) {
            tracing::warn!(error = %e, "topic save failed");
        }
    }
}
