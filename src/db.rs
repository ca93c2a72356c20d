//! Durable backing for the cache store and the topic list
//!
//! One SQLite database holds both collaborator surfaces: the per-chat
//! response cache (a JSON map per conversation, mirroring the original
//! key-value layout) and the ordered topic list. The `Session` sees only
//! the `CacheBackend` and `TopicStore` traits.

use crate::cache::{CacheBackend, CachedArtifact};
use crate::topic::{Topic, TopicStore};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Corrupt timestamp: {0}")]
    CorruptTimestamp(#[from] chrono::ParseError),
}

pub type DbResult<T> = Result<T, DbError>;

/// SQL schema for initialization
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS response_cache (
    chat_id TEXT PRIMARY KEY,
    entries TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS topics (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    messages TEXT NOT NULL,
    position INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_topics_position ON topics(position);
";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Response cache ====================

    pub fn cache_entries(
        &self,
        chat_id: &str,
    ) -> DbResult<Option<HashMap<String, CachedArtifact>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT entries FROM response_cache WHERE chat_id = ?1")?;
        let mut rows = stmt.query(params![chat_id])?;
        match rows.next()? {
            Some(row) => {
                let entries: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&entries)?))
            }
            None => Ok(None),
        }
    }

    pub fn put_cache_entries(
        &self,
        chat_id: &str,
        entries: &HashMap<String, CachedArtifact>,
    ) -> DbResult<()> {
        let entries = serde_json::to_string(entries)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO response_cache (chat_id, entries) VALUES (?1, ?2)
             ON CONFLICT(chat_id) DO UPDATE SET entries = excluded.entries",
            params![chat_id, entries],
        )?;
        Ok(())
    }

    pub fn delete_cache_entries(&self, chat_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM response_cache WHERE chat_id = ?1",
            params![chat_id],
        )?;
        Ok(())
    }

    // ==================== Topics ====================

    pub fn load_topics(&self) -> DbResult<Vec<Topic>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at, messages
             FROM topics ORDER BY position ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut topics = Vec::new();
        for row in rows {
            let (id, title, created_at, updated_at, messages) = row?;
            topics.push(Topic {
                id,
                title,
                created_at: created_at.parse::<chrono::DateTime<chrono::Utc>>()?,
                updated_at: updated_at.parse::<chrono::DateTime<chrono::Utc>>()?,
                messages: serde_json::from_str(&messages)?,
            });
        }
        Ok(topics)
    }

    /// Replace the whole list, preserving its order.
    pub fn save_topics(&self, topics: &[Topic]) -> DbResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM topics", [])?;
        for (position, topic) in topics.iter().enumerate() {
            let messages = serde_json::to_string(&topic.messages)?;
            tx.execute(
                "INSERT INTO topics (id, title, created_at, updated_at, messages, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    topic.id,
                    topic.title,
                    topic.created_at.to_rfc3339(),
                    topic.updated_at.to_rfc3339(),
                    messages,
                    position as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

// ============================================================================
// Collaborator adapters
// ============================================================================

impl CacheBackend for Database {
    fn load_chat(&self, chat_id: &str) -> Result<Option<HashMap<String, CachedArtifact>>, String> {
        self.cache_entries(chat_id).map_err(|e| e.to_string())
    }

    fn store_chat(
        &self,
        chat_id: &str,
        entries: &HashMap<String, CachedArtifact>,
    ) -> Result<(), String> {
        self.put_cache_entries(chat_id, entries)
            .map_err(|e| e.to_string())
    }

    fn remove_chat(&self, chat_id: &str) -> Result<(), String> {
        self.delete_cache_entries(chat_id).map_err(|e| e.to_string())
    }
}

impl TopicStore for Database {
    fn load(&self) -> Result<Vec<Topic>, String> {
        self.load_topics().map_err(|e| e.to_string())
    }

    fn save(&self, topics: &[Topic]) -> Result<(), String> {
        self.save_topics(topics).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StepKind, TokenFrame};
    use crate::topic::Message;

    fn token(id: &str) -> CachedArtifact {
        CachedArtifact::TaskToken(TokenFrame {
            id: id.to_string(),
            chat_id: "c-1".to_string(),
            task_token: "opaque".to_string(),
            step_type: StepKind::Statement,
            ts: "2024-01-01T00:00:00+00:00".to_string(),
            chat_ts: "2024-01-01T00:00:00+00:00".to_string(),
            extra: None,
        })
    }

    #[test]
    fn cache_entries_round_trip() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.cache_entries("c-1").unwrap(), None);

        let mut entries = HashMap::new();
        entries.insert("st-1-token".to_string(), token("st-1"));
        db.put_cache_entries("c-1", &entries).unwrap();

        assert_eq!(db.cache_entries("c-1").unwrap(), Some(entries.clone()));

        // Overwrite-on-write-through.
        entries.insert("st-2-token".to_string(), token("st-2"));
        db.put_cache_entries("c-1", &entries).unwrap();
        assert_eq!(db.cache_entries("c-1").unwrap().unwrap().len(), 2);

        db.delete_cache_entries("c-1").unwrap();
        assert_eq!(db.cache_entries("c-1").unwrap(), None);
    }

    #[test]
    fn topics_round_trip_in_order() {
        let db = Database::open_in_memory().unwrap();

        let mut newest = Topic::new("c-2", "newest");
        newest.messages.push(Message::user("hello"));
        let topics = vec![newest, Topic::new("c-1", "older")];
        db.save_topics(&topics).unwrap();

        let loaded = db.load_topics().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "c-2");
        assert_eq!(loaded[0].messages.len(), 1);
        assert_eq!(loaded[1].id, "c-1");

        // Saving replaces the previous list.
        db.save_topics(&topics[1..]).unwrap();
        let loaded = db.load_topics().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "c-1");
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veritas.db");
        {
            let db = Database::open(&path).unwrap();
            let mut entries = HashMap::new();
            entries.insert("st-1-token".to_string(), token("st-1"));
            db.put_cache_entries("c-1", &entries).unwrap();
            db.save_topics(&[Topic::new("c-1", "persisted")]).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert!(db.cache_entries("c-1").unwrap().is_some());
        assert_eq!(db.load_topics().unwrap()[0].title, "persisted");
    }
}
