//! Memory store contract consumed by the agent loop.
//!
//! The core only depends on this interface; the embedding-backed store
//! lives outside the crate. [`InMemoryStore`] is a minimal implementation
//! used by the terminal runtime and the test-suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single remembered item. Opaque to the core beyond these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    /// Free-form type tag (e.g. "fact", "preference", "conversation").
    pub kind: String,
    pub content: String,
    /// Importance weight; units are store-defined and passed through.
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub source: Option<String>,
}

/// Filters for a recall query.
#[derive(Debug, Clone, Default)]
pub struct RecallQuery {
    pub user_id: String,
    pub limit: usize,
    pub min_importance: Option<f32>,
    /// Restrict to these type tags; empty means all.
    pub kinds: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Memory store errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The backing store rejected or failed the operation.
    #[error("memory store error: {0}")]
    Backend(String),
}

/// Contract the core consumes. No semantics beyond these operations are
/// assumed.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist one memory.
    async fn store(&self, memory: Memory) -> Result<(), MemoryError>;

    /// Recall memories relevant to `query`, filtered and bounded.
    async fn recall(&self, query: &str, opts: RecallQuery) -> Result<Vec<Memory>, MemoryError>;

    /// Most recent memories for a user.
    async fn get_recent(&self, user_id: &str, limit: usize) -> Result<Vec<Memory>, MemoryError>;

    /// Release backing resources.
    async fn close(&self) -> Result<(), MemoryError>;
}

/// Keyword-matching in-process store.
///
/// Recall is case-insensitive substring matching over `content`, newest
/// first. Good enough for the terminal runtime and tests; not a search
/// engine.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    items: std::sync::RwLock<Vec<Memory>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored memories.
    pub fn len(&self) -> usize {
        self.items.read().map(|i| i.len()).unwrap_or(0)
    }

    /// Whether the store holds no memories.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn store(&self, memory: Memory) -> Result<(), MemoryError> {
        let mut items = self
            .items
            .write()
            .map_err(|_| MemoryError::Backend("lock poisoned".to_owned()))?;
        items.push(memory);
        Ok(())
    }

    async fn recall(&self, query: &str, opts: RecallQuery) -> Result<Vec<Memory>, MemoryError> {
        let items = self
            .items
            .read()
            .map_err(|_| MemoryError::Backend("lock poisoned".to_owned()))?;

        let needle = query.to_lowercase();
        let mut hits: Vec<Memory> = items
            .iter()
            .filter(|m| m.user_id == opts.user_id)
            .filter(|m| needle.is_empty() || m.content.to_lowercase().contains(&needle))
            .filter(|m| opts.min_importance.is_none_or(|min| m.importance >= min))
            .filter(|m| opts.kinds.is_empty() || opts.kinds.iter().any(|k| *k == m.kind))
            .filter(|m| opts.since.is_none_or(|s| m.created_at >= s))
            .filter(|m| opts.until.is_none_or(|u| m.created_at <= u))
            .cloned()
            .collect();

        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        hits.truncate(opts.limit.max(1));
        Ok(hits)
    }

    async fn get_recent(&self, user_id: &str, limit: usize) -> Result<Vec<Memory>, MemoryError> {
        let items = self
            .items
            .read()
            .map_err(|_| MemoryError::Backend("lock poisoned".to_owned()))?;
        let mut recent: Vec<Memory> = items
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit.max(1));
        Ok(recent)
    }

    async fn close(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(user: &str, content: &str, importance: f32) -> Memory {
        Memory {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.to_owned(),
            kind: "fact".to_owned(),
            content: content.to_owned(),
            importance,
            created_at: Utc::now(),
            accessed_at: Utc::now(),
            source: None,
        }
    }

    #[tokio::test]
    async fn store_and_recall_by_keyword() {
        let store = InMemoryStore::new();
        store
            .store(memory("u1", "prefers dark roast coffee", 0.8))
            .await
            .expect("store");
        store
            .store(memory("u1", "works on a rust codebase", 0.5))
            .await
            .expect("store");

        let hits = store
            .recall(
                "coffee",
                RecallQuery {
                    user_id: "u1".to_owned(),
                    limit: 5,
                    ..Default::default()
                },
            )
            .await
            .expect("recall");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("coffee"));
    }

    #[tokio::test]
    async fn recall_is_scoped_to_user() {
        let store = InMemoryStore::new();
        store
            .store(memory("u1", "likes tea", 0.5))
            .await
            .expect("store");
        store
            .store(memory("u2", "likes tea", 0.5))
            .await
            .expect("store");

        let hits = store
            .recall(
                "tea",
                RecallQuery {
                    user_id: "u1".to_owned(),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .expect("recall");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, "u1");
    }

    #[tokio::test]
    async fn min_importance_filters() {
        let store = InMemoryStore::new();
        store
            .store(memory("u1", "trivial note", 0.1))
            .await
            .expect("store");
        store
            .store(memory("u1", "important note", 0.9))
            .await
            .expect("store");

        let hits = store
            .recall(
                "note",
                RecallQuery {
                    user_id: "u1".to_owned(),
                    limit: 10,
                    min_importance: Some(0.5),
                    ..Default::default()
                },
            )
            .await
            .expect("recall");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("important"));
    }

    #[tokio::test]
    async fn get_recent_returns_newest_first() {
        let store = InMemoryStore::new();
        let mut older = memory("u1", "old", 0.5);
        older.created_at = Utc::now()
            .checked_sub_signed(chrono::TimeDelta::seconds(60))
            .expect("test timestamp");
        store.store(older).await.expect("store");
        store.store(memory("u1", "new", 0.5)).await.expect("store");

        let recent = store.get_recent("u1", 2).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "new");
    }
}
