//! Context preservation across restarts
//!
//! The engine treats the context store as an external collaborator: a
//! TTL-bounded, last-write-wins key/value store holding opaque per-process
//! snapshots. [`InMemoryContextStore`] is the default implementation and the
//! one the tests use.

use crate::types::now_millis;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

/// Opaque per-process state snapshot
pub type ContextBlob = serde_json::Value;

/// TTL applied to periodic snapshots
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(60);

/// Extended TTL applied to a final capture on worker death
pub const FINAL_CONTEXT_TTL: Duration = Duration::from_secs(600);

/// TTL-bounded key/value store for context snapshots
#[async_trait]
pub trait ContextManager: Send + Sync {
    /// Fetch a non-expired snapshot
    async fn get_context(&self, key: &str) -> Option<ContextBlob>;

    /// Store a snapshot, replacing any previous value (last-write-wins)
    async fn store_context(&self, key: &str, value: ContextBlob, ttl: Duration);
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: ContextBlob,
    expires_at_ms: u64,
}

/// In-memory context store with lazy expiry
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    entries: DashMap<String, StoredEntry>,
}

impl InMemoryContextStore {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) {
        let now = now_millis();
        self.entries.retain(|_, entry| entry.expires_at_ms > now);
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ContextManager for InMemoryContextStore {
    async fn get_context(&self, key: &str) -> Option<ContextBlob> {
        let entry = self.entries.get(key)?;
        if entry.expires_at_ms <= now_millis() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    async fn store_context(&self, key: &str, value: ContextBlob, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                expires_at_ms: now_millis().saturating_add(ttl.as_millis() as u64),
            },
        );
    }
}
