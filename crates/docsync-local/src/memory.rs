use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docsync_core::{KvStore, StoreError};
use tracing::{instrument, trace};

#[derive(Debug, Clone)]
struct TtlEntry {
    value: String,
    expires_at: Instant,
}

impl TtlEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process `KvStore` with expiring entries.
///
/// Gives mutual exclusion between everything sharing the same instance, which
/// is one process. Use `FileKvStore` when several instances must agree.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, TtlEntry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Lookups already ignore them; this only frees memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, value), level = "trace")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let fresh = TtlEntry {
            value: value.to_string(),
            expires_at: now + ttl,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    trace!(key, "replacing expired entry");
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, e| e.value == value && !e.is_expired(now));
        Ok(removed.is_some())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|e| {
            if e.is_expired(now) {
                None
            } else {
                Some(e.expires_at - now)
            }
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.remaining_ttl(key).await?.is_some())
    }
}
