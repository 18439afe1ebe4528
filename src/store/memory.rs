//! Volatile LRU layer of the document store.
//!
//! Recency is tracked with a monotonically increasing access tick per entry;
//! eviction removes the entry with the lowest tick until both the entry and
//! the byte budget are satisfied. Entry size is the length of the
//! document's serialized JSON, which is what the durable layer stores and
//! a fair proxy for the in-memory footprint.

use crate::document::Document;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Counters since the cache was created (or last cleared).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

struct Entry {
    document: Arc<Document>,
    bytes: usize,
    last_access: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    tick: u64,
    bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(e) => {
                self.bytes -= e.bytes;
                true
            }
            None => false,
        }
    }
}

/// Thread-safe LRU cache of documents keyed by `document_id`.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries,
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries stay consistent even if a holder panicked; keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up and promote.
    pub fn get(&self, id: &str) -> Option<Arc<Document>> {
        let mut inner = self.lock();
        let tick = inner.next_tick();
        let found = inner.entries.get_mut(id).map(|e| {
            e.last_access = tick;
            Arc::clone(&e.document)
        });
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Membership test without promotion or stats.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Insert or replace, then evict least-recently-used entries until the
    /// budgets hold. Returns the evicted ids. A document larger than the
    /// whole byte budget is not cached at all.
    pub fn insert(&self, document: Arc<Document>, bytes: usize) -> Vec<String> {
        let id = document.document_id.clone();
        let mut inner = self.lock();
        inner.remove(&id);
        if self.max_entries == 0 || bytes > self.max_bytes {
            debug!("Not caching document {} ({} bytes)", id, bytes);
            return Vec::new();
        }

        let tick = inner.next_tick();
        inner.entries.insert(
            id.clone(),
            Entry {
                document,
                bytes,
                last_access: tick,
            },
        );
        inner.bytes += bytes;

        let mut evicted = Vec::new();
        while inner.entries.len() > self.max_entries || inner.bytes > self.max_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, _)| **k != id)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            inner.remove(&victim);
            inner.evictions += 1;
            debug!("Evicted document {} from memory", victim);
            evicted.push(victim);
        }
        evicted
    }

    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id)
    }

    /// Drop every entry; counters are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            bytes: inner.bytes,
        }
    }
}
