//! Session-scoped embedding memoization.
//!
//! Each key owns a slot guarded by its own mutex. The map lock is held only
//! long enough to find or create the slot, so extraction for one key never
//! blocks lookups of another, while a second caller for the same key waits
//! on the slot until the first computation lands.
//!
//! Lock order is slot then map. Code holding the map lock only ever
//! `try_lock`s a slot.

use crate::frame::FrameKey;
use crate::types::Embedding;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Slot = Mutex<Option<Embedding>>;

/// Hit/miss counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Memoizes extracted embeddings by frame identity.
pub struct EmbeddingCache<K = FrameKey> {
    entries: Mutex<LruCache<K, Arc<Slot>>>,
    capacity: Option<NonZeroUsize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Hash + Eq + Clone> EmbeddingCache<K> {
    /// Cache that keeps every entry for its lifetime.
    pub fn unbounded() -> Self {
        Self::with_limit(None)
    }

    /// Cache that evicts the least-recently-used computed entry past
    /// `capacity`. Entries still being computed are never evicted, so the
    /// cache may briefly hold more than `capacity` slots.
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self::with_limit(Some(capacity))
    }

    /// `None` or `Some(0)` means unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        Self::with_limit(capacity.and_then(NonZeroUsize::new))
    }

    fn with_limit(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the embedding stored under `key`, computing it on first use.
    ///
    /// `compute` runs at most once per key while the entry is resident, even
    /// with concurrent callers; an evicted key is computed again on its next
    /// use. A failed computation stores nothing and its error is returned to
    /// the caller that ran it. Callers that were waiting on it retry.
    pub fn get_or_compute<E, F>(&self, key: K, compute: F) -> Result<Embedding, E>
    where
        F: FnOnce() -> Result<Embedding, E>,
    {
        loop {
            let slot = self.slot_for(&key);
            let mut value = slot.lock();
            if let Some(embedding) = value.as_ref() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(embedding.clone());
            }
            // The slot was dropped by a failed computation while we waited.
            if !self.is_resident(&key, &slot) {
                continue;
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            return match compute() {
                Ok(embedding) => {
                    *value = Some(embedding.clone());
                    Ok(embedding)
                }
                Err(err) => {
                    self.entries.lock().pop(&key);
                    Err(err)
                }
            };
        }
    }

    /// Find the resident slot for `key` or insert an empty one.
    fn slot_for(&self, key: &K) -> Arc<Slot> {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get(key) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Mutex::new(None));
        entries.put(key.clone(), Arc::clone(&slot));
        if let Some(capacity) = self.capacity {
            evict_computed(&mut entries, capacity.get());
        }
        slot
    }

    fn is_resident(&self, key: &K, slot: &Arc<Slot>) -> bool {
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|resident| Arc::ptr_eq(resident, slot))
    }

    /// Whether a computed embedding is stored under `key`.
    pub fn contains(&self, key: &K) -> bool {
        let entries = self.entries.lock();
        entries
            .peek(key)
            .and_then(|slot| slot.try_lock().map(|v| v.is_some()))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

/// Drop least-recently-used computed entries until at most `capacity`
/// remain. Busy or unfilled slots are skipped.
fn evict_computed<K: Hash + Eq + Clone>(entries: &mut LruCache<K, Arc<Slot>>, capacity: usize) {
    while entries.len() > capacity {
        let victim = entries
            .iter()
            .rev()
            .find(|(_, slot)| slot.try_lock().is_some_and(|v| v.is_some()))
            .map(|(key, _)| key.clone());
        match victim {
            Some(key) => {
                entries.pop(&key);
            }
            None => break,
        }
    }
}

impl<K: Hash + Eq + Clone> Default for EmbeddingCache<K> {
    fn default() -> Self {
        Self::unbounded()
    }
}
