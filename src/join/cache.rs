//! Per-segment caches for join keys.
//!
//! Entries are keyed by [`SegmentIdentity`] and hold only a weak reference to
//! it: once every reader of a segment generation is gone the entry can no
//! longer be found and is purged on a later insert.
//!
//! Correctness relies on an engine issuing a new identity whenever a
//! segment's visible document set changes. A segment whose deletes changed
//! under an unchanged identity would serve stale bitsets; nothing here
//! detects that.

use crate::error::Result;
use crate::index::segment::{IdentityToken, SegmentHandle, SegmentIdentity};
use crate::index::types::JoinKey;
use crate::join::bitset::KeyBitSet;
use crate::query::Query;
use ahash::AHashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Join key of every doc in one segment, indexed by local doc id
pub type KeyColumn = Arc<[JoinKey]>;

struct Entry<V> {
    owner: Weak<IdentityToken>,
    value: V,
}

impl<V> Entry<V> {
    fn is_live(&self) -> bool {
        self.owner.strong_count() > 0
    }
}

struct WeakInner<K, V> {
    entries: AHashMap<(u64, K), Entry<V>>,
    /// Size at which the next purge of dead entries runs
    purge_at: usize,
}

/// Map from (segment identity, key) to a value that lives only as long as the segment.
pub struct WeakSegmentMap<K, V> {
    inner: Mutex<WeakInner<K, V>>,
}

const MIN_PURGE_AT: usize = 64;

impl<K: Hash + Eq + Clone, V: Clone> WeakSegmentMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WeakInner {
                entries: AHashMap::new(),
                purge_at: MIN_PURGE_AT,
            }),
        }
    }

    pub fn get(&self, identity: &SegmentIdentity, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&(identity.id(), key.clone()))
            .filter(|e| e.is_live())
            .map(|e| e.value.clone())
    }

    /// Insert unless a live value is already present; returns the value kept.
    pub fn insert_if_absent(&self, identity: &SegmentIdentity, key: K, value: V) -> V {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= inner.purge_at {
            inner.entries.retain(|_, e| e.is_live());
            inner.purge_at = (inner.entries.len() * 2).max(MIN_PURGE_AT);
        }
        let entry = inner
            .entries
            .entry((identity.id(), key))
            .or_insert_with(|| Entry {
                owner: identity.downgrade(),
                value: value.clone(),
            });
        entry.value.clone()
    }

    /// Drop entries whose segment is gone
    pub fn purge(&self) {
        self.inner.lock().entries.retain(|_, e| e.is_live());
    }

    /// Number of entries whose segment is still alive
    pub fn live_len(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.is_live())
            .count()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Default for WeakSegmentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Memoizes each segment's full join-key column per field.
#[derive(Default)]
pub struct JoinKeyCache {
    columns: WeakSegmentMap<String, KeyColumn>,
}

impl JoinKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key column of `field` for `segment`, loaded on first use.
    pub fn column(&self, segment: &SegmentHandle, field: &str) -> Result<KeyColumn> {
        let key = field.to_string();
        if let Some(column) = self.columns.get(segment.identity(), &key) {
            return Ok(column);
        }
        trace!(segment = segment.identity().id(), field, "loading join key column");
        let column: KeyColumn = segment.reader().join_keys(field)?.into();
        Ok(self
            .columns
            .insert_if_absent(segment.identity(), key, column))
    }

    pub fn live_len(&self) -> usize {
        self.columns.live_len()
    }
}

/// Per-segment key bitsets already computed for one (query, field)
pub type SegmentBitsets = WeakSegmentMap<(), Arc<KeyBitSet>>;

/// Hit/miss counters of the key-bitset layer
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f32 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f32 / total as f32
        }
    }
}

/// Remembers per-segment key bitsets for the most recent (query, field) pairs.
pub struct KeyBitSetCache {
    queries: Mutex<LruCache<(Query, String), Arc<SegmentBitsets>>>,
    pub stats: CacheStats,
}

impl KeyBitSetCache {
    pub fn new(max_queries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_queries).unwrap_or(NonZeroUsize::MIN);
        Self {
            queries: Mutex::new(LruCache::new(capacity)),
            stats: CacheStats::default(),
        }
    }

    /// Segment map for `(query, field)`, created on first use.
    pub fn segments_for(&self, query: &Query, field: &str) -> Arc<SegmentBitsets> {
        let mut queries = self.queries.lock();
        Arc::clone(queries.get_or_insert((query.clone(), field.to_string()), || {
            Arc::new(SegmentBitsets::new())
        }))
    }

    pub fn len(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caches shared by every federated call of one engine.
pub struct JoinCaches {
    pub keys: Arc<JoinKeyCache>,
    pub bitsets: Arc<KeyBitSetCache>,
}

impl JoinCaches {
    pub fn new(max_queries: usize) -> Self {
        Self {
            keys: Arc::new(JoinKeyCache::new()),
            bitsets: Arc::new(KeyBitSetCache::new(max_queries)),
        }
    }
}
