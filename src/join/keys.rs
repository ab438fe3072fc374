use crate::collector::{Collector, LocalCollector, Visit};
use crate::error::Result;
use crate::index::segment::{SegmentHandle, SegmentIdentity};
use crate::index::types::{DocId, NO_KEY, Score};
use crate::join::bitset::KeyBitSet;
use crate::join::cache::{JoinKeyCache, KeyBitSetCache, KeyColumn, SegmentBitsets};
use crate::query::Query;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::trace;

/// Collects the set of join keys in `field` over matching documents.
///
/// With a cache attached, a segment whose bitset for this (query, field) is
/// already known is skipped and its cached bitset unioned in instead.
pub struct JoinKeyCollector {
    field: Arc<str>,
    keys: Arc<JoinKeyCache>,
    cache: Option<(Arc<KeyBitSetCache>, Arc<SegmentBitsets>)>,
}

pub struct JoinKeyLocal {
    field: Arc<str>,
    keys: Arc<JoinKeyCache>,
    cache: Option<(Arc<KeyBitSetCache>, Arc<SegmentBitsets>)>,
    acc: KeyBitSet,
    segment: KeyBitSet,
    column: Option<KeyColumn>,
    identity: Option<SegmentIdentity>,
}

impl JoinKeyCollector {
    pub fn new(field: &str, keys: Arc<JoinKeyCache>) -> Self {
        Self {
            field: Arc::from(field),
            keys,
            cache: None,
        }
    }

    /// Collector that reads and fills the cached bitsets of `(query, field)`
    pub fn cached(
        field: &str,
        keys: Arc<JoinKeyCache>,
        bitsets: &Arc<KeyBitSetCache>,
        query: &Query,
    ) -> Self {
        let segments = bitsets.segments_for(query, field);
        Self {
            field: Arc::from(field),
            keys,
            cache: Some((Arc::clone(bitsets), segments)),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl Collector for JoinKeyCollector {
    type Local = JoinKeyLocal;
    type Partial = KeyBitSet;
    type Fruit = KeyBitSet;

    fn local(&self) -> Result<JoinKeyLocal> {
        Ok(JoinKeyLocal {
            field: Arc::clone(&self.field),
            keys: Arc::clone(&self.keys),
            cache: self.cache.clone(),
            acc: KeyBitSet::new(),
            segment: KeyBitSet::new(),
            column: None,
            identity: None,
        })
    }

    fn merge(&self, partials: Vec<KeyBitSet>) -> Result<KeyBitSet> {
        let width = partials.iter().map(KeyBitSet::capacity).max().unwrap_or(0);
        let mut merged = KeyBitSet::with_capacity(width);
        for partial in &partials {
            merged.union_with(partial);
        }
        Ok(merged)
    }
}

impl LocalCollector for JoinKeyLocal {
    type Partial = KeyBitSet;

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        if let Some((cache, segments)) = &self.cache {
            if let Some(bits) = segments.get(segment.identity(), &()) {
                cache.stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!(field = %self.field, segment = segment.identity().id(), "key bitset cache hit");
                self.acc.union_with(&bits);
                return Ok(Visit::Skip);
            }
            cache.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.column = Some(self.keys.column(segment, &self.field)?);
        self.identity = Some(segment.identity().clone());
        self.segment = KeyBitSet::new();
        Ok(Visit::Docs)
    }

    fn collect(&mut self, doc: DocId, _score: Score) -> Result<()> {
        let key = self
            .column
            .as_ref()
            .and_then(|c| c.get(doc as usize).copied())
            .unwrap_or(NO_KEY);
        if key != NO_KEY {
            self.segment.insert(key)?;
        }
        Ok(())
    }

    fn complete_segment(&mut self) -> Result<()> {
        let bits = std::mem::take(&mut self.segment);
        match (&self.cache, self.identity.take()) {
            (Some((_, segments)), Some(identity)) => {
                // Another worker may have stored this segment first; use whichever was kept
                let kept = segments.insert_if_absent(&identity, (), Arc::new(bits));
                self.acc.union_with(&kept);
            }
            _ => self.acc.union_with(&bits),
        }
        self.column = None;
        Ok(())
    }

    fn complete(self) -> Result<KeyBitSet> {
        Ok(self.acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::run_serial;
    use crate::index::memory::MemoryCore;
    use crate::index::segment::Snapshot;
    use crate::index::types::{Document, JoinKey};

    fn core() -> MemoryCore {
        let core = MemoryCore::new("a");
        core.add_segment(vec![
            Document::new("a1").with_int("K", 1).with_str("t", "x"),
            Document::new("a2").with_int("K", 200).with_str("t", "x"),
        ]);
        core.add_segment(vec![
            Document::new("a3").with_int("K", 3).with_str("t", "x"),
            Document::new("a4").with_str("t", "x"),
        ]);
        core
    }

    fn keys(bits: &KeyBitSet) -> Vec<JoinKey> {
        bits.iter().collect()
    }

    #[test]
    fn test_collects_keys_skipping_absent() {
        let core = core();
        let snapshot = Snapshot::of(&core);
        let collector = JoinKeyCollector::new("K", Arc::new(JoinKeyCache::new()));
        let bits = run_serial(&snapshot, &Query::term("t", "x"), &collector);
        assert_eq!(keys(&bits), vec![1, 3, 200]);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let collector = JoinKeyCollector::new("K", Arc::new(JoinKeyCache::new()));
        let a = KeyBitSet::from_keys([1, 900]).unwrap();
        let b = KeyBitSet::from_keys([2]).unwrap();
        let c = KeyBitSet::from_keys([3, 64]).unwrap();
        let abc = collector.merge(vec![a.clone(), b.clone(), c.clone()]).unwrap();
        let cba = collector.merge(vec![c, b, a]).unwrap();
        assert_eq!(abc, cba);
        assert_eq!(keys(&abc), vec![1, 2, 3, 64, 900]);
    }

    #[test]
    fn test_cached_bitsets_reused_until_identity_changes() {
        let core = core();
        let key_cache = Arc::new(JoinKeyCache::new());
        let bitsets = Arc::new(KeyBitSetCache::new(8));
        let query = Query::term("t", "x");
        let run = |snapshot: &Snapshot| {
            let collector =
                JoinKeyCollector::cached("K", Arc::clone(&key_cache), &bitsets, &query);
            run_serial(snapshot, &query, &collector)
        };

        let snapshot = Snapshot::of(&core);
        let first = run(&snapshot);
        assert_eq!(bitsets.stats.misses.load(Ordering::Relaxed), 2);
        let second = run(&snapshot);
        assert_eq!(bitsets.stats.hits.load(Ordering::Relaxed), 2);
        assert_eq!(first, second);

        core.delete("a3");
        drop(snapshot);
        let snapshot = Snapshot::of(&core);
        let third = run(&snapshot);
        assert_eq!(bitsets.stats.hits.load(Ordering::Relaxed), 3);
        assert_eq!(bitsets.stats.misses.load(Ordering::Relaxed), 3);
        assert_eq!(keys(&third), vec![1, 200]);

        let uncached = JoinKeyCollector::new("K", Arc::clone(&key_cache));
        assert_eq!(third, run_serial(&snapshot, &query, &uncached));
    }
}
