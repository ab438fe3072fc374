//! Keep only the best hit per join key.
//!
//! Workers share one map from key to a packed `(score, doc)` record and race
//! to raise it with compare-and-swap. Documents without a key are never
//! collapsed and go through a per-worker top-k heap instead.

use crate::collector::top_docs::TopKHeap;
use crate::collector::{Collector, LocalCollector, Visit};
use crate::error::{Error, Result};
use crate::index::segment::SegmentHandle;
use crate::index::types::{DocId, JoinKey, NO_KEY, Score, ScoredDoc};
use crate::join::cache::{JoinKeyCache, KeyColumn};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bound on compare-and-swap attempts for one update. Reaching it
/// means the record is not monotone, not that contention is high.
pub const MAX_CAS_RETRIES: usize = 10_000;

/// Order-preserving map of an `f32` onto `u32`
fn score_bits(score: Score) -> u32 {
    let bits = score.to_bits();
    if bits >> 31 == 1 { !bits } else { bits | 1 << 31 }
}

fn bits_score(bits: u32) -> Score {
    if bits >> 31 == 1 {
        f32::from_bits(bits & !(1 << 31))
    } else {
        f32::from_bits(!bits)
    }
}

/// Packed so that a greater record is a better hit: higher score, then lower doc.
pub fn pack(hit: ScoredDoc) -> u64 {
    (score_bits(hit.score) as u64) << 32 | (u32::MAX - hit.doc) as u64
}

pub fn unpack(packed: u64) -> ScoredDoc {
    ScoredDoc {
        doc: u32::MAX - packed as u32,
        score: bits_score((packed >> 32) as u32),
    }
}

/// Raise `slot` to `packed` unless it already holds at least that, giving
/// up after `budget` failed exchanges.
fn raise(
    slot: &AtomicU64,
    packed: u64,
    budget: usize,
    mut exchange: impl FnMut(u64, u64) -> std::result::Result<u64, u64>,
) -> Result<()> {
    let mut current = slot.load(Ordering::Acquire);
    for _ in 0..budget {
        if current >= packed {
            return Ok(());
        }
        match exchange(current, packed) {
            Ok(_) => return Ok(()),
            Err(actual) => current = actual,
        }
    }
    if current >= packed {
        Ok(())
    } else {
        Err(Error::RetryBudgetExceeded(budget))
    }
}

/// Best record per key, shared by every worker of one search.
pub struct BestPerKey {
    best: DashMap<JoinKey, AtomicU64>,
    budget: usize,
}

impl Default for BestPerKey {
    fn default() -> Self {
        Self::with_budget(MAX_CAS_RETRIES)
    }
}

impl BestPerKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow at most `budget` compare-and-swap attempts per update
    pub fn with_budget(budget: usize) -> Self {
        Self {
            best: DashMap::new(),
            budget,
        }
    }

    /// Raise the record of `key` to `hit` if it is better.
    pub fn offer(&self, key: JoinKey, hit: ScoredDoc) -> Result<()> {
        let packed = pack(hit);
        let slot = match self.best.get(&key) {
            Some(slot) => slot,
            None => self
                .best
                .entry(key)
                .or_insert_with(|| AtomicU64::new(0))
                .downgrade(),
        };
        raise(&slot, packed, self.budget, |current, new| {
            slot.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
        })
    }

    pub fn len(&self) -> usize {
        self.best.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }

    pub fn hits(&self) -> impl Iterator<Item = ScoredDoc> + '_ {
        self.best
            .iter()
            .map(|entry| unpack(entry.value().load(Ordering::Acquire)))
    }
}

/// Collapsed page and the number of distinct results before paging
#[derive(Debug, Clone, PartialEq)]
pub struct Collapsed {
    pub hits: Vec<ScoredDoc>,
    pub groups: u64,
}

/// Top hits by relevance, at most one per non-zero key in `field`.
pub struct CollapseCollector {
    field: Arc<str>,
    limit: usize,
    keys: Arc<JoinKeyCache>,
    best: Arc<BestPerKey>,
}

pub struct CollapseLocal {
    field: Arc<str>,
    keys: Arc<JoinKeyCache>,
    best: Arc<BestPerKey>,
    column: Option<KeyColumn>,
    base: DocId,
    unkeyed: TopKHeap,
    unkeyed_count: u64,
}

impl CollapseCollector {
    pub fn new(field: &str, limit: usize, keys: Arc<JoinKeyCache>) -> Self {
        Self {
            field: Arc::from(field),
            limit,
            keys,
            best: Arc::new(BestPerKey::new()),
        }
    }

    /// Bound the compare-and-swap attempts of each per-key update
    pub fn with_retry_budget(mut self, budget: usize) -> Self {
        self.best = Arc::new(BestPerKey::with_budget(budget));
        self
    }
}

impl Collector for CollapseCollector {
    type Local = CollapseLocal;
    type Partial = (Vec<ScoredDoc>, u64);
    type Fruit = Collapsed;

    fn needs_scores(&self) -> bool {
        true
    }

    fn local(&self) -> Result<CollapseLocal> {
        Ok(CollapseLocal {
            field: Arc::clone(&self.field),
            keys: Arc::clone(&self.keys),
            best: Arc::clone(&self.best),
            column: None,
            base: 0,
            unkeyed: TopKHeap::new(self.limit),
            unkeyed_count: 0,
        })
    }

    fn merge(&self, partials: Vec<Self::Partial>) -> Result<Collapsed> {
        let mut heap = TopKHeap::new(self.limit);
        let mut groups = self.best.len() as u64;
        for (hits, count) in partials {
            groups += count;
            for hit in hits {
                heap.try_insert(hit);
            }
        }
        for hit in self.best.hits() {
            heap.try_insert(hit);
        }
        Ok(Collapsed {
            hits: heap.into_sorted_vec(),
            groups,
        })
    }
}

impl LocalCollector for CollapseLocal {
    type Partial = (Vec<ScoredDoc>, u64);

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        self.base = segment.base;
        self.column = Some(self.keys.column(segment, &self.field)?);
        Ok(Visit::Docs)
    }

    fn collect(&mut self, doc: DocId, score: Score) -> Result<()> {
        let key = self
            .column
            .as_ref()
            .and_then(|c| c.get(doc as usize).copied())
            .unwrap_or(NO_KEY);
        let hit = ScoredDoc {
            doc: self.base + doc,
            score,
        };
        if key == NO_KEY {
            self.unkeyed_count += 1;
            self.unkeyed.try_insert(hit);
            Ok(())
        } else {
            self.best.offer(key, hit)
        }
    }

    fn complete(self) -> Result<Self::Partial> {
        Ok((self.unkeyed.into_sorted_vec(), self.unkeyed_count))
    }
}
