//! Top-k retrieval by relevance.
//!
//! Each worker keeps a bounded min-heap of its best hits; the per-worker
//! heaps are merged into one at completion. Ties on score are broken by the
//! lower absolute doc id so the merged page does not depend on how segments
//! were spread across threads.

use crate::collector::{Collector, LocalCollector, Visit};
use crate::error::Result;
use crate::index::segment::SegmentHandle;
use crate::index::types::{DocId, Score, ScoredDoc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap entry ordered so that the worst hit sits on top.
#[derive(Debug, Clone, Copy)]
struct Worst(ScoredDoc);

impl PartialEq for Worst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Worst {}

impl PartialOrd for Worst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Worst {
    fn cmp(&self, other: &Self) -> Ordering {
        // Greater = worse, so BinaryHeap (a max-heap) pops the worst hit first
        self.0.relevance_cmp(&other.0)
    }
}

/// Top-K heap for tracking the best hits.
pub struct TopKHeap {
    heap: BinaryHeap<Worst>,
    capacity: usize,
}

impl TopKHeap {
    pub fn new(k: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(k.min(1024) + 1),
            capacity: k,
        }
    }

    /// Minimum entry currently kept, once the heap is full
    #[inline]
    pub fn threshold(&self) -> Option<&ScoredDoc> {
        if self.is_full() {
            self.heap.peek().map(|w| &w.0)
        } else {
            None
        }
    }

    /// Try to insert a hit. Returns true if it was kept.
    pub fn try_insert(&mut self, hit: ScoredDoc) -> bool {
        if self.capacity == 0 {
            return false;
        }
        match self.threshold() {
            None => {
                self.heap.push(Worst(hit));
                true
            }
            Some(worst) if hit.relevance_cmp(worst) == Ordering::Less => {
                self.heap.pop();
                self.heap.push(Worst(hit));
                true
            }
            Some(_) => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    /// Consume the heap and return hits best first
    pub fn into_sorted_vec(self) -> Vec<ScoredDoc> {
        // Ascending by Worst = best first
        self.heap.into_sorted_vec().into_iter().map(|w| w.0).collect()
    }
}

/// Collects the `limit` best hits by relevance.
pub struct TopDocsCollector {
    limit: usize,
}

pub struct TopDocsLocal {
    heap: TopKHeap,
    base: DocId,
}

impl TopDocsCollector {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl Collector for TopDocsCollector {
    type Local = TopDocsLocal;
    type Partial = Vec<ScoredDoc>;
    type Fruit = Vec<ScoredDoc>;

    fn needs_scores(&self) -> bool {
        true
    }

    fn local(&self) -> Result<TopDocsLocal> {
        Ok(TopDocsLocal {
            heap: TopKHeap::new(self.limit),
            base: 0,
        })
    }

    fn merge(&self, partials: Vec<Vec<ScoredDoc>>) -> Result<Vec<ScoredDoc>> {
        let mut heap = TopKHeap::new(self.limit);
        for hit in partials.into_iter().flatten() {
            heap.try_insert(hit);
        }
        Ok(heap.into_sorted_vec())
    }
}

impl LocalCollector for TopDocsLocal {
    type Partial = Vec<ScoredDoc>;

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        self.base = segment.base;
        Ok(Visit::Docs)
    }

    fn collect(&mut self, doc: DocId, score: Score) -> Result<()> {
        self.heap.try_insert(ScoredDoc {
            doc: self.base + doc,
            score,
        });
        Ok(())
    }

    fn complete(self) -> Result<Vec<ScoredDoc>> {
        Ok(self.heap.into_sorted_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(doc: DocId, score: Score) -> ScoredDoc {
        ScoredDoc { doc, score }
    }

    #[test]
    fn test_top_k_heap_basic() {
        let mut heap = TopKHeap::new(3);
        assert!(heap.threshold().is_none());

        heap.try_insert(hit(1, 1.0));
        heap.try_insert(hit(2, 3.0));
        heap.try_insert(hit(3, 2.0));

        assert!(heap.is_full());
        assert_eq!(heap.threshold().unwrap().score, 1.0);

        // Worse than the current minimum
        assert!(!heap.try_insert(hit(4, 0.5)));
        assert_eq!(heap.len(), 3);

        // Better: evicts the lowest
        assert!(heap.try_insert(hit(5, 4.0)));
        assert_eq!(heap.threshold().unwrap().score, 2.0);

        let results = heap.into_sorted_vec();
        let scores: Vec<_> = results.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_ties_keep_lowest_doc() {
        let mut heap = TopKHeap::new(2);
        heap.try_insert(hit(9, 1.0));
        heap.try_insert(hit(4, 1.0));
        heap.try_insert(hit(2, 1.0));
        heap.try_insert(hit(7, 1.0));
        let docs: Vec<_> = heap.into_sorted_vec().iter().map(|h| h.doc).collect();
        assert_eq!(docs, vec![2, 4]);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut heap = TopKHeap::new(0);
        assert!(!heap.try_insert(hit(1, 1.0)));
        assert!(heap.is_empty());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let collector = TopDocsCollector::new(3);
        let a = vec![hit(1, 5.0), hit(2, 1.0)];
        let b = vec![hit(10, 3.0), hit(11, 1.0)];
        let ab = collector.merge(vec![a.clone(), b.clone()]).unwrap();
        let ba = collector.merge(vec![b, a]).unwrap();
        assert_eq!(ab, ba);
        let docs: Vec<_> = ab.iter().map(|h| h.doc).collect();
        assert_eq!(docs, vec![1, 10, 2]);
    }
}
