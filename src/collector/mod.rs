//! Composable per-segment work.
//!
//! A [`Collector`] is shared by every worker of one search. Each worker asks
//! it for a thread-local [`LocalCollector`], binds that to its segments one at
//! a time, feeds it matching documents and finally completes it into a
//! partial result. The collector then merges all partials, in group order,
//! into its fruit.
//!
//! ```text
//! local() -> bind(segment) -> collect(doc)* -> complete_segment() -> ... -> complete()
//!                                                         merge(partials) -> fruit
//! ```
//!
//! Documents within a segment may arrive in any order.

pub mod collapse;
pub mod facet;
pub mod sort;
pub mod top_docs;

pub use collapse::{BestPerKey, CollapseCollector, Collapsed, MAX_CAS_RETRIES};
pub use facet::{FacetCollector, FacetCount, FacetResult};
pub use sort::{
    FieldComparator, SegmentValues, SortClause, SortKey, SortedHit, TopFieldCollector,
};
pub use top_docs::{TopDocsCollector, TopKHeap};

use crate::error::Result;
use crate::index::segment::SegmentHandle;
use crate::index::types::{DocId, Score};

/// What a local collector wants from a freshly bound segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Feed matching documents
    Docs,
    /// The segment is already accounted for; do not search it
    Skip,
}

pub trait Collector: Sync {
    type Local: LocalCollector<Partial = Self::Partial>;
    type Partial: Send;
    type Fruit;

    /// Whether documents must arrive with computed relevance scores
    fn needs_scores(&self) -> bool {
        false
    }

    /// Create the sub-collector for one worker
    fn local(&self) -> Result<Self::Local>;

    /// Combine every worker's partial result, given in group order
    fn merge(&self, partials: Vec<Self::Partial>) -> Result<Self::Fruit>;
}

pub trait LocalCollector {
    type Partial;

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit>;

    /// `doc` is local to the bound segment
    fn collect(&mut self, doc: DocId, score: Score) -> Result<()>;

    fn complete_segment(&mut self) -> Result<()> {
        Ok(())
    }

    fn complete(self) -> Result<Self::Partial>;
}

/// Counts matching documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountCollector;

pub struct CountLocal {
    count: u64,
}

impl Collector for CountCollector {
    type Local = CountLocal;
    type Partial = u64;
    type Fruit = u64;

    fn local(&self) -> Result<CountLocal> {
        Ok(CountLocal { count: 0 })
    }

    fn merge(&self, partials: Vec<u64>) -> Result<u64> {
        Ok(partials.into_iter().sum())
    }
}

impl LocalCollector for CountLocal {
    type Partial = u64;

    fn bind(&mut self, _segment: &SegmentHandle) -> Result<Visit> {
        Ok(Visit::Docs)
    }

    fn collect(&mut self, _doc: DocId, _score: Score) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn complete(self) -> Result<u64> {
        Ok(self.count)
    }
}

/// Two collectors run over the same documents.
///
/// A segment is skipped only when both sides skip it; a side that skipped
/// receives no documents for that segment.
pub struct PairLocal<A, B> {
    a: A,
    b: B,
    a_on: bool,
    b_on: bool,
}

impl<A: Collector, B: Collector> Collector for (A, B) {
    type Local = PairLocal<A::Local, B::Local>;
    type Partial = (A::Partial, B::Partial);
    type Fruit = (A::Fruit, B::Fruit);

    fn needs_scores(&self) -> bool {
        self.0.needs_scores() || self.1.needs_scores()
    }

    fn local(&self) -> Result<Self::Local> {
        Ok(PairLocal {
            a: self.0.local()?,
            b: self.1.local()?,
            a_on: false,
            b_on: false,
        })
    }

    fn merge(&self, partials: Vec<Self::Partial>) -> Result<Self::Fruit> {
        let (pa, pb): (Vec<_>, Vec<_>) = partials.into_iter().unzip();
        Ok((self.0.merge(pa)?, self.1.merge(pb)?))
    }
}

impl<A: LocalCollector, B: LocalCollector> LocalCollector for PairLocal<A, B> {
    type Partial = (A::Partial, B::Partial);

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        self.a_on = self.a.bind(segment)? == Visit::Docs;
        self.b_on = self.b.bind(segment)? == Visit::Docs;
        Ok(if self.a_on || self.b_on {
            Visit::Docs
        } else {
            Visit::Skip
        })
    }

    fn collect(&mut self, doc: DocId, score: Score) -> Result<()> {
        if self.a_on {
            self.a.collect(doc, score)?;
        }
        if self.b_on {
            self.b.collect(doc, score)?;
        }
        Ok(())
    }

    fn complete_segment(&mut self) -> Result<()> {
        if self.a_on {
            self.a.complete_segment()?;
        }
        if self.b_on {
            self.b.complete_segment()?;
        }
        Ok(())
    }

    fn complete(self) -> Result<Self::Partial> {
        Ok((self.a.complete()?, self.b.complete()?))
    }
}

/// Any number of collectors of one type, run over the same documents.
pub struct MultiCollector<C> {
    inner: Vec<C>,
}

pub struct MultiLocal<L> {
    inner: Vec<L>,
    active: Vec<bool>,
}

impl<C: Collector> MultiCollector<C> {
    pub fn new(inner: Vec<C>) -> Self {
        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<C: Collector> Collector for MultiCollector<C> {
    type Local = MultiLocal<C::Local>;
    type Partial = Vec<C::Partial>;
    type Fruit = Vec<C::Fruit>;

    fn needs_scores(&self) -> bool {
        self.inner.iter().any(Collector::needs_scores)
    }

    fn local(&self) -> Result<Self::Local> {
        let inner = self
            .inner
            .iter()
            .map(Collector::local)
            .collect::<Result<Vec<_>>>()?;
        let active = vec![false; inner.len()];
        Ok(MultiLocal { inner, active })
    }

    fn merge(&self, partials: Vec<Self::Partial>) -> Result<Self::Fruit> {
        let mut per_collector: Vec<Vec<C::Partial>> =
            (0..self.inner.len()).map(|_| Vec::with_capacity(partials.len())).collect();
        for group in partials {
            for (slot, partial) in per_collector.iter_mut().zip(group) {
                slot.push(partial);
            }
        }
        self.inner
            .iter()
            .zip(per_collector)
            .map(|(collector, partials)| collector.merge(partials))
            .collect()
    }
}

impl<L: LocalCollector> LocalCollector for MultiLocal<L> {
    type Partial = Vec<L::Partial>;

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        let mut any = false;
        for (local, active) in self.inner.iter_mut().zip(self.active.iter_mut()) {
            *active = local.bind(segment)? == Visit::Docs;
            any |= *active;
        }
        Ok(if any { Visit::Docs } else { Visit::Skip })
    }

    fn collect(&mut self, doc: DocId, score: Score) -> Result<()> {
        for (local, &active) in self.inner.iter_mut().zip(&self.active) {
            if active {
                local.collect(doc, score)?;
            }
        }
        Ok(())
    }

    fn complete_segment(&mut self) -> Result<()> {
        for (local, &active) in self.inner.iter_mut().zip(&self.active) {
            if active {
                local.complete_segment()?;
            }
        }
        Ok(())
    }

    fn complete(self) -> Result<Self::Partial> {
        self.inner.into_iter().map(LocalCollector::complete).collect()
    }
}

/// Drive a collector over every segment on the current thread, one group per segment.
#[cfg(test)]
pub(crate) fn run_serial<C: Collector>(
    snapshot: &crate::index::segment::Snapshot,
    query: &crate::query::Query,
    collector: &C,
) -> C::Fruit {
    let mut partials = Vec::new();
    for segment in snapshot.segments() {
        let mut local = collector.local().unwrap();
        if local.bind(segment).unwrap() == Visit::Docs {
            segment
                .reader()
                .search(query, collector.needs_scores(), &mut |doc, score| {
                    local.collect(doc, score)
                })
                .unwrap();
            local.complete_segment().unwrap();
        }
        partials.push(local.complete().unwrap());
    }
    collector.merge(partials).unwrap()
}
