//! Scatter-gather of one query over the segments of one core.
//!
//! Segments are spread over at most `concurrency` groups by a greedy
//! bin-packer. Group 0 runs on the calling thread; the others go to the
//! core's rayon pool. Each group drives its own local collector and the
//! partials are merged in group order once every group is done.

use crate::collector::{Collector, LocalCollector, Visit};
use crate::error::{Error, Result};
use crate::index::segment::{SegmentHandle, Snapshot};
use crate::query::Query;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Split items with the given document counts into at most `max_groups` groups.
///
/// Each item in turn goes to the group with the fewest documents so far
/// (lowest index on ties). Groups that received nothing are dropped.
pub fn partition(doc_counts: &[u64], max_groups: usize) -> Vec<Vec<usize>> {
    let max_groups = max_groups.max(1);
    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); max_groups];
    let mut loads = vec![0u64; max_groups];
    for (idx, &docs) in doc_counts.iter().enumerate() {
        let target = loads
            .iter()
            .enumerate()
            .min_by_key(|&(group, &load)| (load, group))
            .map_or(0, |(group, _)| group);
        groups[target].push(idx);
        loads[target] += docs;
    }
    groups.retain(|g| !g.is_empty());
    groups
}

/// [`partition`] over the live document counts of `segments`
pub fn partition_segments(segments: &[SegmentHandle], max_groups: usize) -> Vec<Vec<usize>> {
    let counts: Vec<u64> = segments.iter().map(|s| s.num_docs() as u64).collect();
    partition(&counts, max_groups)
}

/// Runs queries of one core with bounded parallelism.
pub struct SearchCoordinator {
    pool: ThreadPool,
    concurrency: usize,
}

impl SearchCoordinator {
    pub fn new(core: &str, concurrency: usize) -> Result<Self> {
        let concurrency = concurrency.max(1);
        let prefix = core.to_string();
        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(move |i| format!("{}-search-{}", prefix, i))
            .build()
            .map_err(|e| Error::Config(format!("search pool for core '{}': {}", core, e)))?;
        Ok(Self { pool, concurrency })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `query` over every segment of `snapshot` into `collector`.
    ///
    /// Returns only once every started group has finished. The first error
    /// stops groups that have not started yet and is returned as is.
    pub fn search<C: Collector>(
        &self,
        snapshot: &Snapshot,
        query: &Query,
        collector: &C,
    ) -> Result<C::Fruit> {
        let groups = partition_segments(snapshot.segments(), self.concurrency);
        debug!(
            core = snapshot.core(),
            segments = snapshot.segments().len(),
            groups = groups.len(),
            "search fan-out"
        );
        let Some((first, rest)) = groups.split_first() else {
            return collector.merge(Vec::new());
        };

        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let slots: Vec<Mutex<Option<C::Partial>>> = groups.iter().map(|_| Mutex::new(None)).collect();

        let run = |slot: usize, group: &[usize]| {
            if failed.load(Ordering::Acquire) {
                return;
            }
            match run_group(snapshot, query, collector, group) {
                Ok(partial) => *slots[slot].lock() = Some(partial),
                Err(err) => {
                    failed.store(true, Ordering::Release);
                    first_error.lock().get_or_insert(err);
                }
            }
        };

        self.pool.in_place_scope(|scope| {
            for (i, group) in rest.iter().enumerate() {
                let run = &run;
                scope.spawn(move |_| run(i + 1, group));
            }
            run(0, first);
        });

        if let Some(err) = first_error.into_inner() {
            return Err(err);
        }
        let partials = slots
            .into_iter()
            .map(|slot| {
                slot.into_inner()
                    .ok_or_else(|| Error::segment(snapshot.core(), "search group produced no result"))
            })
            .collect::<Result<Vec<_>>>()?;
        collector.merge(partials)
    }
}

fn run_group<C: Collector>(
    snapshot: &Snapshot,
    query: &Query,
    collector: &C,
    group: &[usize],
) -> Result<C::Partial> {
    let needs_scores = collector.needs_scores();
    let mut local = collector.local()?;
    for &ord in group {
        let segment = &snapshot.segments()[ord];
        if local.bind(segment)? == Visit::Skip {
            continue;
        }
        segment
            .reader()
            .search(query, needs_scores, &mut |doc, score| local.collect(doc, score))?;
        local.complete_segment()?;
    }
    local.complete()
}
