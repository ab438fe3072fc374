use crate::collector::{Collector, LocalCollector, Visit};
use crate::error::Result;
use crate::index::segment::{Segment, SegmentHandle};
use crate::index::types::{DocId, Score};
use crate::query::FacetRequest;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetCount {
    pub term: String,
    pub count: u64,
}

/// Term counts for one requested field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetResult {
    pub field: String,
    pub counts: Vec<FacetCount>,
}

/// Counts the string form of each requested field over matching documents.
pub struct FacetCollector {
    requests: Arc<[FacetRequest]>,
}

pub struct FacetLocal {
    requests: Arc<[FacetRequest]>,
    counts: Vec<FxHashMap<String, u64>>,
    segment: Option<SegmentHandle>,
}

impl FacetCollector {
    pub fn new(requests: Vec<FacetRequest>) -> Self {
        Self {
            requests: requests.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn finish(request: &FacetRequest, counts: FxHashMap<String, u64>) -> FacetResult {
        let mut counts: Vec<FacetCount> = counts
            .into_iter()
            .filter(|(_, count)| *count >= request.min_count)
            .map(|(term, count)| FacetCount { term, count })
            .collect();
        counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
        if let Some(limit) = request.limit {
            counts.truncate(limit);
        }
        FacetResult {
            field: request.field.clone(),
            counts,
        }
    }
}

impl Collector for FacetCollector {
    type Local = FacetLocal;
    type Partial = Vec<FxHashMap<String, u64>>;
    type Fruit = Vec<FacetResult>;

    fn local(&self) -> Result<FacetLocal> {
        Ok(FacetLocal {
            requests: Arc::clone(&self.requests),
            counts: vec![FxHashMap::default(); self.requests.len()],
            segment: None,
        })
    }

    fn merge(&self, partials: Vec<Self::Partial>) -> Result<Vec<FacetResult>> {
        let mut totals: Vec<FxHashMap<String, u64>> =
            vec![FxHashMap::default(); self.requests.len()];
        for partial in partials {
            for (total, counts) in totals.iter_mut().zip(partial) {
                for (term, count) in counts {
                    *total.entry(term).or_insert(0) += count;
                }
            }
        }
        Ok(self
            .requests
            .iter()
            .zip(totals)
            .map(|(request, counts)| FacetCollector::finish(request, counts))
            .collect())
    }
}

impl LocalCollector for FacetLocal {
    type Partial = Vec<FxHashMap<String, u64>>;

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        self.segment = Some(segment.clone());
        Ok(if self.requests.is_empty() {
            Visit::Skip
        } else {
            Visit::Docs
        })
    }

    fn collect(&mut self, doc: DocId, _score: Score) -> Result<()> {
        let Some(segment) = &self.segment else {
            return Ok(());
        };
        let reader: &dyn Segment = segment.reader();
        for (request, counts) in self.requests.iter().zip(self.counts.iter_mut()) {
            if let Some(value) = reader.value(&request.field, doc)? {
                *counts.entry(value.to_string()).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    fn complete(self) -> Result<Self::Partial> {
        Ok(self.counts)
    }
}
