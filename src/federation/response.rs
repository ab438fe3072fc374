use crate::collector::FacetResult;
use crate::index::types::Score;
use crate::join::bitset::KeyBitSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub id: String,
    pub score: Score,
}

/// Wall time of one plan phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    pub phase: &'static str,
    pub core: String,
    pub micros: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FederatedResponse {
    /// Matching result-core documents (distinct groups when collapsing)
    pub total_hits: u64,
    pub hits: Vec<Hit>,
    /// Facet counts per core
    pub facets: BTreeMap<String, Vec<FacetResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exported_keys: Option<KeyBitSet>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub timings: Vec<PhaseTiming>,
}

impl FederatedResponse {
    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.id.as_str()).collect()
    }
}

/// Collects phase timings when enabled.
pub(crate) struct Timings {
    enabled: bool,
    phases: Vec<PhaseTiming>,
}

impl Timings {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            phases: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, phase: &'static str, core: &str, started: Instant) {
        if self.enabled {
            self.phases.push(PhaseTiming {
                phase,
                core: core.to_string(),
                micros: started.elapsed().as_micros() as u64,
            });
        }
    }

    pub(crate) fn into_vec(self) -> Vec<PhaseTiming> {
        self.phases
    }
}
