//! Multi-phase execution of a [`ComposedQuery`].
//!
//! Phases run one after the other, one core at a time; each phase fans out
//! over the segments of its core through that core's [`SearchCoordinator`].
//!
//! ```text
//! relational filter -> unites -> other-core filters -> join sorts -> rank scores
//!     -> main search on the result core -> other-core facets -> export
//! ```
//!
//! Every participating core is snapshotted once up front, so all phases of a
//! call see the same generation of each core.

use crate::collector::{
    CollapseCollector, Collapsed, Collector, CountCollector, FacetCollector, FacetResult,
    MultiCollector, SortClause, SortedHit, TopDocsCollector, TopFieldCollector,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::federation::response::{FederatedResponse, Hit, Timings};
use crate::index::segment::{IndexCore, Snapshot};
use crate::index::types::ScoredDoc;
use crate::join::algebra::KeySource;
use crate::join::bitset::{KeyBitSet, KeySet};
use crate::join::cache::JoinCaches;
use crate::join::keys::JoinKeyCollector;
use crate::join::score::{AggregateScoreCollector, DEFAULT_RATIO, RankScores, ScoreCollector, effective_ratio};
use crate::join::sort::{JoinSortCollector, joined_clause};
use crate::query::{ComposedQuery, Query};
use crate::search::SearchCoordinator;
use ahash::AHashMap;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span};

struct RegisteredCore {
    index: Arc<dyn IndexCore>,
    coordinator: SearchCoordinator,
}

/// Segment and document counts of one registered core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreStats {
    pub name: String,
    pub segments: usize,
    pub docs: u64,
}

/// Runs federated queries over a set of registered cores.
///
/// Owns one search pool per core and the join caches shared by every call.
pub struct FederationEngine {
    config: EngineConfig,
    cores: AHashMap<String, RegisteredCore>,
    caches: JoinCaches,
}

impl FederationEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let caches = JoinCaches::new(config.key_cache_queries);
        Ok(Self {
            config,
            cores: AHashMap::new(),
            caches,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn caches(&self) -> &JoinCaches {
        &self.caches
    }

    /// Register a core under its own name, replacing any core of that name.
    pub fn register(&mut self, core: Arc<dyn IndexCore>) -> Result<()> {
        let name = core.name().to_string();
        let coordinator = SearchCoordinator::new(&name, self.config.concurrency)?;
        info!(core = %name, threads = coordinator.concurrency(), "registered core");
        self.cores.insert(
            name,
            RegisteredCore {
                index: core,
                coordinator,
            },
        );
        Ok(())
    }

    pub fn stats(&self) -> Vec<CoreStats> {
        let mut stats: Vec<CoreStats> = self
            .cores
            .iter()
            .map(|(name, core)| {
                let snapshot = Snapshot::of(core.index.as_ref());
                CoreStats {
                    name: name.clone(),
                    segments: snapshot.segments().len(),
                    docs: snapshot.num_docs(),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn execute(&self, query: &ComposedQuery) -> Result<FederatedResponse> {
        let span = info_span!("federated", results_from = %query.results_from);
        let _guard = span.enter();
        let started = Instant::now();

        query.validate()?;
        let names = query.referenced_cores();
        let mut snapshots = BTreeMap::new();
        for &name in &names {
            let core = self
                .cores
                .get(name)
                .ok_or_else(|| Error::UnknownCore(name.to_string()))?;
            snapshots.insert(name, Arc::new(Snapshot::of(core.index.as_ref())));
        }

        let single = names.len() == 1
            && query.unites.is_empty()
            && query.relational_filter.is_none()
            && query.export_key.is_none();
        let call = Call {
            engine: self,
            query,
            snapshots,
        };
        if single {
            debug!("single-core fast path");
        }
        let response = call.run(!single)?;

        info!(
            total_hits = response.total_hits,
            hits = response.hits.len(),
            micros = started.elapsed().as_micros() as u64,
            "federated query done"
        );
        Ok(response)
    }
}

/// Key sets accumulated per result-core field; sets on one field intersect.
#[derive(Debug, Default)]
struct Relations {
    sets: BTreeMap<String, KeySet>,
}

impl Relations {
    fn add(&mut self, field: &str, keys: KeySet) {
        match self.sets.entry(field.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = std::mem::take(entry.get_mut());
                *entry.get_mut() = current.meet(&keys);
            }
            Entry::Vacant(entry) => {
                entry.insert(keys);
            }
        }
    }

    /// `query` restricted to docs whose keys fall in every accumulated set
    fn apply(self, query: Query) -> Query {
        self.sets
            .into_iter()
            .fold(query, |q, (field, keys)| q.with_filter(Query::join_keys(field, keys)))
    }
}

/// Turns a page collector's fruit into hits and an optional group count
trait IntoPage {
    fn into_page(self) -> (Vec<ScoredDoc>, Option<u64>);
}

impl IntoPage for Vec<ScoredDoc> {
    fn into_page(self) -> (Vec<ScoredDoc>, Option<u64>) {
        (self, None)
    }
}

impl IntoPage for Vec<SortedHit> {
    fn into_page(self) -> (Vec<ScoredDoc>, Option<u64>) {
        let hits = self
            .into_iter()
            .map(|h| ScoredDoc {
                doc: h.doc,
                score: h.score,
            })
            .collect();
        (hits, None)
    }
}

impl IntoPage for Collapsed {
    fn into_page(self) -> (Vec<ScoredDoc>, Option<u64>) {
        (self.hits, Some(self.groups))
    }
}

struct MainFruit {
    hits: Vec<ScoredDoc>,
    total: u64,
    facets: Vec<FacetResult>,
    keys: Vec<KeyBitSet>,
}

/// State of one federated call
struct Call<'a> {
    engine: &'a FederationEngine,
    query: &'a ComposedQuery,
    snapshots: BTreeMap<&'a str, Arc<Snapshot>>,
}

impl<'a> Call<'a> {
    fn snapshot(&self, core: &str) -> Result<&Arc<Snapshot>> {
        self.snapshots
            .get(core)
            .ok_or_else(|| Error::UnknownCore(core.to_string()))
    }

    fn search<C: Collector>(&self, core: &str, query: &Query, collector: &C) -> Result<C::Fruit> {
        let registered = self
            .engine
            .cores
            .get(core)
            .ok_or_else(|| Error::UnknownCore(core.to_string()))?;
        registered
            .coordinator
            .search(self.snapshot(core)?, query, collector)
    }

    fn results_from(&self) -> &'a str {
        self.query.results_from.as_str()
    }

    /// Result-core field and keys of one side of a unite
    fn unite_side(
        &self,
        core: &str,
        query: &Query,
        partner: &str,
    ) -> Result<(&'a str, KeyBitSet)> {
        let r = self.results_from();
        let (result_field, own_field) = if core == r {
            let field = self.query.key_field(r, partner)?;
            (field, field)
        } else {
            (self.query.key_field(r, core)?, self.query.key_field(core, r)?)
        };
        Ok((result_field, self.collect_keys(core, query, own_field)?))
    }

    fn run(&self, federated: bool) -> Result<FederatedResponse> {
        let query = self.query;
        let r = self.results_from();
        let keys = &self.engine.caches.keys;
        let mut timings = Timings::new(self.engine.config.record_timings);
        let mut relations = Relations::default();
        let mut united: BTreeSet<&str> = BTreeSet::new();

        if federated {
            if let Some(filter) = &query.relational_filter {
                let t = Instant::now();
                let set = filter.expr.execute(self, None)?;
                debug!(
                    field = %filter.field,
                    inverted = set.inverted,
                    keys = set.bits.cardinality(),
                    "relational filter resolved"
                );
                relations.add(&filter.field, set);
                timings.record("relational_filter", r, t);
            }

            for unite in &query.unites {
                let t = Instant::now();
                let (field_a, mut bits) = self.unite_side(&unite.core_a, &unite.query_a, &unite.core_b)?;
                let (field_b, bits_b) = self.unite_side(&unite.core_b, &unite.query_b, &unite.core_a)?;
                if field_a != field_b {
                    return Err(Error::InvalidQuery(format!(
                        "unite of '{}' and '{}' reaches '{}' through different fields",
                        unite.core_a, unite.core_b, r
                    )));
                }
                bits.union_with(&bits_b);
                relations.add(field_a, KeySet::new(bits));
                united.insert(unite.core_a.as_str());
                united.insert(unite.core_b.as_str());
                timings.record("unite", r, t);
            }

            for (name, core) in query.other_cores() {
                let t = Instant::now();
                let result_field = query.key_field(r, name)?;
                let own_field = query.key_field(name, r)?;
                for filter in &core.filter_queries {
                    let bits = self.collect_keys(name, filter, own_field)?;
                    relations.add(result_field, KeySet::new(bits));
                }
                for exclude in &core.exclude_filter_queries {
                    let bits = self.collect_keys(name, exclude, own_field)?;
                    relations.add(result_field, KeySet::inverted(bits));
                }
                // Only an explicit primary query restricts; facet-only cores do not
                let primary = core.query.as_ref().filter(|_| !united.contains(name.as_str()));
                if let Some(primary) = primary {
                    let bits = self.collect_keys(name, primary, own_field)?;
                    relations.add(result_field, KeySet::new(bits));
                }
                timings.record("core_filter", name, t);
            }
        }

        let main_query = relations.apply(query.core(r).full_query());

        // Keys of the main hits, needed for other-core facets and export
        let mut key_fields: Vec<&str> = Vec::new();
        if federated {
            for (name, core) in query.other_cores() {
                if !core.facets.is_empty() {
                    key_fields.push(query.key_field(r, name)?);
                }
            }
            if let Some(field) = &query.export_key {
                key_fields.push(field.as_str());
            }
            key_fields.sort_unstable();
            key_fields.dedup();
        }

        let mut clauses = Vec::with_capacity(query.sort.len());
        for field in &query.sort {
            match field.core.as_deref() {
                Some(other) if other != r => {
                    let t = Instant::now();
                    let own_field = query.key_field(other, r)?;
                    let table = self.search(
                        other,
                        &query.core(other).full_query(),
                        &JoinSortCollector::new(own_field, Arc::clone(keys)),
                    )?;
                    clauses.push(joined_clause(
                        field,
                        query.key_field(r, other)?,
                        Arc::clone(keys),
                        Arc::new(table),
                        Arc::clone(self.snapshot(other)?),
                    )?);
                    timings.record("join_sort", other, t);
                }
                _ => clauses.push(SortClause::local(field)?),
            }
        }

        let mut ranks = Vec::with_capacity(query.rank_queries.len());
        for (core, rank_query) in &query.rank_queries {
            let t = Instant::now();
            let own_field = query.key_field(core, r)?;
            let table = self.search(
                core,
                rank_query,
                &ScoreCollector::new(own_field, Arc::clone(keys)),
            )?;
            ranks.push(RankScores {
                field: query.key_field(r, core)?.to_string(),
                table,
            });
            timings.record("rank", core, t);
        }
        let ratio = if ranks.is_empty() {
            DEFAULT_RATIO
        } else {
            effective_ratio(query.rank_ratio)
        };

        let t = Instant::now();
        let limit = query.stop;
        let main = if let Some(field) = &query.collapse {
            let page = CollapseCollector::new(field, limit, Arc::clone(keys))
                .with_retry_budget(self.engine.config.cas_retry_budget);
            self.main_search(&main_query, page, ranks, ratio, &key_fields)?
        } else if clauses.is_empty() {
            self.main_search(&main_query, TopDocsCollector::new(limit), ranks, ratio, &key_fields)?
        } else {
            let page = TopFieldCollector::new(clauses, limit);
            self.main_search(&main_query, page, ranks, ratio, &key_fields)?
        };
        timings.record("main", r, t);

        let mut facets = BTreeMap::new();
        if !query.core(r).facets.is_empty() {
            facets.insert(r.to_string(), main.facets);
        }
        if federated {
            for (name, core) in query.other_cores() {
                if core.facets.is_empty() {
                    continue;
                }
                let t = Instant::now();
                let result_field = query.key_field(r, name)?;
                let bits = key_fields
                    .iter()
                    .position(|f| *f == result_field)
                    .and_then(|i| main.keys.get(i))
                    .cloned()
                    .unwrap_or_default();
                let facet_query = core
                    .full_query()
                    .with_filter(Query::join_keys(query.key_field(name, r)?, KeySet::new(bits)));
                let results = self.search(
                    name,
                    &facet_query,
                    &FacetCollector::new(core.facets.clone()),
                )?;
                facets.insert(name.clone(), results);
                timings.record("facet", name, t);
            }
        }

        let exported_keys = query.export_key.as_deref().and_then(|field| {
            key_fields
                .iter()
                .position(|f| *f == field)
                .and_then(|i| main.keys.get(i))
                .cloned()
        });

        let snapshot = self.snapshot(r)?;
        let hits = main
            .hits
            .into_iter()
            .skip(query.start)
            .map(|hit| {
                Ok(Hit {
                    id: snapshot.stored(hit.doc)?.id,
                    score: hit.score,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(FederatedResponse {
            total_hits: main.total,
            hits,
            facets,
            exported_keys,
            timings: timings.into_vec(),
        })
    }

    fn main_search<P>(
        &self,
        query: &Query,
        page: P,
        ranks: Vec<RankScores>,
        ratio: f32,
        key_fields: &[&str],
    ) -> Result<MainFruit>
    where
        P: Collector,
        P::Fruit: IntoPage,
    {
        let r = self.results_from();
        let keys = &self.engine.caches.keys;
        let page = AggregateScoreCollector::new(page, ranks, ratio, Arc::clone(keys));
        let facets = FacetCollector::new(self.query.core(r).facets);
        let key_collectors = MultiCollector::new(
            key_fields
                .iter()
                .map(|field| JoinKeyCollector::new(field, Arc::clone(keys)))
                .collect(),
        );
        let collector = (page, (CountCollector, (facets, key_collectors)));
        let (page, (count, (facets, key_sets))) = self.search(r, query, &collector)?;
        let (hits, groups) = page.into_page();
        Ok(MainFruit {
            hits,
            total: groups.unwrap_or(count),
            facets,
            keys: key_sets,
        })
    }
}

impl KeySource for Call<'_> {
    fn collect_keys(&self, core: &str, query: &Query, field: &str) -> Result<KeyBitSet> {
        let caches = &self.engine.caches;
        let collector =
            JoinKeyCollector::cached(field, Arc::clone(&caches.keys), &caches.bitsets, query);
        let bits = self.search(core, query, &collector)?;
        debug!(core, field, keys = bits.cardinality(), "collected join keys");
        Ok(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryCore;
    use crate::index::types::Document;

    #[test]
    fn test_relations_intersect_per_field() {
        let mut relations = Relations::default();
        relations.add("K", KeySet::new(KeyBitSet::from_keys([1, 2, 3]).unwrap()));
        relations.add("K", KeySet::inverted(KeyBitSet::from_keys([2]).unwrap()));
        relations.add("J", KeySet::inverted(KeyBitSet::from_keys([9]).unwrap()));
        relations.add("J", KeySet::inverted(KeyBitSet::from_keys([8]).unwrap()));
        let k = &relations.sets["K"];
        assert!(!k.inverted);
        assert_eq!(k.bits.iter().collect::<Vec<_>>(), vec![1, 3]);
        let j = &relations.sets["J"];
        assert!(j.inverted);
        assert_eq!(j.bits.iter().collect::<Vec<_>>(), vec![8, 9]);
    }

    #[test]
    fn test_unknown_core_aborts() {
        let mut engine = FederationEngine::new(EngineConfig {
            concurrency: 2,
            ..Default::default()
        })
        .unwrap();
        let a = MemoryCore::new("a");
        a.add_segment(vec![Document::new("a1")]);
        engine.register(Arc::new(a)).unwrap();

        let query = ComposedQuery::new("a")
            .participate("ghost")
            .join("a", "K", "ghost", "K");
        assert!(matches!(
            engine.execute(&query),
            Err(Error::UnknownCore(name)) if name == "ghost"
        ));
    }

    #[test]
    fn test_stats_report_every_core() {
        let mut engine = FederationEngine::new(EngineConfig::default()).unwrap();
        let a = MemoryCore::new("a");
        a.add_segment(vec![Document::new("a1"), Document::new("a2")]);
        a.add_segment(vec![Document::new("a3")]);
        engine.register(Arc::new(a)).unwrap();
        engine.register(Arc::new(MemoryCore::new("b"))).unwrap();
        assert_eq!(
            engine.stats(),
            vec![
                CoreStats {
                    name: "a".into(),
                    segments: 2,
                    docs: 3
                },
                CoreStats {
                    name: "b".into(),
                    segments: 0,
                    docs: 0
                },
            ]
        );
    }
}
