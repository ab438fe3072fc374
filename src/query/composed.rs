//! Declarative description of one federated request.
//!
//! A [`ComposedQuery`] is built once per request (deserialized from JSON or
//! assembled with the builder methods), consumed by the federation engine and
//! discarded.

use crate::error::{Error, Result};
use crate::join::algebra::RelationalExpr;
use crate::query::tree::Query;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Queries and facets scoped to one core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreQuery {
    /// Primary query; `None` means match all
    #[serde(default)]
    pub query: Option<Query>,
    #[serde(default)]
    pub filter_queries: Vec<Query>,
    #[serde(default)]
    pub exclude_filter_queries: Vec<Query>,
    #[serde(default)]
    pub facets: Vec<FacetRequest>,
}

impl CoreQuery {
    pub fn new(query: Query) -> Self {
        Self {
            query: Some(query),
            ..Default::default()
        }
    }

    pub fn primary(&self) -> Query {
        self.query.clone().unwrap_or(Query::All)
    }

    /// Primary query restricted by this core's filter and exclude-filter queries
    pub fn full_query(&self) -> Query {
        self.primary().filtered(
            self.filter_queries.clone(),
            self.exclude_filter_queries.clone(),
        )
    }
}

/// Directed relation: documents of `from` point at `to` through `key_field` on `from`.
///
/// Two entries, one per direction, encode one bidirectional relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub from: String,
    pub to: String,
    pub key_field: String,
}

/// OR two core-scoped subsets into the result core's key set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unite {
    pub core_a: String,
    pub query_a: Query,
    pub core_b: String,
    pub query_b: Query,
}

/// Relational filter tree, resolved into a key set on `field` of the result core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalFilter {
    pub field: String,
    pub expr: RelationalExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetRequest {
    pub field: String,
    /// Maximum number of terms returned; all when absent
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default = "default_min_count")]
    pub min_count: u64,
}

fn default_min_count() -> u64 {
    1
}

impl FacetRequest {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            limit: None,
            min_count: 1,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    String,
    Int,
    Double,
    /// The (blended) relevance score; `field` is ignored
    Score,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// What a document without a sort value compares as.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissingValue {
    /// Missing strings sort before every present value, whatever the order
    StringFirst,
    /// Missing strings sort after every present value, whatever the order
    #[default]
    StringLast,
    /// Missing numbers take this value
    Numeric(f64),
}

impl MissingValue {
    /// Substitute for a missing numeric value (`0` unless configured)
    pub fn numeric_default(&self) -> f64 {
        match self {
            MissingValue::Numeric(v) => *v,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
    /// Core the field lives on; the result core when absent
    #[serde(default)]
    pub core: Option<String>,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub missing: MissingValue,
}

impl SortField {
    pub fn new(field: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            core: None,
            field: field.into(),
            value_type,
            order: SortOrder::Asc,
            missing: MissingValue::default(),
        }
    }

    pub fn score() -> Self {
        Self::new("", ValueType::Score).desc()
    }

    pub fn on_core(mut self, core: impl Into<String>) -> Self {
        self.core = Some(core.into());
        self
    }

    pub fn desc(mut self) -> Self {
        self.order = SortOrder::Desc;
        self
    }

    pub fn missing(mut self, missing: MissingValue) -> Self {
        self.missing = missing;
        self
    }
}

fn default_stop() -> usize {
    10
}

/// One federated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedQuery {
    pub results_from: String,
    #[serde(default)]
    pub cores: BTreeMap<String, CoreQuery>,
    #[serde(default)]
    pub matches: Vec<Match>,
    #[serde(default)]
    pub unites: Vec<Unite>,
    #[serde(default)]
    pub relational_filter: Option<RelationalFilter>,
    #[serde(default)]
    pub rank_queries: BTreeMap<String, Query>,
    #[serde(default)]
    pub rank_ratio: Option<f32>,
    #[serde(default)]
    pub sort: Vec<SortField>,
    #[serde(default)]
    pub start: usize,
    #[serde(default = "default_stop")]
    pub stop: usize,
    #[serde(default)]
    pub export_key: Option<String>,
    /// Keep only the best hit per join key in this result-core field
    #[serde(default)]
    pub collapse: Option<String>,
}

impl ComposedQuery {
    pub fn new(results_from: impl Into<String>) -> Self {
        let results_from = results_from.into();
        let mut cores = BTreeMap::new();
        cores.insert(results_from.clone(), CoreQuery::default());
        Self {
            results_from,
            cores,
            matches: Vec::new(),
            unites: Vec::new(),
            relational_filter: None,
            rank_queries: BTreeMap::new(),
            rank_ratio: None,
            sort: Vec::new(),
            start: 0,
            stop: default_stop(),
            export_key: None,
            collapse: None,
        }
    }

    fn core_mut(&mut self, core: &str) -> &mut CoreQuery {
        self.cores.entry(core.to_string()).or_default()
    }

    /// Add `core` as a participant with its primary query
    pub fn query(mut self, core: &str, query: Query) -> Self {
        self.core_mut(core).query = Some(query);
        self
    }

    /// Add `core` as a participant without restricting the result core
    pub fn participate(mut self, core: &str) -> Self {
        self.core_mut(core);
        self
    }

    pub fn filter(mut self, core: &str, query: Query) -> Self {
        self.core_mut(core).filter_queries.push(query);
        self
    }

    pub fn exclude(mut self, core: &str, query: Query) -> Self {
        self.core_mut(core).exclude_filter_queries.push(query);
        self
    }

    pub fn facet(mut self, core: &str, facet: FacetRequest) -> Self {
        self.core_mut(core).facets.push(facet);
        self
    }

    /// Relate `a` and `b` in both directions
    pub fn join(mut self, a: &str, a_field: &str, b: &str, b_field: &str) -> Self {
        self.matches.push(Match {
            from: a.to_string(),
            to: b.to_string(),
            key_field: a_field.to_string(),
        });
        self.matches.push(Match {
            from: b.to_string(),
            to: a.to_string(),
            key_field: b_field.to_string(),
        });
        self
    }

    pub fn unite(mut self, core_a: &str, query_a: Query, core_b: &str, query_b: Query) -> Self {
        self.unites.push(Unite {
            core_a: core_a.to_string(),
            query_a,
            core_b: core_b.to_string(),
            query_b,
        });
        self
    }

    pub fn relational(mut self, field: &str, expr: RelationalExpr) -> Self {
        self.relational_filter = Some(RelationalFilter {
            field: field.to_string(),
            expr,
        });
        self
    }

    pub fn rank(mut self, core: &str, query: Query) -> Self {
        self.rank_queries.insert(core.to_string(), query);
        self
    }

    pub fn ratio(mut self, ratio: f32) -> Self {
        self.rank_ratio = Some(ratio);
        self
    }

    pub fn sort_by(mut self, field: SortField) -> Self {
        self.sort.push(field);
        self
    }

    pub fn page(mut self, start: usize, stop: usize) -> Self {
        self.start = start;
        self.stop = stop;
        self
    }

    pub fn export(mut self, field: &str) -> Self {
        self.export_key = Some(field.to_string());
        self
    }

    pub fn collapse(mut self, field: &str) -> Self {
        self.collapse = Some(field.to_string());
        self
    }

    /// Query and facets for `core`; an empty match-all entry for non-participants
    pub fn core(&self, core: &str) -> CoreQuery {
        self.cores.get(core).cloned().unwrap_or_default()
    }

    /// Participating cores other than the result core, in name order
    pub fn other_cores(&self) -> impl Iterator<Item = (&String, &CoreQuery)> {
        self.cores
            .iter()
            .filter(move |(name, _)| **name != self.results_from)
    }

    /// Number of participating cores, the result core included
    pub fn participant_count(&self) -> usize {
        let mut count = self.cores.len();
        if !self.cores.contains_key(&self.results_from) {
            count += 1;
        }
        count
    }

    /// Key field on `from` that points at `to`
    pub fn key_field(&self, from: &str, to: &str) -> Result<&str> {
        self.matches
            .iter()
            .find(|m| m.from == from && m.to == to)
            .map(|m| m.key_field.as_str())
            .ok_or_else(|| Error::MissingRelation {
                from: from.to_string(),
                to: to.to_string(),
            })
    }

    /// Every core name the request refers to anywhere
    pub fn referenced_cores(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        names.insert(self.results_from.as_str());
        names.extend(self.cores.keys().map(String::as_str));
        for m in &self.matches {
            names.insert(m.from.as_str());
            names.insert(m.to.as_str());
        }
        for u in &self.unites {
            names.insert(u.core_a.as_str());
            names.insert(u.core_b.as_str());
        }
        names.extend(self.rank_queries.keys().map(String::as_str));
        for s in &self.sort {
            if let Some(core) = &s.core {
                names.insert(core.as_str());
            }
        }
        if let Some(filter) = &self.relational_filter {
            filter.expr.cores(&mut names);
        }
        names
    }

    /// Check structure that does not depend on registered cores.
    pub fn validate(&self) -> Result<()> {
        if self.stop < self.start {
            return Err(Error::InvalidQuery(format!(
                "page window {}..{} is reversed",
                self.start, self.stop
            )));
        }
        if self.collapse.is_some() && self.sort.iter().any(|s| s.value_type != ValueType::Score) {
            return Err(Error::InvalidQuery(
                "collapse requires relevance ordering".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_registers_participants() {
        let q = ComposedQuery::new("a")
            .participate("b")
            .join("a", "K", "b", "K");
        assert_eq!(q.participant_count(), 2);
        assert_eq!(q.key_field("a", "b").unwrap(), "K");
        assert!(matches!(
            q.key_field("a", "c"),
            Err(Error::MissingRelation { .. })
        ));
        let others: Vec<_> = q.other_cores().map(|(n, _)| n.as_str()).collect();
        assert_eq!(others, vec!["b"]);
    }

    #[test]
    fn test_referenced_cores_cover_every_entry() {
        let q = ComposedQuery::new("a")
            .unite("a", Query::All, "b", Query::All)
            .rank("r", Query::All)
            .sort_by(SortField::new("name", ValueType::String).on_core("s"));
        let names: Vec<_> = q.referenced_cores().into_iter().collect();
        assert_eq!(names, vec!["a", "b", "r", "s"]);
    }

    #[test]
    fn test_deserializes_contract_shape() {
        let q: ComposedQuery = serde_json::from_str(
            r#"{
                "results_from": "a",
                "cores": {"a": {}, "b": {"filter_queries": [{"type": "term", "field": "n", "value": "x"}]}},
                "matches": [{"from": "a", "to": "b", "key_field": "K"},
                            {"from": "b", "to": "a", "key_field": "K"}],
                "sort": [{"core": "b", "field": "name", "missing": "STRING_LAST"}],
                "start": 0, "stop": 5, "export_key": "K"
            }"#,
        )
        .unwrap();
        assert_eq!(q.results_from, "a");
        assert_eq!(q.core("b").filter_queries.len(), 1);
        assert_eq!(q.sort[0].missing, MissingValue::StringLast);
        assert_eq!(q.sort[0].value_type, ValueType::String);
        assert_eq!(q.stop, 5);
        assert_eq!(q.export_key.as_deref(), Some("K"));
    }

    #[test]
    fn test_validate_rejects_collapse_with_field_sort() {
        let q = ComposedQuery::new("a")
            .collapse("K")
            .sort_by(SortField::new("n", ValueType::Int));
        assert!(matches!(q.validate(), Err(Error::InvalidQuery(_))));
        assert!(ComposedQuery::new("a").collapse("K").validate().is_ok());
    }
}
