use crate::join::bitset::KeySet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A query against one core.
///
/// `Hash + Eq` so a (query, field) pair can key the cached key-bitset layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    /// Every live document
    All,
    /// Exact value match (string form, or numeric equality for numeric fields)
    Term { field: String, value: String },
    /// Inclusive integer range; open ends are unbounded
    Range {
        field: String,
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    /// Documents that carry a value for `field`
    Exists { field: String },
    /// Glob pattern over the string form of `field`
    Wildcard { field: String, pattern: String },
    /// Regular expression over the string form of `field`
    Regex { field: String, pattern: String },
    Bool(BoolQuery),
    /// Documents whose join key in `field` belongs to `keys`. Built by the planner.
    #[serde(skip)]
    JoinKeys { field: String, keys: Arc<KeySet> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoolQuery {
    /// Required, scoring
    #[serde(default)]
    pub must: Vec<Query>,
    /// Optional, scoring; at least one must match when there are no required clauses
    #[serde(default)]
    pub should: Vec<Query>,
    /// Required, non-scoring
    #[serde(default)]
    pub filter: Vec<Query>,
    /// Excluded
    #[serde(default)]
    pub must_not: Vec<Query>,
}

impl Query {
    pub fn all() -> Self {
        Query::All
    }

    pub fn term(field: impl Into<String>, value: impl ToString) -> Self {
        Query::Term {
            field: field.into(),
            value: value.to_string(),
        }
    }

    pub fn range(field: impl Into<String>, min: Option<i64>, max: Option<i64>) -> Self {
        Query::Range {
            field: field.into(),
            min,
            max,
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Query::Exists {
            field: field.into(),
        }
    }

    pub fn join_keys(field: impl Into<String>, keys: KeySet) -> Self {
        Query::JoinKeys {
            field: field.into(),
            keys: Arc::new(keys),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Query::All)
    }

    /// Restrict this query by non-scoring filters and exclusions.
    ///
    /// Returns `self` unchanged when there is nothing to add.
    pub fn filtered(self, filters: Vec<Query>, excludes: Vec<Query>) -> Query {
        if filters.is_empty() && excludes.is_empty() {
            return self;
        }
        match self {
            Query::Bool(mut b) => {
                b.filter.extend(filters);
                b.must_not.extend(excludes);
                Query::Bool(b)
            }
            other => Query::Bool(BoolQuery {
                must: vec![other],
                filter: filters,
                must_not: excludes,
                ..Default::default()
            }),
        }
    }

    /// Add one non-scoring filter
    pub fn with_filter(self, filter: Query) -> Query {
        self.filtered(vec![filter], Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::bitset::KeyBitSet;
    use std::collections::HashSet;

    #[test]
    fn test_filtered_wraps_once() {
        let q = Query::term("color", "red")
            .with_filter(Query::exists("k"))
            .with_filter(Query::range("n", Some(1), None));
        match q {
            Query::Bool(b) => {
                assert_eq!(b.must, vec![Query::term("color", "red")]);
                assert_eq!(b.filter.len(), 2);
            }
            other => panic!("expected bool query, got {:?}", other),
        }
    }

    #[test]
    fn test_filtered_without_clauses_is_identity() {
        assert_eq!(Query::All.filtered(vec![], vec![]), Query::All);
    }

    #[test]
    fn test_queries_key_hash_sets() {
        let keys = KeySet::new(KeyBitSet::from_keys([1, 2]).unwrap());
        let mut seen = HashSet::new();
        seen.insert(Query::join_keys("k", keys.clone()));
        assert!(seen.contains(&Query::join_keys("k", keys)));
        assert!(!seen.contains(&Query::join_keys(
            "k",
            KeySet::new(KeyBitSet::from_keys([1]).unwrap())
        )));
    }

    #[test]
    fn test_query_json_shape() {
        let q: Query = serde_json::from_str(
            r#"{"type":"bool","must":[{"type":"term","field":"u","value":"true"}],
                "must_not":[{"type":"range","field":"n","min":3}]}"#,
        )
        .unwrap();
        let expected = Query::term("u", "true").filtered(vec![], vec![Query::range("n", Some(3), None)]);
        assert_eq!(q, expected);
    }
}
