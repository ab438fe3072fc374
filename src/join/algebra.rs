//! AND / OR / NOT over key sets drawn from several cores.
//!
//! Every node evaluates to a [`KeySet`] in one shared key space. A parent may
//! pass an external restriction down; leaves apply it as a join-key filter
//! on their query so restricted sub-queries never see excluded keys.

use crate::error::Result;
use crate::join::bitset::{KeyBitSet, KeySet};
use crate::query::Query;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Runs one query on one core and returns the join keys of its matches.
pub trait KeySource {
    fn collect_keys(&self, core: &str, query: &Query, field: &str) -> Result<KeyBitSet>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelationalExpr {
    /// Keys in `key_field` of the docs of `core` matching `query`
    Leaf {
        core: String,
        query: Query,
        key_field: String,
    },
    /// Keys of `second`, restricted to those of `first`
    And {
        first: Box<RelationalExpr>,
        second: Box<RelationalExpr>,
    },
    Or {
        first: Box<RelationalExpr>,
        second: Box<RelationalExpr>,
    },
    Not { inner: Box<RelationalExpr> },
}

impl RelationalExpr {
    pub fn leaf(core: &str, query: Query, key_field: &str) -> Self {
        RelationalExpr::Leaf {
            core: core.to_string(),
            query,
            key_field: key_field.to_string(),
        }
    }

    pub fn and(first: RelationalExpr, second: RelationalExpr) -> Self {
        RelationalExpr::And {
            first: Box::new(first),
            second: Box::new(second),
        }
    }

    pub fn or(first: RelationalExpr, second: RelationalExpr) -> Self {
        RelationalExpr::Or {
            first: Box::new(first),
            second: Box::new(second),
        }
    }

    pub fn not(inner: RelationalExpr) -> Self {
        RelationalExpr::Not {
            inner: Box::new(inner),
        }
    }

    /// Evaluate the tree, keeping only keys allowed by `external` if given.
    pub fn execute(&self, source: &dyn KeySource, external: Option<&KeySet>) -> Result<KeySet> {
        match self {
            RelationalExpr::Leaf {
                core,
                query,
                key_field,
            } => {
                let query = match external {
                    Some(keys) => query
                        .clone()
                        .with_filter(Query::join_keys(key_field.as_str(), keys.clone())),
                    None => query.clone(),
                };
                let bits = source.collect_keys(core, &query, key_field)?;
                Ok(KeySet::new(bits))
            }
            RelationalExpr::And { first, second } => {
                let left = first.execute(source, external)?;
                let restrict = match external {
                    Some(keys) => left.meet(keys),
                    None => left,
                };
                let right = second.execute(source, Some(&restrict))?;
                // A restricted plain set is already inside `restrict`; a complement is not
                Ok(if right.inverted {
                    restrict.meet(&right)
                } else {
                    right
                })
            }
            RelationalExpr::Or { first, second } => {
                let left = first.execute(source, external)?;
                let right = second.execute(source, external)?;
                let union = left.union(&right);
                Ok(match external {
                    Some(keys) if union.inverted => keys.clone().meet(&union),
                    _ => union,
                })
            }
            RelationalExpr::Not { inner } => Ok(inner.execute(source, external)?.negate()),
        }
    }

    /// Add every core this tree reads from to `names`
    pub fn cores<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            RelationalExpr::Leaf { core, .. } => {
                names.insert(core.as_str());
            }
            RelationalExpr::And { first, second } | RelationalExpr::Or { first, second } => {
                first.cores(names);
                second.cores(names);
            }
            RelationalExpr::Not { inner } => inner.cores(names),
        }
    }
}
