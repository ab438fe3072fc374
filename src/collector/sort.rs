//! Top-k retrieval ordered by field values.
//!
//! A [`FieldComparator`] binds to one segment at a time and yields a
//! [`SortKey`] per document. Keys are compared clause by clause under each
//! clause's order and missing-value policy; full ties fall back to score
//! descending, then absolute doc id ascending.

use crate::collector::{Collector, LocalCollector, Visit};
use crate::error::{Error, Result};
use crate::index::segment::SegmentHandle;
use crate::index::types::{DocId, Score};
use crate::query::{MissingValue, SortField, SortOrder, ValueType};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;

/// Value a document sorts by
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SortKey {
    /// `None` when the document has no value
    Str(Option<String>),
    Int(i64),
    Double(f64),
}

impl SortKey {
    pub fn compare(&self, other: &SortKey, order: SortOrder, missing: MissingValue) -> Ordering {
        let ord = match (self, other) {
            (SortKey::Str(a), SortKey::Str(b)) => match (a, b) {
                (Some(a), Some(b)) => a.cmp(b),
                (None, None) => return Ordering::Equal,
                // Missing strings keep their place whatever the order
                (None, Some(_)) => return missing_first(missing),
                (Some(_), None) => return missing_first(missing).reverse(),
            },
            (SortKey::Int(a), SortKey::Int(b)) => a.cmp(b),
            (SortKey::Double(a), SortKey::Double(b)) => a.total_cmp(b),
            _ => Ordering::Equal,
        };
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }
}

fn missing_first(missing: MissingValue) -> Ordering {
    match missing {
        MissingValue::StringFirst => Ordering::Less,
        _ => Ordering::Greater,
    }
}

/// Produces sort keys for the documents of one segment.
pub trait SegmentValues {
    /// `doc` is local to the bound segment
    fn key(&self, doc: DocId, score: Score) -> Result<SortKey>;
}

/// Source of sort keys for one sort clause.
pub trait FieldComparator: Send + Sync {
    fn bind(&self, segment: &SegmentHandle) -> Result<Box<dyn SegmentValues>>;

    /// Key of a document with no value
    fn missing(&self) -> SortKey;
}

pub struct StringComparator {
    field: Arc<str>,
}

impl StringComparator {
    pub fn new(field: &str) -> Self {
        Self {
            field: Arc::from(field),
        }
    }
}

struct StringValues {
    segment: SegmentHandle,
    field: Arc<str>,
}

impl SegmentValues for StringValues {
    fn key(&self, doc: DocId, _score: Score) -> Result<SortKey> {
        let value = self.segment.reader().value(&self.field, doc)?;
        Ok(SortKey::Str(value.map(|v| v.to_string())))
    }
}

impl FieldComparator for StringComparator {
    fn bind(&self, segment: &SegmentHandle) -> Result<Box<dyn SegmentValues>> {
        Ok(Box::new(StringValues {
            segment: segment.clone(),
            field: Arc::clone(&self.field),
        }))
    }

    fn missing(&self) -> SortKey {
        SortKey::Str(None)
    }
}

pub struct IntComparator {
    field: Arc<str>,
    missing: i64,
}

impl IntComparator {
    pub fn new(field: &str, missing: i64) -> Self {
        Self {
            field: Arc::from(field),
            missing,
        }
    }
}

struct IntValues {
    segment: SegmentHandle,
    field: Arc<str>,
    missing: i64,
}

impl SegmentValues for IntValues {
    fn key(&self, doc: DocId, _score: Score) -> Result<SortKey> {
        let value = self.segment.reader().value(&self.field, doc)?;
        Ok(SortKey::Int(
            value.and_then(|v| v.as_i64()).unwrap_or(self.missing),
        ))
    }
}

impl FieldComparator for IntComparator {
    fn bind(&self, segment: &SegmentHandle) -> Result<Box<dyn SegmentValues>> {
        Ok(Box::new(IntValues {
            segment: segment.clone(),
            field: Arc::clone(&self.field),
            missing: self.missing,
        }))
    }

    fn missing(&self) -> SortKey {
        SortKey::Int(self.missing)
    }
}

pub struct DoubleComparator {
    field: Arc<str>,
    missing: f64,
}

impl DoubleComparator {
    pub fn new(field: &str, missing: f64) -> Self {
        Self {
            field: Arc::from(field),
            missing,
        }
    }
}

struct DoubleValues {
    segment: SegmentHandle,
    field: Arc<str>,
    missing: f64,
}

impl SegmentValues for DoubleValues {
    fn key(&self, doc: DocId, _score: Score) -> Result<SortKey> {
        let value = self.segment.reader().value(&self.field, doc)?;
        Ok(SortKey::Double(
            value.and_then(|v| v.as_f64()).unwrap_or(self.missing),
        ))
    }
}

impl FieldComparator for DoubleComparator {
    fn bind(&self, segment: &SegmentHandle) -> Result<Box<dyn SegmentValues>> {
        Ok(Box::new(DoubleValues {
            segment: segment.clone(),
            field: Arc::clone(&self.field),
            missing: self.missing,
        }))
    }

    fn missing(&self) -> SortKey {
        SortKey::Double(self.missing)
    }
}

/// Sorts by the collected relevance score.
pub struct ScoreComparator;

struct ScoreValues;

impl SegmentValues for ScoreValues {
    fn key(&self, _doc: DocId, score: Score) -> Result<SortKey> {
        Ok(SortKey::Double(score as f64))
    }
}

impl FieldComparator for ScoreComparator {
    fn bind(&self, _segment: &SegmentHandle) -> Result<Box<dyn SegmentValues>> {
        Ok(Box::new(ScoreValues))
    }

    fn missing(&self) -> SortKey {
        SortKey::Double(0.0)
    }
}

/// One sort clause: a comparator with its order and missing-value policy.
#[derive(Clone)]
pub struct SortClause {
    pub order: SortOrder,
    pub missing: MissingValue,
    comparator: Arc<dyn FieldComparator>,
}

impl SortClause {
    pub fn new(field: &SortField, comparator: Arc<dyn FieldComparator>) -> Self {
        Self {
            order: field.order,
            missing: field.missing,
            comparator,
        }
    }

    /// Clause over a field of the searched core itself
    pub fn local(field: &SortField) -> Result<Self> {
        if field.field.is_empty() && field.value_type != ValueType::Score {
            return Err(Error::InvalidQuery("sort field without a name".to_string()));
        }
        let missing = field.missing.numeric_default();
        let comparator: Arc<dyn FieldComparator> = match field.value_type {
            ValueType::String => Arc::new(StringComparator::new(&field.field)),
            ValueType::Int => Arc::new(IntComparator::new(&field.field, missing as i64)),
            ValueType::Double => Arc::new(DoubleComparator::new(&field.field, missing)),
            ValueType::Score => Arc::new(ScoreComparator),
        };
        Ok(Self::new(field, comparator))
    }
}

/// A hit with the keys it was sorted by.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortedHit {
    pub doc: DocId,
    pub score: Score,
    pub keys: Vec<SortKey>,
}

fn hit_cmp(clauses: &[SortClause], a: &SortedHit, b: &SortedHit) -> Ordering {
    for (clause, (ka, kb)) in clauses.iter().zip(a.keys.iter().zip(&b.keys)) {
        let ord = ka.compare(kb, clause.order, clause.missing);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.doc.cmp(&b.doc))
}

fn sort_truncate(clauses: &[SortClause], hits: &mut Vec<SortedHit>, limit: usize) {
    hits.sort_by(|a, b| hit_cmp(clauses, a, b));
    hits.truncate(limit);
}

/// Collects the `limit` first hits under a list of sort clauses.
pub struct TopFieldCollector {
    clauses: Arc<[SortClause]>,
    limit: usize,
}

pub struct TopFieldLocal {
    clauses: Arc<[SortClause]>,
    values: Vec<Box<dyn SegmentValues>>,
    base: DocId,
    buffer: Vec<SortedHit>,
    limit: usize,
}

impl TopFieldCollector {
    pub fn new(clauses: Vec<SortClause>, limit: usize) -> Self {
        Self {
            clauses: clauses.into(),
            limit,
        }
    }
}

impl Collector for TopFieldCollector {
    type Local = TopFieldLocal;
    type Partial = Vec<SortedHit>;
    type Fruit = Vec<SortedHit>;

    fn needs_scores(&self) -> bool {
        true
    }

    fn local(&self) -> Result<TopFieldLocal> {
        Ok(TopFieldLocal {
            clauses: Arc::clone(&self.clauses),
            values: Vec::with_capacity(self.clauses.len()),
            base: 0,
            buffer: Vec::new(),
            limit: self.limit,
        })
    }

    fn merge(&self, partials: Vec<Vec<SortedHit>>) -> Result<Vec<SortedHit>> {
        let mut hits: Vec<SortedHit> = partials.into_iter().flatten().collect();
        sort_truncate(&self.clauses, &mut hits, self.limit);
        Ok(hits)
    }
}

impl LocalCollector for TopFieldLocal {
    type Partial = Vec<SortedHit>;

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        self.base = segment.base;
        self.values = self
            .clauses
            .iter()
            .map(|c| c.comparator.bind(segment))
            .collect::<Result<_>>()?;
        Ok(if self.limit == 0 {
            Visit::Skip
        } else {
            Visit::Docs
        })
    }

    fn collect(&mut self, doc: DocId, score: Score) -> Result<()> {
        let keys = self
            .values
            .iter()
            .map(|v| v.key(doc, score))
            .collect::<Result<Vec<_>>>()?;
        self.buffer.push(SortedHit {
            doc: self.base + doc,
            score,
            keys,
        });
        if self.buffer.len() >= self.limit.saturating_mul(2) {
            sort_truncate(&self.clauses, &mut self.buffer, self.limit);
        }
        Ok(())
    }

    fn complete(mut self) -> Result<Vec<SortedHit>> {
        sort_truncate(&self.clauses, &mut self.buffer, self.limit);
        Ok(self.buffer)
    }
}
