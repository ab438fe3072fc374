//! Sorting result-core hits by a field that lives on a related core.
//!
//! [`JoinSortCollector`] runs over the other core first and records, per join
//! key, the absolute doc id holding that key. A [`JoinedComparator`] then
//! wraps a typed comparator of the other core: for each result-core doc it
//! follows the join key to the other core's doc and reads the sort value
//! there, or reports the wrapped comparator's missing value.

use crate::collector::sort::{
    DoubleComparator, FieldComparator, IntComparator, SegmentValues, SortClause, SortKey,
    StringComparator,
};
use crate::collector::{Collector, LocalCollector, Visit};
use crate::error::{Error, Result};
use crate::index::segment::{SegmentHandle, Snapshot};
use crate::index::types::{DocId, JoinKey, NO_KEY, Score};
use crate::join::bitset::max_key_for;
use crate::join::cache::{JoinKeyCache, KeyColumn};
use crate::query::{SortField, ValueType};
use crate::utils::grown_len;
use std::sync::Arc;

/// Largest key a [`JoinDocTable`] will grow to hold
pub const MAX_SORT_KEY: JoinKey = max_key_for(size_of::<u32>() as u64);

/// Absolute doc id per join key, stored as `doc + 1` so that 0 means absent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinDocTable {
    docs: Vec<u32>,
}

impl JoinDocTable {
    #[inline]
    pub fn doc_for(&self, key: JoinKey) -> Option<DocId> {
        match self.docs.get(key as usize) {
            Some(&slot) if slot != 0 => Some(slot - 1),
            _ => None,
        }
    }

    fn record(&mut self, key: JoinKey, doc: DocId) -> Result<()> {
        if key > MAX_SORT_KEY {
            return Err(Error::CapacityInvariant(format!(
                "sort key {} exceeds {}",
                key, MAX_SORT_KEY
            )));
        }
        let idx = key as usize;
        if idx >= self.docs.len() {
            let len = grown_len(self.docs.len(), idx + 1);
            self.docs.resize(len, 0);
        }
        if self.docs[idx] == 0 {
            self.docs[idx] = doc + 1;
        }
        Ok(())
    }
}

/// Maps each join key in `field` to the first matching doc holding it.
pub struct JoinSortCollector {
    field: Arc<str>,
    keys: Arc<JoinKeyCache>,
}

pub struct JoinSortLocal {
    field: Arc<str>,
    keys: Arc<JoinKeyCache>,
    column: Option<KeyColumn>,
    base: DocId,
    table: JoinDocTable,
}

impl JoinSortCollector {
    pub fn new(field: &str, keys: Arc<JoinKeyCache>) -> Self {
        Self {
            field: Arc::from(field),
            keys,
        }
    }
}

impl Collector for JoinSortCollector {
    type Local = JoinSortLocal;
    type Partial = JoinDocTable;
    type Fruit = JoinDocTable;

    fn local(&self) -> Result<JoinSortLocal> {
        Ok(JoinSortLocal {
            field: Arc::clone(&self.field),
            keys: Arc::clone(&self.keys),
            column: None,
            base: 0,
            table: JoinDocTable::default(),
        })
    }

    fn merge(&self, partials: Vec<JoinDocTable>) -> Result<JoinDocTable> {
        let len = partials.iter().map(|p| p.docs.len()).max().unwrap_or(0);
        let mut merged = JoinDocTable { docs: vec![0; len] };
        for partial in &partials {
            for (mine, &theirs) in merged.docs.iter_mut().zip(&partial.docs) {
                if *mine == 0 {
                    *mine = theirs;
                }
            }
        }
        Ok(merged)
    }
}

impl LocalCollector for JoinSortLocal {
    type Partial = JoinDocTable;

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        self.base = segment.base;
        self.column = Some(self.keys.column(segment, &self.field)?);
        Ok(Visit::Docs)
    }

    fn collect(&mut self, doc: DocId, _score: Score) -> Result<()> {
        let key = self
            .column
            .as_ref()
            .and_then(|c| c.get(doc as usize).copied())
            .unwrap_or(NO_KEY);
        if key != NO_KEY {
            self.table.record(key, self.base + doc)?;
        }
        Ok(())
    }

    fn complete(self) -> Result<JoinDocTable> {
        Ok(self.table)
    }
}

/// Reads a typed sort value from the other-core doc joined to each result-core doc.
pub struct JoinedComparator<C> {
    inner: C,
    key_field: Arc<str>,
    keys: Arc<JoinKeyCache>,
    table: Arc<JoinDocTable>,
    other: Arc<Snapshot>,
}

impl<C: FieldComparator> JoinedComparator<C> {
    /// `key_field` is the result-core field holding the join key
    pub fn new(
        inner: C,
        key_field: &str,
        keys: Arc<JoinKeyCache>,
        table: Arc<JoinDocTable>,
        other: Arc<Snapshot>,
    ) -> Self {
        Self {
            inner,
            key_field: Arc::from(key_field),
            keys,
            table,
            other,
        }
    }
}

struct JoinedValues {
    column: KeyColumn,
    table: Arc<JoinDocTable>,
    other: Arc<Snapshot>,
    /// Bound values of each other-core segment, by segment ord
    values: Vec<Box<dyn SegmentValues>>,
    missing: SortKey,
}

impl SegmentValues for JoinedValues {
    fn key(&self, doc: DocId, _score: Score) -> Result<SortKey> {
        let key = self.column.get(doc as usize).copied().unwrap_or(NO_KEY);
        if key == NO_KEY {
            return Ok(self.missing.clone());
        }
        let Some(other_doc) = self.table.doc_for(key) else {
            return Ok(self.missing.clone());
        };
        match self.other.locate(other_doc) {
            Some((segment, local)) => self.values[segment.ord].key(local, 0.0),
            None => Ok(self.missing.clone()),
        }
    }
}

impl<C: FieldComparator> FieldComparator for JoinedComparator<C> {
    fn bind(&self, segment: &SegmentHandle) -> Result<Box<dyn SegmentValues>> {
        let values = self
            .other
            .segments()
            .iter()
            .map(|s| self.inner.bind(s))
            .collect::<Result<_>>()?;
        Ok(Box::new(JoinedValues {
            column: self.keys.column(segment, &self.key_field)?,
            table: Arc::clone(&self.table),
            other: Arc::clone(&self.other),
            values,
            missing: self.inner.missing(),
        }))
    }

    fn missing(&self) -> SortKey {
        self.inner.missing()
    }
}

/// Sort clause over `field` of another core, joined through `key_field` of the result core.
pub fn joined_clause(
    field: &SortField,
    key_field: &str,
    keys: Arc<JoinKeyCache>,
    table: Arc<JoinDocTable>,
    other: Arc<Snapshot>,
) -> Result<SortClause> {
    let missing = field.missing.numeric_default();
    let comparator: Arc<dyn FieldComparator> = match field.value_type {
        ValueType::String => Arc::new(JoinedComparator::new(
            StringComparator::new(&field.field),
            key_field,
            keys,
            table,
            other,
        )),
        ValueType::Int => Arc::new(JoinedComparator::new(
            IntComparator::new(&field.field, missing as i64),
            key_field,
            keys,
            table,
            other,
        )),
        ValueType::Double => Arc::new(JoinedComparator::new(
            DoubleComparator::new(&field.field, missing),
            key_field,
            keys,
            table,
            other,
        )),
        ValueType::Score => {
            return Err(Error::InvalidQuery(format!(
                "cannot sort by the score of core '{}'",
                other.core()
            )));
        }
    };
    Ok(SortClause::new(field, comparator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{TopFieldCollector, run_serial};
    use crate::index::memory::MemoryCore;
    use crate::index::types::Document;
    use crate::query::{MissingValue, Query};
    use crate::search::SearchCoordinator;

    fn cores() -> (MemoryCore, MemoryCore) {
        let a = MemoryCore::new("a");
        a.add_segment(vec![
            Document::new("a1").with_int("K", 1),
            Document::new("a2").with_int("K", 2),
        ]);
        a.add_segment(vec![
            Document::new("a3").with_int("K", 3),
            Document::new("a4"),
        ]);
        let b = MemoryCore::new("b");
        b.add_segment(vec![Document::new("b3").with_int("K", 3).with_str("name", "apple")]);
        b.add_segment(vec![
            Document::new("b1").with_int("K", 1).with_str("name", "zebra"),
            Document::new("b1dup").with_int("K", 1).with_str("name", "aardvark"),
        ]);
        (a, b)
    }

    #[test]
    fn test_table_keeps_first_doc_per_key() {
        let (_, b) = cores();
        let keys = Arc::new(JoinKeyCache::new());
        let table = run_serial(
            &Snapshot::of(&b),
            &Query::All,
            &JoinSortCollector::new("K", keys),
        );
        assert_eq!(table.doc_for(3), Some(0));
        assert_eq!(table.doc_for(1), Some(1));
        assert_eq!(table.doc_for(2), None);
        assert_eq!(table.doc_for(1_000), None);
    }

    #[test]
    fn test_key_beyond_table_limit_fails_search() {
        let b = MemoryCore::new("b");
        b.add_segment(vec![Document::new("b1").with_int("K", 1)]);
        b.add_segment(vec![Document::new("b2").with_int("K", 10_000_000_000)]);
        let coordinator = SearchCoordinator::new("b", 2).unwrap();
        let collector = JoinSortCollector::new("K", Arc::new(JoinKeyCache::new()));
        let result = coordinator.search(&Snapshot::of(&b), &Query::All, &collector);
        assert!(matches!(result, Err(Error::CapacityInvariant(_))));
        assert!(matches!(
            JoinDocTable::default().record(MAX_SORT_KEY + 1, 0),
            Err(Error::CapacityInvariant(_))
        ));
    }

    #[test]
    fn test_sort_by_other_core_string_last() {
        let (a, b) = cores();
        let keys = Arc::new(JoinKeyCache::new());
        let other = Arc::new(Snapshot::of(&b));
        let table = Arc::new(run_serial(
            &other,
            &Query::All,
            &JoinSortCollector::new("K", Arc::clone(&keys)),
        ));

        for (order_desc, expected) in [(false, ["a3", "a1"]), (true, ["a1", "a3"])] {
            let mut field = SortField::new("name", ValueType::String)
                .on_core("b")
                .missing(MissingValue::StringLast);
            if order_desc {
                field = field.desc();
            }
            let clause = joined_clause(
                &field,
                "K",
                Arc::clone(&keys),
                Arc::clone(&table),
                Arc::clone(&other),
            )
            .unwrap();
            let snapshot = Snapshot::of(&a);
            let hits = run_serial(&snapshot, &Query::All, &TopFieldCollector::new(vec![clause], 10));
            let ids: Vec<String> = hits
                .iter()
                .map(|h| snapshot.stored(h.doc).unwrap().id)
                .collect();
            // a2 and a4 have no counterpart on b and stay last in doc order
            assert_eq!(ids, vec![expected[0], expected[1], "a2", "a4"]);
        }
    }

    #[test]
    fn test_score_cannot_be_joined() {
        let (_, b) = cores();
        let result = joined_clause(
            &SortField::score().on_core("b"),
            "K",
            Arc::new(JoinKeyCache::new()),
            Arc::new(JoinDocTable::default()),
            Arc::new(Snapshot::of(&b)),
        );
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }
}
