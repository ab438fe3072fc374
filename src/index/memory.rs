//! In-memory reference index core.
//!
//! Documents are grouped in immutable segments with roaring posting lists
//! per (field, term). Deletes and merges never mutate a segment in place:
//! they publish a replacement carrying a fresh [`SegmentIdentity`], so any
//! per-segment cache keyed by the old identity stops matching.

use crate::error::{Error, Result};
use crate::index::segment::{IndexCore, Segment, SegmentIdentity};
use crate::index::types::{DocId, Document, JoinKey, NO_KEY, Score, StoredDocument, Value};
use crate::query::{BoolQuery, Query};
use ahash::AHashMap;
use globset::Glob;
use parking_lot::RwLock;
use regex::Regex;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Immutable document storage shared by every identity of a segment
struct SegmentData {
    docs: Vec<Document>,
    /// field -> term (string form of the value) -> docs
    postings: AHashMap<String, AHashMap<String, RoaringBitmap>>,
}

impl SegmentData {
    fn build(docs: Vec<Document>) -> Self {
        let mut postings: AHashMap<String, AHashMap<String, RoaringBitmap>> = AHashMap::new();
        for (doc_id, doc) in docs.iter().enumerate() {
            for (field, value) in &doc.fields {
                postings
                    .entry(field.clone())
                    .or_default()
                    .entry(value.to_string())
                    .or_default()
                    .insert(doc_id as DocId);
            }
        }
        Self { docs, postings }
    }
}

/// Docs matching one query node, with dense scores when scoring is on
struct Matches {
    docs: RoaringBitmap,
    scores: Vec<Score>,
}

pub struct MemorySegment {
    core: Arc<str>,
    identity: SegmentIdentity,
    data: Arc<SegmentData>,
    deleted: RoaringBitmap,
}

impl MemorySegment {
    fn new(core: Arc<str>, docs: Vec<Document>) -> Self {
        Self {
            core,
            identity: SegmentIdentity::new(),
            data: Arc::new(SegmentData::build(docs)),
            deleted: RoaringBitmap::new(),
        }
    }

    /// Same data with more deletes, under a new identity
    fn with_deleted(&self, deleted: RoaringBitmap) -> Self {
        Self {
            core: Arc::clone(&self.core),
            identity: SegmentIdentity::new(),
            data: Arc::clone(&self.data),
            deleted,
        }
    }

    fn live_docs(&self) -> impl Iterator<Item = &Document> {
        self.data
            .docs
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.deleted.contains(*i as DocId))
            .map(|(_, d)| d)
    }

    fn field(&self, field: &str, doc: DocId) -> Option<&Value> {
        self.data.docs.get(doc as usize)?.fields.get(field)
    }

    fn all_docs(&self) -> RoaringBitmap {
        let mut docs = RoaringBitmap::new();
        docs.insert_range(0..self.max_doc());
        docs
    }

    fn uniform(&self, docs: RoaringBitmap, scored: bool) -> Matches {
        let scores = if scored {
            let mut scores = vec![0.0; self.max_doc() as usize];
            for doc in &docs {
                scores[doc as usize] = 1.0;
            }
            scores
        } else {
            Vec::new()
        };
        Matches { docs, scores }
    }

    fn scan(&self, field: &str, pred: impl Fn(&Value) -> bool) -> RoaringBitmap {
        (0..self.max_doc())
            .filter(|&doc| self.field(field, doc).is_some_and(&pred))
            .collect()
    }

    fn invalid(&self, message: String) -> Error {
        Error::InvalidQuery(format!("{} (core '{}')", message, self.core))
    }

    fn eval(&self, query: &Query, scored: bool) -> Result<Matches> {
        let docs = match query {
            Query::All => self.all_docs(),
            Query::Term { field, value } => self
                .data
                .postings
                .get(field)
                .and_then(|terms| terms.get(value))
                .cloned()
                .unwrap_or_default(),
            Query::Range { field, min, max } => self.scan(field, |v| {
                v.as_i64().is_some_and(|n| {
                    min.is_none_or(|lo| n >= lo) && max.is_none_or(|hi| n <= hi)
                })
            }),
            Query::Exists { field } => self.scan(field, |_| true),
            Query::Wildcard { field, pattern } => {
                let matcher = Glob::new(pattern)
                    .map_err(|e| self.invalid(format!("bad wildcard '{}': {}", pattern, e)))?
                    .compile_matcher();
                self.scan(field, |v| matcher.is_match(v.to_string()))
            }
            Query::Regex { field, pattern } => {
                let re = Regex::new(pattern)
                    .map_err(|e| self.invalid(format!("bad regex '{}': {}", pattern, e)))?;
                self.scan(field, |v| re.is_match(&v.to_string()))
            }
            Query::JoinKeys { field, keys } => (0..self.max_doc())
                .filter(|&doc| keys.contains(self.key_of(field, doc)))
                .collect(),
            Query::Bool(b) => return self.eval_bool(b, scored),
        };
        Ok(self.uniform(docs, scored))
    }

    fn eval_bool(&self, b: &BoolQuery, scored: bool) -> Result<Matches> {
        let must = b
            .must
            .iter()
            .map(|q| self.eval(q, scored))
            .collect::<Result<Vec<_>>>()?;
        let should = b
            .should
            .iter()
            .map(|q| self.eval(q, scored))
            .collect::<Result<Vec<_>>>()?;

        let mut docs: Option<RoaringBitmap> = None;
        for m in &must {
            docs = Some(match docs {
                Some(d) => d & &m.docs,
                None => m.docs.clone(),
            });
        }
        for q in &b.filter {
            let f = self.eval(q, false)?.docs;
            docs = Some(match docs {
                Some(d) => d & f,
                None => f,
            });
        }
        let mut docs = match docs {
            Some(d) => d,
            None if !should.is_empty() => should
                .iter()
                .fold(RoaringBitmap::new(), |acc, m| acc | &m.docs),
            None => self.all_docs(),
        };
        for q in &b.must_not {
            docs -= self.eval(q, false)?.docs;
        }

        let mut scores = Vec::new();
        if scored {
            scores = vec![0.0; self.max_doc() as usize];
            for m in must.iter().chain(&should) {
                for doc in &docs {
                    scores[doc as usize] += m.scores[doc as usize];
                }
            }
        }
        Ok(Matches { docs, scores })
    }

    fn key_of(&self, field: &str, doc: DocId) -> JoinKey {
        self.field(field, doc)
            .map(Value::as_join_key)
            .unwrap_or(NO_KEY)
    }
}

impl Segment for MemorySegment {
    fn identity(&self) -> &SegmentIdentity {
        &self.identity
    }

    fn max_doc(&self) -> u32 {
        self.data.docs.len() as u32
    }

    fn num_docs(&self) -> u32 {
        self.max_doc() - self.deleted.len() as u32
    }

    fn join_key(&self, field: &str, doc: DocId) -> Result<JoinKey> {
        Ok(self.key_of(field, doc))
    }

    fn value(&self, field: &str, doc: DocId) -> Result<Option<Value>> {
        Ok(self.field(field, doc).cloned())
    }

    fn stored(&self, doc: DocId) -> Result<StoredDocument> {
        self.data
            .docs
            .get(doc as usize)
            .cloned()
            .ok_or_else(|| Error::segment(self.core.as_ref(), format!("no stored doc {}", doc)))
    }

    fn search(
        &self,
        query: &Query,
        needs_scores: bool,
        visit: &mut dyn FnMut(DocId, Score) -> Result<()>,
    ) -> Result<()> {
        let Matches { mut docs, scores } = self.eval(query, needs_scores)?;
        docs -= &self.deleted;
        for doc in &docs {
            let score = scores.get(doc as usize).copied().unwrap_or(0.0);
            visit(doc, score)?;
        }
        Ok(())
    }
}

/// A named core holding a list of memory segments.
pub struct MemoryCore {
    name: Arc<str>,
    segments: RwLock<Vec<Arc<MemorySegment>>>,
}

impl MemoryCore {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            segments: RwLock::new(Vec::new()),
        }
    }

    /// Commit `docs` as a new segment
    pub fn add_segment(&self, docs: Vec<Document>) {
        let segment = MemorySegment::new(Arc::clone(&self.name), docs);
        self.segments.write().push(Arc::new(segment));
    }

    /// Delete every live document with this identifier. Returns how many were removed.
    pub fn delete(&self, id: &str) -> usize {
        let mut segments = self.segments.write();
        let mut removed = 0;
        for slot in segments.iter_mut() {
            let hits: Vec<DocId> = slot
                .data
                .docs
                .iter()
                .enumerate()
                .filter(|(i, d)| d.id == id && !slot.deleted.contains(*i as DocId))
                .map(|(i, _)| i as DocId)
                .collect();
            if hits.is_empty() {
                continue;
            }
            removed += hits.len();
            let mut deleted = slot.deleted.clone();
            deleted.extend(hits);
            *slot = Arc::new(slot.with_deleted(deleted));
        }
        removed
    }

    /// Replace every segment by one segment holding all live documents
    pub fn merge_segments(&self) {
        let mut segments = self.segments.write();
        if segments.len() < 2 {
            return;
        }
        let docs: Vec<Document> = segments
            .iter()
            .flat_map(|s| s.live_docs().cloned())
            .collect();
        *segments = vec![Arc::new(MemorySegment::new(Arc::clone(&self.name), docs))];
    }

    pub fn from_fixture(fixture: CoreFixture) -> Self {
        let core = Self::new(&fixture.name);
        for docs in fixture.segments {
            core.add_segment(docs);
        }
        core
    }
}

impl IndexCore for MemoryCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn segments(&self) -> Vec<Arc<dyn Segment>> {
        self.segments
            .read()
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn Segment>)
            .collect()
    }
}

/// JSON description of one core: named, with documents grouped per segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreFixture {
    pub name: String,
    pub segments: Vec<Vec<Document>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub cores: Vec<CoreFixture>,
}

/// Load every core of a JSON fixture file
pub fn load_fixture(path: &Path) -> Result<Vec<MemoryCore>> {
    let file = File::open(path)?;
    let fixture: Fixture = serde_json::from_reader(BufReader::new(file))?;
    Ok(fixture.cores.into_iter().map(MemoryCore::from_fixture).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryCore {
        let core = MemoryCore::new("a");
        core.add_segment(vec![
            Document::new("a1").with_int("K", 1).with_str("color", "red"),
            Document::new("a2").with_int("K", 2).with_str("color", "blue"),
        ]);
        core.add_segment(vec![
            Document::new("a3").with_int("K", 3).with_str("color", "red"),
            Document::new("a4").with_str("color", "green"),
        ]);
        core
    }

    fn ids(core: &MemoryCore, query: &Query) -> Vec<String> {
        let mut out = Vec::new();
        for segment in core.segments() {
            segment
                .search(query, false, &mut |doc, _| {
                    out.push(segment.stored(doc)?.id);
                    Ok(())
                })
                .unwrap();
        }
        out.sort();
        out
    }

    #[test]
    fn test_term_and_range() {
        let core = sample();
        assert_eq!(ids(&core, &Query::term("color", "red")), vec!["a1", "a3"]);
        assert_eq!(ids(&core, &Query::term("K", 2)), vec!["a2"]);
        assert_eq!(ids(&core, &Query::range("K", Some(2), None)), vec!["a2", "a3"]);
        assert_eq!(ids(&core, &Query::exists("K")).len(), 3);
    }

    #[test]
    fn test_bool_clauses() {
        let core = sample();
        let q = Query::Bool(BoolQuery {
            should: vec![Query::term("color", "blue"), Query::term("color", "green")],
            must_not: vec![Query::term("color", "green")],
            ..Default::default()
        });
        assert_eq!(ids(&core, &q), vec!["a2"]);

        let only_not = Query::Bool(BoolQuery {
            must_not: vec![Query::term("color", "red")],
            ..Default::default()
        });
        assert_eq!(ids(&core, &only_not), vec!["a2", "a4"]);
    }

    #[test]
    fn test_wildcard_and_regex() {
        let core = sample();
        let glob = Query::Wildcard {
            field: "color".into(),
            pattern: "gr*".into(),
        };
        assert_eq!(ids(&core, &glob), vec!["a4"]);
        let re = Query::Regex {
            field: "color".into(),
            pattern: "^(red|blue)$".into(),
        };
        assert_eq!(ids(&core, &re), vec!["a1", "a2", "a3"]);

        let bad = Query::Regex {
            field: "color".into(),
            pattern: "(".into(),
        };
        let segment = &core.segments()[0];
        assert!(matches!(
            segment.search(&bad, false, &mut |_, _| Ok(())),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_scores_sum_scoring_clauses() {
        let core = sample();
        let q = Query::Bool(BoolQuery {
            must: vec![Query::term("color", "red")],
            should: vec![Query::term("K", 3)],
            ..Default::default()
        });
        let mut scores = Vec::new();
        for segment in core.segments() {
            segment
                .search(&q, true, &mut |doc, score| {
                    scores.push((segment.stored(doc)?.id, score));
                    Ok(())
                })
                .unwrap();
        }
        scores.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(scores, vec![("a1".to_string(), 1.0), ("a3".to_string(), 2.0)]);
    }

    #[test]
    fn test_delete_reissues_identity() {
        let core = sample();
        let before: Vec<u64> = core.segments().iter().map(|s| s.identity().id()).collect();
        assert_eq!(core.delete("a3"), 1);
        assert_eq!(core.delete("a3"), 0);
        let after: Vec<u64> = core.segments().iter().map(|s| s.identity().id()).collect();
        assert_eq!(before[0], after[0]);
        assert_ne!(before[1], after[1]);
        assert_eq!(ids(&core, &Query::All), vec!["a1", "a2", "a4"]);
        assert_eq!(core.segments()[1].num_docs(), 1);
    }

    #[test]
    fn test_merge_keeps_live_docs() {
        let core = sample();
        core.delete("a1");
        core.merge_segments();
        let segments = core.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].max_doc(), 3);
        assert_eq!(ids(&core, &Query::All), vec!["a2", "a3", "a4"]);
    }

    #[test]
    fn test_fixture_round_trip() {
        let json = r#"{"cores":[{"name":"b","segments":[[{"id":"b1","fields":{"K":2}}]]}]}"#;
        let fixture: Fixture = serde_json::from_str(json).unwrap();
        let core = MemoryCore::from_fixture(fixture.cores[0].clone());
        assert_eq!(core.name(), "b");
        assert_eq!(core.segments()[0].join_key("K", 0).unwrap(), 2);
    }
}
