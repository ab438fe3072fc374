//! Boundary with the underlying full-text engine.
//!
//! An [`IndexCore`] exposes its current generation as a list of immutable
//! [`Segment`]s. A federated call takes one [`Snapshot`] per core and uses it
//! for the whole plan, so every phase sees the same generation.

use crate::error::{Error, Result};
use crate::index::types::{DocId, JoinKey, Score, StoredDocument, Value};
use crate::query::Query;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Token owned by a segment generation. Caches hold only weak references.
#[derive(Debug)]
pub struct IdentityToken {
    id: u64,
}

/// Opaque handle for the immutable portion of one segment.
///
/// A new identity must be issued whenever the visible document set of a
/// segment changes (merge, delete). Cached per-segment data keyed by the old
/// identity becomes unreachable once the last reader drops it.
#[derive(Clone)]
pub struct SegmentIdentity(Arc<IdentityToken>);

impl SegmentIdentity {
    pub fn new() -> Self {
        Self(Arc::new(IdentityToken {
            id: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub(crate) fn downgrade(&self) -> Weak<IdentityToken> {
        Arc::downgrade(&self.0)
    }
}

impl Default for SegmentIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for SegmentIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for SegmentIdentity {}

impl fmt::Debug for SegmentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentIdentity({})", self.0.id)
    }
}

/// One immutable, independently searchable slice of a core.
///
/// Document ids passed in and out are segment-local (`0..max_doc`).
pub trait Segment: Send + Sync {
    fn identity(&self) -> &SegmentIdentity;

    /// Upper bound (exclusive) of local doc ids, deleted documents included.
    fn max_doc(&self) -> u32;

    /// Number of live documents. Used to balance work across threads.
    fn num_docs(&self) -> u32;

    /// Join key stored in `field` for `doc`; `0` when absent.
    fn join_key(&self, field: &str, doc: DocId) -> Result<JoinKey>;

    /// Every doc's join key for `field`, indexed by local doc id.
    fn join_keys(&self, field: &str) -> Result<Vec<JoinKey>> {
        (0..self.max_doc())
            .map(|doc| self.join_key(field, doc))
            .collect()
    }

    /// Stored value of `field` for `doc`
    fn value(&self, field: &str, doc: DocId) -> Result<Option<Value>>;

    /// Identifier and stored fields of `doc`
    fn stored(&self, doc: DocId) -> Result<StoredDocument>;

    /// Visit every live document matching `query`. Visit order is unspecified.
    ///
    /// When `needs_scores` is false the engine may skip scoring and report `0.0`.
    fn search(
        &self,
        query: &Query,
        needs_scores: bool,
        visit: &mut dyn FnMut(DocId, Score) -> Result<()>,
    ) -> Result<()>;
}

/// A single full-text index.
pub trait IndexCore: Send + Sync {
    fn name(&self) -> &str;

    /// Current generation, in segment order.
    fn segments(&self) -> Vec<Arc<dyn Segment>>;
}

/// A segment positioned inside one snapshot.
#[derive(Clone)]
pub struct SegmentHandle {
    /// Position of the segment in its snapshot
    pub ord: usize,
    /// Absolute id of the segment's local doc 0
    pub base: DocId,
    segment: Arc<dyn Segment>,
}

impl SegmentHandle {
    pub fn reader(&self) -> &dyn Segment {
        self.segment.as_ref()
    }

    pub fn identity(&self) -> &SegmentIdentity {
        self.segment.identity()
    }

    pub fn max_doc(&self) -> u32 {
        self.segment.max_doc()
    }

    pub fn num_docs(&self) -> u32 {
        self.segment.num_docs()
    }
}

/// One fixed generation of a core.
#[derive(Clone)]
pub struct Snapshot {
    core: String,
    segments: Vec<SegmentHandle>,
}

impl Snapshot {
    pub fn of(core: &dyn IndexCore) -> Self {
        Self::from_segments(core.name(), core.segments())
    }

    pub fn from_segments(core: impl Into<String>, segments: Vec<Arc<dyn Segment>>) -> Self {
        let mut base: DocId = 0;
        let segments = segments
            .into_iter()
            .enumerate()
            .map(|(ord, segment)| {
                let handle = SegmentHandle { ord, base, segment };
                base += handle.max_doc();
                handle
            })
            .collect();
        Self {
            core: core.into(),
            segments,
        }
    }

    pub fn core(&self) -> &str {
        &self.core
    }

    pub fn segments(&self) -> &[SegmentHandle] {
        &self.segments
    }

    pub fn num_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.num_docs() as u64).sum()
    }

    /// Resolve an absolute doc id to its segment and local id
    pub fn locate(&self, doc: DocId) -> Option<(&SegmentHandle, DocId)> {
        let idx = self
            .segments
            .partition_point(|s| s.base <= doc)
            .checked_sub(1)?;
        let segment = &self.segments[idx];
        let local = doc - segment.base;
        (local < segment.max_doc()).then_some((segment, local))
    }

    pub fn stored(&self, doc: DocId) -> Result<StoredDocument> {
        let (segment, local) = self.locate(doc).ok_or_else(|| {
            Error::segment(&self.core, format!("doc {} is outside the snapshot", doc))
        })?;
        segment.reader().stored(local)
    }
}
