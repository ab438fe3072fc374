//! Cross-core relevance blending.
//!
//! A [`ScoreCollector`] runs a rank query on another core and records each
//! matching doc's score under its join key as a 2-byte code. The
//! [`AggregateScoreCollector`] then wraps the result core's collector and
//! rewrites every candidate's score before passing it on:
//!
//! ```text
//! blended = (1 - ratio) * base + ratio * Π (1 + other_i)
//! ```

use crate::collector::{Collector, LocalCollector, Visit};
use crate::error::{Error, Result};
use crate::index::segment::SegmentHandle;
use crate::index::types::{DocId, JoinKey, NO_KEY, Score};
use crate::join::bitset::max_key_for;
use crate::join::cache::{JoinKeyCache, KeyColumn};
use crate::utils::{NO_SCORE, decode_score, encode_score, grown_len};
use std::sync::Arc;
use tracing::warn;

/// Blend ratio used when none is configured or the configured one is unusable
pub const DEFAULT_RATIO: f32 = 0.5;

/// Configured ratio when it lies in `[0, 1]`, [`DEFAULT_RATIO`] otherwise.
pub fn effective_ratio(configured: Option<f32>) -> f32 {
    match configured {
        Some(ratio) if (0.0..=1.0).contains(&ratio) => ratio,
        Some(ratio) => {
            warn!(ratio, default = DEFAULT_RATIO, "rank ratio outside [0, 1], using default");
            DEFAULT_RATIO
        }
        None => DEFAULT_RATIO,
    }
}

#[inline]
pub fn blend(base: Score, ratio: f32, others: impl IntoIterator<Item = Score>) -> Score {
    let product: f32 = others.into_iter().map(|s| 1.0 + s).product();
    (1.0 - ratio) * base + ratio * product
}

/// Largest key a [`ScoreTable`] will grow to hold
pub const MAX_SCORE_KEY: JoinKey = max_key_for(size_of::<u16>() as u64);

/// Score codes indexed by join key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreTable {
    codes: Vec<u16>,
}

impl ScoreTable {
    /// Score recorded for `key`; `0.0` when none was
    #[inline]
    pub fn score(&self, key: JoinKey) -> Score {
        self.codes
            .get(key as usize)
            .map_or(0.0, |&code| decode_score(code))
    }

    pub fn contains(&self, key: JoinKey) -> bool {
        self.codes
            .get(key as usize)
            .is_some_and(|&code| code != NO_SCORE)
    }

    /// Record `score` for `key` unless a score is already there
    fn record(&mut self, key: JoinKey, score: Score) -> Result<()> {
        if key > MAX_SCORE_KEY {
            return Err(Error::CapacityInvariant(format!(
                "score key {} exceeds {}",
                key, MAX_SCORE_KEY
            )));
        }
        let idx = key as usize;
        if idx >= self.codes.len() {
            let len = grown_len(self.codes.len(), idx + 1);
            self.codes.resize(len, NO_SCORE);
        }
        if self.codes[idx] == NO_SCORE {
            self.codes[idx] = encode_score(score);
        }
        Ok(())
    }

    /// Fill every slot still empty here from `other`
    fn fill_from(&mut self, other: &ScoreTable) {
        if other.codes.len() > self.codes.len() {
            self.codes.resize(other.codes.len(), NO_SCORE);
        }
        for (mine, &theirs) in self.codes.iter_mut().zip(&other.codes) {
            if *mine == NO_SCORE {
                *mine = theirs;
            }
        }
    }
}

/// Records each matching doc's score under its join key in `field`.
pub struct ScoreCollector {
    field: Arc<str>,
    keys: Arc<JoinKeyCache>,
}

pub struct ScoreLocal {
    field: Arc<str>,
    keys: Arc<JoinKeyCache>,
    column: Option<KeyColumn>,
    table: ScoreTable,
}

impl ScoreCollector {
    pub fn new(field: &str, keys: Arc<JoinKeyCache>) -> Self {
        Self {
            field: Arc::from(field),
            keys,
        }
    }
}

impl Collector for ScoreCollector {
    type Local = ScoreLocal;
    type Partial = ScoreTable;
    type Fruit = ScoreTable;

    fn needs_scores(&self) -> bool {
        true
    }

    fn local(&self) -> Result<ScoreLocal> {
        Ok(ScoreLocal {
            field: Arc::clone(&self.field),
            keys: Arc::clone(&self.keys),
            column: None,
            table: ScoreTable::default(),
        })
    }

    /// First recorded score per key wins, in group order.
    fn merge(&self, partials: Vec<ScoreTable>) -> Result<ScoreTable> {
        let mut merged = ScoreTable::default();
        for partial in &partials {
            merged.fill_from(partial);
        }
        Ok(merged)
    }
}

impl LocalCollector for ScoreLocal {
    type Partial = ScoreTable;

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        self.column = Some(self.keys.column(segment, &self.field)?);
        Ok(Visit::Docs)
    }

    fn collect(&mut self, doc: DocId, score: Score) -> Result<()> {
        let key = self
            .column
            .as_ref()
            .and_then(|c| c.get(doc as usize).copied())
            .unwrap_or(NO_KEY);
        if key != NO_KEY {
            self.table.record(key, score)?;
        }
        Ok(())
    }

    fn complete(self) -> Result<ScoreTable> {
        Ok(self.table)
    }
}

/// Scores of one rank core, looked up through `field` on the result core
#[derive(Debug, Clone)]
pub struct RankScores {
    pub field: String,
    pub table: ScoreTable,
}

/// Rewrites scores with the blended rank-core scores before `inner` sees them.
///
/// With no rank scores attached it is transparent.
pub struct AggregateScoreCollector<C> {
    inner: C,
    ranks: Arc<[RankScores]>,
    ratio: f32,
    keys: Arc<JoinKeyCache>,
}

pub struct AggregateLocal<L> {
    inner: L,
    ranks: Arc<[RankScores]>,
    ratio: f32,
    keys: Arc<JoinKeyCache>,
    columns: Vec<KeyColumn>,
}

impl<C: Collector> AggregateScoreCollector<C> {
    pub fn new(inner: C, ranks: Vec<RankScores>, ratio: f32, keys: Arc<JoinKeyCache>) -> Self {
        Self {
            inner,
            ranks: ranks.into(),
            ratio,
            keys,
        }
    }
}

impl<C: Collector> Collector for AggregateScoreCollector<C> {
    type Local = AggregateLocal<C::Local>;
    type Partial = C::Partial;
    type Fruit = C::Fruit;

    fn needs_scores(&self) -> bool {
        !self.ranks.is_empty() || self.inner.needs_scores()
    }

    fn local(&self) -> Result<Self::Local> {
        Ok(AggregateLocal {
            inner: self.inner.local()?,
            ranks: Arc::clone(&self.ranks),
            ratio: self.ratio,
            keys: Arc::clone(&self.keys),
            columns: Vec::with_capacity(self.ranks.len()),
        })
    }

    fn merge(&self, partials: Vec<C::Partial>) -> Result<C::Fruit> {
        self.inner.merge(partials)
    }
}

impl<L: LocalCollector> LocalCollector for AggregateLocal<L> {
    type Partial = L::Partial;

    fn bind(&mut self, segment: &SegmentHandle) -> Result<Visit> {
        let visit = self.inner.bind(segment)?;
        if visit == Visit::Docs {
            self.columns = self
                .ranks
                .iter()
                .map(|rank| self.keys.column(segment, &rank.field))
                .collect::<Result<_>>()?;
        }
        Ok(visit)
    }

    fn collect(&mut self, doc: DocId, score: Score) -> Result<()> {
        if self.ranks.is_empty() {
            return self.inner.collect(doc, score);
        }
        let others = self.ranks.iter().zip(&self.columns).map(|(rank, column)| {
            let key = column.get(doc as usize).copied().unwrap_or(NO_KEY);
            rank.table.score(key)
        });
        let blended = blend(score, self.ratio, others);
        self.inner.collect(doc, blended)
    }

    fn complete_segment(&mut self) -> Result<()> {
        self.inner.complete_segment()
    }

    fn complete(self) -> Result<L::Partial> {
        self.inner.complete()
    }
}
