//! Cross-core machinery: key sets, their caches and the collectors that
//! carry scores and sort values from one core to another.

pub mod algebra;
pub mod bitset;
pub mod cache;
pub mod keys;
pub mod score;
pub mod sort;

pub use algebra::{KeySource, RelationalExpr};
pub use bitset::{KeyBitSet, KeySet, MAX_KEY, MAX_TABLE_BYTES};
pub use cache::{JoinCaches, JoinKeyCache, KeyBitSetCache, WeakSegmentMap};
pub use keys::JoinKeyCollector;
pub use score::{AggregateScoreCollector, MAX_SCORE_KEY, RankScores, ScoreCollector, ScoreTable, blend, effective_ratio};
pub use sort::{JoinDocTable, JoinSortCollector, JoinedComparator, MAX_SORT_KEY, joined_clause};
