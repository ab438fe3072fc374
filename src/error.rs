//! Error types for federated execution.
//!
//! Every failure aborts the whole federated call: there is no partial
//! response and no retry.

use thiserror::Error;

/// Errors produced while planning or executing a federated query.
#[derive(Debug, Error)]
pub enum Error {
    /// A match, facet, sort, unite or rank entry names a core that was never registered.
    #[error("unknown core: {0}")]
    UnknownCore(String),

    /// Two cores participate in one query but no `Match` pair relates them.
    #[error("no match relates core '{from}' to core '{to}'")]
    MissingRelation { from: String, to: String },

    /// The composed query is structurally invalid.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A segment of the underlying index failed to answer.
    #[error("segment error in core '{core}': {message}")]
    Segment { core: String, message: String },

    /// A compare-and-swap loop exceeded its retry budget (modeling bug, not contention).
    #[error("compare-and-swap retry budget of {0} exceeded")]
    RetryBudgetExceeded(usize),

    /// A key bitset broke its capacity invariant.
    #[error("bitset capacity invariant violated: {0}")]
    CapacityInvariant(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn segment(core: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Segment {
            core: core.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
