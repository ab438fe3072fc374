use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier for a document; segment-local inside collectors, absolute
/// (segment base + local id) once it leaves a segment.
pub type DocId = u32;

/// Integer relating documents across cores. `0` means "no key".
pub type JoinKey = u64;

/// Relevance score
pub type Score = f32;

/// Join key meaning "this document has no related document"
pub const NO_KEY: JoinKey = 0;

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Double(f64),
    Str(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Double(v) => Some(*v as i64),
            Value::Str(s) => s.parse().ok(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Str(s) => s.parse().ok(),
        }
    }

    /// Interpret the value as a join key. Negative or non-numeric values carry no key.
    pub fn as_join_key(&self) -> JoinKey {
        match self.as_i64() {
            Some(v) if v > 0 => v as JoinKey,
            _ => NO_KEY,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Str(s) => f.write_str(s),
        }
    }
}

/// A document as fed to an index core and as returned by stored-field lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn with_int(self, field: impl Into<String>, value: i64) -> Self {
        self.with(field, Value::Int(value))
    }

    pub fn with_str(self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(field, Value::Str(value.into()))
    }

    pub fn with_double(self, field: impl Into<String>, value: f64) -> Self {
        self.with(field, Value::Double(value))
    }
}

/// Stored fields of one hit
pub type StoredDocument = Document;

/// A matching document with its (possibly blended) score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredDoc {
    /// Absolute document id within one snapshot
    pub doc: DocId,
    pub score: Score,
}

impl ScoredDoc {
    /// Relevance order: score descending, then doc id ascending.
    pub fn relevance_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.doc.cmp(&other.doc))
    }
}
