//! Growable bitmaps over join-key space.
//!
//! A [`KeyBitSet`] only ever grows (×1.25 per step). A [`KeySet`] pairs a
//! bitset with an `inverted` flag meaning "every key except these", which
//! lets NOT stay lazy until two sets are combined.

use crate::error::{Error, Result};
use crate::index::types::{JoinKey, NO_KEY};
use crate::utils::grown_len;
use serde::ser::{Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Upper bound on the memory one key-indexed table may grow to.
pub const MAX_TABLE_BYTES: u64 = 1 << 31;

/// Largest key a bitset will grow to hold (2 GiB of bits).
pub const MAX_KEY: JoinKey = MAX_TABLE_BYTES * 8 - 1;

/// Largest key a table storing `width` bytes per key may hold.
pub const fn max_key_for(width: u64) -> JoinKey {
    MAX_TABLE_BYTES / width - 1
}

#[derive(Clone, Default)]
pub struct KeyBitSet {
    words: Vec<u64>,
}

impl KeyBitSet {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Create a bitset able to hold keys `0..bits` without growing.
    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    /// Build from keys; `NO_KEY` entries are ignored.
    pub fn from_keys(keys: impl IntoIterator<Item = JoinKey>) -> Result<Self> {
        let mut set = Self::new();
        for key in keys {
            set.insert(key)?;
        }
        Ok(set)
    }

    /// Capacity in bits. Never decreases.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len() * 64
    }

    /// Grow geometrically until `bits` fit.
    pub fn ensure_capacity(&mut self, bits: usize) {
        let needed = bits.div_ceil(64);
        if needed > self.words.len() {
            let len = grown_len(self.words.len(), needed);
            self.words.resize(len, 0);
        }
    }

    #[inline]
    fn set(&mut self, key: JoinKey) {
        let idx = key as usize;
        self.ensure_capacity(idx + 1);
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    /// Insert a key. Returns whether it was newly added.
    pub fn insert(&mut self, key: JoinKey) -> Result<bool> {
        if key == NO_KEY {
            return Ok(false);
        }
        if key > MAX_KEY {
            return Err(Error::CapacityInvariant(format!(
                "key {} exceeds the maximum of {}",
                key, MAX_KEY
            )));
        }
        let added = !self.contains(key);
        self.set(key);
        Ok(added)
    }

    #[inline]
    pub fn contains(&self, key: JoinKey) -> bool {
        let idx = key as usize;
        self.words
            .get(idx / 64)
            .is_some_and(|w| w & (1u64 << (idx % 64)) != 0)
    }

    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Set keys in ascending order
    pub fn iter(&self) -> impl Iterator<Item = JoinKey> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as u64;
                w &= w - 1;
                Some(i as u64 * 64 + bit)
            })
        })
    }

    /// `self |= other`, growing to `other`'s width first.
    pub fn union_with(&mut self, other: &KeyBitSet) {
        self.ensure_capacity(other.capacity());
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= b;
        }
    }

    /// `self &= other`
    pub fn intersect_with(&mut self, other: &KeyBitSet) {
        for (i, a) in self.words.iter_mut().enumerate() {
            *a &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    /// `self &= !other`
    pub fn and_not(&mut self, other: &KeyBitSet) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= !b;
        }
    }

    /// Complement every bit within the current capacity. Key 0 stays clear.
    pub fn flip_all(&mut self) {
        for w in self.words.iter_mut() {
            *w = !*w;
        }
        if let Some(first) = self.words.first_mut() {
            *first &= !1;
        }
    }

    fn significant_words(&self) -> &[u64] {
        let len = self
            .words
            .iter()
            .rposition(|&w| w != 0)
            .map_or(0, |i| i + 1);
        &self.words[..len]
    }
}

impl PartialEq for KeyBitSet {
    fn eq(&self, other: &Self) -> bool {
        self.significant_words() == other.significant_words()
    }
}

impl Eq for KeyBitSet {}

impl Hash for KeyBitSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_words().hash(state);
    }
}

impl fmt::Debug for KeyBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().take(32)).finish()?;
        if self.cardinality() > 32 {
            write!(f, " (+{} more)", self.cardinality() - 32)?;
        }
        Ok(())
    }
}

impl Serialize for KeyBitSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// A key bitset, optionally standing for its complement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeySet {
    pub bits: KeyBitSet,
    pub inverted: bool,
}

impl KeySet {
    pub fn new(bits: KeyBitSet) -> Self {
        Self {
            bits,
            inverted: false,
        }
    }

    pub fn inverted(bits: KeyBitSet) -> Self {
        Self {
            bits,
            inverted: true,
        }
    }

    /// Toggle the complement flag without touching the bits.
    pub fn negate(mut self) -> Self {
        self.inverted = !self.inverted;
        self
    }

    /// Membership under the complement flag. Key 0 belongs only to inverted sets.
    #[inline]
    pub fn contains(&self, key: JoinKey) -> bool {
        self.bits.contains(key) != self.inverted
    }

    /// Intersect two sets into a non-inverted set.
    ///
    /// The left bitset is grown to the right's width, then exactly one
    /// operation is chosen by the pair of flags:
    ///
    /// | left | right | operation |
    /// |------|-------|-----------|
    /// | +    | +     | `and` |
    /// | +    | ¬     | `and_not` |
    /// | ¬    | +     | flip left, then `and` |
    /// | ¬    | ¬     | flip left, then `and_not` |
    ///
    /// A flip is bounded by the grown width: when both sides are inverted,
    /// keys beyond the wider of the two bitsets are not represented.
    pub fn intersect(self, right: &KeySet) -> KeySet {
        let mut bits = self.bits;
        bits.ensure_capacity(right.bits.capacity());
        match (self.inverted, right.inverted) {
            (false, false) => bits.intersect_with(&right.bits),
            (false, true) => bits.and_not(&right.bits),
            (true, false) => {
                bits.flip_all();
                bits.intersect_with(&right.bits);
            }
            (true, true) => {
                bits.flip_all();
                bits.and_not(&right.bits);
            }
        }
        KeySet::new(bits)
    }

    /// Intersection that stays a complement when both sides are.
    ///
    /// Same as [`KeySet::intersect`] except for two inverted sets, where
    /// `¬A ∩ ¬B = ¬(A ∪ B)` is exact and unbounded.
    pub fn meet(self, right: &KeySet) -> KeySet {
        if self.inverted && right.inverted {
            let mut bits = self.bits;
            bits.union_with(&right.bits);
            KeySet::inverted(bits)
        } else {
            self.intersect(right)
        }
    }

    /// Union two sets without materializing a complement.
    ///
    /// Plain sets union directly. When either side is inverted the result is
    /// inverted and De Morgan keeps it exact: `A ∪ ¬B = ¬(B \ A)` and
    /// `¬A ∪ ¬B = ¬(A ∩ B)`.
    pub fn union(self, right: &KeySet) -> KeySet {
        let mut bits = self.bits;
        match (self.inverted, right.inverted) {
            (false, false) => {
                bits.union_with(&right.bits);
                KeySet::new(bits)
            }
            (false, true) => {
                let mut out = right.bits.clone();
                out.and_not(&bits);
                KeySet::inverted(out)
            }
            (true, false) => {
                bits.and_not(&right.bits);
                KeySet::inverted(bits)
            }
            (true, true) => {
                bits.intersect_with(&right.bits);
                KeySet::inverted(bits)
            }
        }
    }
}
