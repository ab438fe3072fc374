/// Fixed-point resolution of a score code (1/256).
pub const SCORE_SCALE: f32 = 256.0;

/// Code reserved for "no score recorded".
pub const NO_SCORE: u16 = 0;

/// Growth factor for key-indexed arrays and bitsets (×1.25).
const GROWTH_NUM: usize = 5;
const GROWTH_DEN: usize = 4;

/// Compress a relevance score into a 2-byte fixed-point code.
///
/// Code 0 is reserved for absence, so a present score always encodes to at
/// least 1. Negative and NaN scores clamp to zero, large scores saturate.
#[inline]
pub fn encode_score(score: f32) -> u16 {
    let scaled = if score.is_nan() || score <= 0.0 {
        0.0
    } else {
        (score * SCORE_SCALE).round()
    };
    let max = (u16::MAX - 1) as f32;
    1 + scaled.min(max) as u16
}

/// Expand a score code back into a score; [`NO_SCORE`] decodes to `0.0`.
#[inline]
pub fn decode_score(code: u16) -> f32 {
    if code == NO_SCORE {
        0.0
    } else {
        (code - 1) as f32 / SCORE_SCALE
    }
}

/// Length to grow a key-indexed buffer to so that `needed` slots fit.
///
/// Capacity grows geometrically so repeated single-key growth is amortized.
#[inline]
pub fn grown_len(current: usize, needed: usize) -> usize {
    if needed <= current {
        return current;
    }
    needed.max(current * GROWTH_NUM / GROWTH_DEN)
}
