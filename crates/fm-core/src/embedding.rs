//! Hashing embedder and vector helpers.
//!
//! Fragments may arrive with an embedding from the ingestion collaborator.
//! When they don't, the engine derives one by signed feature hashing of the
//! token stream, which is deterministic across runs and platforms.

use serde::{Deserialize, Serialize};

use crate::tokenizer::tokenize;

/// FNV-1a, 64-bit. Stable across platforms, unlike `DefaultHasher`.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Embedder {
    pub dims: usize,
}

impl Embedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    /// Unit-length embedding of `text`. Empty text yields the zero vector.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut v = vec![0.0f32; self.dims];
        for token in &tokens {
            let h = fnv1a(token.as_bytes());
            let idx = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        // Adjacent pairs carry a little word-order signal at half weight
        for pair in tokens.windows(2) {
            let h = fnv1a(format!("{} {}", pair[0], pair[1]).as_bytes());
            let idx = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 0.5 } else { -0.5 };
            v[idx] += sign;
        }
        normalize(&mut v);
        v
    }
}

/// Scale to unit length in place. Zero vectors are left alone.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity in [-1, 1]. Mismatched or zero vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= f64::EPSILON || nb <= f64::EPSILON {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}

/// Weighted mean of vectors. Returns None when there is nothing to average.
pub fn weighted_centroid<'a>(
    vectors: impl IntoIterator<Item = (&'a [f32], f64)>,
    dims: usize,
) -> Option<Vec<f32>> {
    let mut sum = vec![0.0f64; dims];
    let mut total = 0.0f64;
    for (v, w) in vectors {
        if v.len() != dims || w <= 0.0 {
            continue;
        }
        for (s, x) in sum.iter_mut().zip(v) {
            *s += f64::from(*x) * w;
        }
        total += w;
    }
    if total <= f64::EPSILON {
        return None;
    }
    Some(sum.into_iter().map(|s| (s / total) as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_is_unit_length() {
        let e = Embedder::new(32);
        let v = e.embed("the quick brown fox");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_embed_deterministic() {
        let e = Embedder::new(64);
        assert_eq!(e.embed("same text"), e.embed("same text"));
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let e = Embedder::new(64);
        let a = e.embed("rivers carve canyons through ancient sandstone");
        let b = e.embed("rivers carve canyons through old sandstone");
        let c = e.embed("compilers lower syntax trees into bytecode");
        assert!(cosine(&a, &b) > cosine(&a, &c));
    }

    #[test]
    fn test_empty_text_is_zero() {
        let e = Embedder::new(8);
        assert!(e.embed("").iter().all(|x| *x == 0.0));
        assert_eq!(cosine(&e.embed(""), &e.embed("word")), 0.0);
    }

    #[test]
    fn test_weighted_centroid() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let c = weighted_centroid([(&a[..], 1.0), (&b[..], 3.0)], 2).unwrap();
        assert!((c[0] - 0.25).abs() < 1e-6);
        assert!((c[1] - 0.75).abs() < 1e-6);
        assert!(weighted_centroid(std::iter::empty(), 2).is_none());
    }

    #[test]
    fn test_fnv_known_value() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
    }
}
