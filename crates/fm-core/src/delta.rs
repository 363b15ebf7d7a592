//! Byte-exact deltas between two texts.
//!
//! Texts are compared as sequences of lossless segments (a word plus its
//! trailing whitespace). Matched runs become `Copy` ranges into the base,
//! everything else is carried as `Insert` text, so `apply(base, diff(base,
//! target)) == target` for any pair of strings.

use serde::{Deserialize, Serialize};

use crate::constants::{COPY_OP_COST, MAX_LCS_CELLS};
use crate::tokenizer::segments;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOp {
    /// Copy `len` bytes of the base starting at `offset`.
    Copy { offset: usize, len: usize },
    Insert(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<DeltaOp>,
}

/// The delta does not fit the base it was applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaMismatch {
    pub offset: usize,
    pub len: usize,
    pub base_len: usize,
}

impl std::fmt::Display for DeltaMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "copy {}..{} out of range for base of {} bytes",
            self.offset,
            self.offset + self.len,
            self.base_len
        )
    }
}

impl std::error::Error for DeltaMismatch {}

impl Delta {
    pub fn diff(base: &str, target: &str) -> Self {
        let a = segments(base);
        let b = segments(target);
        let pairs = lcs_pairs(&a, &b);

        let mut base_offsets = Vec::with_capacity(a.len());
        let mut off = 0;
        for seg in &a {
            base_offsets.push(off);
            off += seg.len();
        }

        let mut matched: Vec<Option<usize>> = vec![None; b.len()];
        for (i, j) in pairs {
            matched[j] = Some(i);
        }

        let mut ops: Vec<DeltaOp> = Vec::new();
        for (j, seg) in b.iter().enumerate() {
            match matched[j] {
                Some(i) => {
                    let start = base_offsets[i];
                    if let Some(DeltaOp::Copy { offset, len }) = ops.last_mut()
                        && *offset + *len == start
                    {
                        *len += seg.len();
                        continue;
                    }
                    ops.push(DeltaOp::Copy {
                        offset: start,
                        len: seg.len(),
                    });
                }
                None => {
                    if let Some(DeltaOp::Insert(text)) = ops.last_mut() {
                        text.push_str(seg);
                        continue;
                    }
                    ops.push(DeltaOp::Insert((*seg).to_string()));
                }
            }
        }

        Self { ops }
    }

    pub fn apply(&self, base: &str) -> Result<String, DeltaMismatch> {
        let mut out = String::with_capacity(base.len());
        for op in &self.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    let end = offset + len;
                    let slice = base.get(*offset..end).ok_or(DeltaMismatch {
                        offset: *offset,
                        len: *len,
                        base_len: base.len(),
                    })?;
                    out.push_str(slice);
                }
                DeltaOp::Insert(text) => out.push_str(text),
            }
        }
        Ok(out)
    }

    /// Approximate storage cost: inserted bytes plus a fixed cost per copy.
    pub fn stored_bytes(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Copy { .. } => COPY_OP_COST,
                DeltaOp::Insert(text) => text.len(),
            })
            .sum()
    }

    /// All inserted text, space-joined. Used for approximate replays where
    /// the base is not expanded.
    pub fn inserted_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DeltaOp::Insert(text) => Some(text.trim()),
                DeltaOp::Copy { .. } => None,
            })
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Dice similarity of two texts' segment sequences: `2·LCS / (n + m)`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let sa = segments(a);
    let sb = segments(b);
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let common = lcs_pairs(&sa, &sb).len();
    2.0 * common as f64 / (sa.len() + sb.len()) as f64
}

/// Matched (base index, target index) pairs in increasing order.
/// Common prefix and suffix are matched directly; the middle uses a full LCS
/// table when small enough and is left unmatched otherwise.
fn lcs_pairs(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let n = a.len();
    let m = b.len();

    let mut pre = 0;
    while pre < n && pre < m && a[pre] == b[pre] {
        pre += 1;
    }
    let mut suf = 0;
    while suf < n - pre && suf < m - pre && a[n - 1 - suf] == b[m - 1 - suf] {
        suf += 1;
    }

    let mut pairs: Vec<(usize, usize)> = (0..pre).map(|i| (i, i)).collect();

    let a_mid = &a[pre..n - suf];
    let b_mid = &b[pre..m - suf];
    let (mn, mm) = (a_mid.len(), b_mid.len());

    if mn > 0 && mm > 0 && mn * mm <= MAX_LCS_CELLS {
        let w = mm + 1;
        let mut dp = vec![0u32; (mn + 1) * w];
        for i in (0..mn).rev() {
            for j in (0..mm).rev() {
                dp[i * w + j] = if a_mid[i] == b_mid[j] {
                    dp[(i + 1) * w + j + 1] + 1
                } else {
                    dp[(i + 1) * w + j].max(dp[i * w + j + 1])
                };
            }
        }

        let (mut i, mut j) = (0, 0);
        while i < mn && j < mm {
            if a_mid[i] == b_mid[j] {
                pairs.push((pre + i, pre + j));
                i += 1;
                j += 1;
            } else if dp[(i + 1) * w + j] >= dp[i * w + j + 1] {
                i += 1;
            } else {
                j += 1;
            }
        }
    }

    pairs.extend((0..suf).map(|k| (n - suf + k, m - suf + k)));
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identical_texts_single_copy() {
        let d = Delta::diff("a b c", "a b c");
        assert_eq!(d.ops, vec![DeltaOp::Copy { offset: 0, len: 5 }]);
        assert_eq!(d.stored_bytes(), COPY_OP_COST);
    }

    #[test]
    fn test_single_word_change() {
        let base = "the river runs north to the sea";
        let target = "the river runs south to the sea";
        let d = Delta::diff(base, target);
        assert_eq!(d.apply(base).unwrap(), target);
        assert_eq!(d.inserted_text(), "south");
        assert!(d.stored_bytes() < target.len() / 2);
    }

    #[test]
    fn test_apply_rejects_short_base() {
        let d = Delta::diff("a long base text", "a long base text!");
        assert!(d.apply("a").is_err());
    }

    #[test]
    fn test_unchanged_and_unrelated_targets() {
        let same = Delta::diff("abc def", "abc def");
        assert_eq!(same.apply("abc def").unwrap(), "abc def");
        assert!(same.inserted_text().is_empty());
        let fresh = Delta::diff("", "xyz");
        assert_eq!(fresh.apply("").unwrap(), "xyz");
        assert!(Delta::diff("", "").is_empty());
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("a b", "a b"), 1.0);
        assert_eq!(similarity("a b", "c d"), 0.0);
        let s = similarity("a b c d", "a b c e");
        assert!((s - 0.75).abs() < 1e-12, "got {s}");
    }

    proptest! {
        #[test]
        fn prop_diff_apply_reproduces_target(
            base in "[a-c ]{0,40}",
            target in "[a-c \n]{0,40}",
        ) {
            let d = Delta::diff(&base, &target);
            prop_assert_eq!(d.apply(&base).unwrap(), target);
        }
    }
}
