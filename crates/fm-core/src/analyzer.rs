//! Compression analysis: entropy, structural depth and repetition density,
//! mapped onto a fidelity tier and a recommended compression scheme.
//!
//! Repetition is measured against the fragment itself and against a corpus
//! index of shingles from everything ingested so far, so a near-duplicate of
//! stored content scores as highly repetitive even when it is internally
//! varied.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::AnalyzerConfig;
use crate::embedding::fnv1a;
use crate::error::AnalysisError;
use crate::fragment::{ContentType, FidelityTier, FragmentId, MemoryFragment};
use crate::tokenizer::tokenize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionScheme {
    /// Stored as-is (possibly still delta-encoded if a motif happens to match).
    #[default]
    Literal,
    /// Reference to a stored motif plus a minimal delta.
    MotifDelta,
    /// Deeply nested content, expanded recursively.
    Fractal,
    /// Too little information to be worth more than a summary.
    Summary,
}

impl CompressionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Literal => "literal",
            Self::MotifDelta => "motif-delta",
            Self::Fractal => "fractal",
            Self::Summary => "summary",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "motif-delta" => Self::MotifDelta,
            "fractal" => Self::Fractal,
            "summary" => Self::Summary,
            _ => Self::Literal,
        }
    }
}

/// Per-fragment scores. One per fragment, replaced on recompute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressionProfile {
    pub fragment_id: FragmentId,
    /// Shannon entropy of the token distribution, normalized to [0, 1].
    pub entropy: f64,
    /// Raw nesting depth of the content's logical structure.
    pub structural_depth: usize,
    /// `depth / (depth + 2)`, in [0, 1).
    pub depth_score: f64,
    /// Fraction of shingles seen before, in [0, 1].
    pub repetition_density: f64,
    pub token_count: usize,
    pub tier: FidelityTier,
    pub scheme: CompressionScheme,
    pub analyzed_at: u64,
}

impl CompressionProfile {
    /// The safe default used when analysis fails.
    pub fn lossless_fallback(fragment_id: FragmentId, now: u64) -> Self {
        Self {
            fragment_id,
            entropy: 1.0,
            structural_depth: 0,
            depth_score: 0.0,
            repetition_density: 0.0,
            token_count: 0,
            tier: FidelityTier::Lossless,
            scheme: CompressionScheme::Literal,
            analyzed_at: now,
        }
    }
}

/// Counts of hashed shingles across the stored corpus.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShingleIndex {
    counts: HashMap<u64, u32>,
}

impl ShingleIndex {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    fn count(&self, h: u64) -> u32 {
        self.counts.get(&h).copied().unwrap_or(0)
    }

    fn add(&mut self, hashes: &[u64]) {
        for h in hashes {
            *self.counts.entry(*h).or_default() += 1;
        }
    }
}

fn shingle_hashes(tokens: &[String], width: usize) -> Vec<u64> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let width = width.min(tokens.len());
    tokens
        .windows(width)
        .map(|w| fnv1a(w.join("\u{1f}").as_bytes()))
        .collect()
}

/// Normalized Shannon entropy of the token distribution.
/// Also returns total information in bits (per-token entropy × count).
fn token_entropy(tokens: &[String]) -> (f64, f64) {
    let n = tokens.len();
    if n < 2 {
        return (0.0, 0.0);
    }
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for t in tokens {
        *freq.entry(t.as_str()).or_default() += 1;
    }
    let h: f64 = freq
        .values()
        .map(|&c| {
            let p = c as f64 / n as f64;
            -p * p.log2()
        })
        .sum();
    let normalized = (h / (n as f64).log2()).clamp(0.0, 1.0);
    (normalized, h * n as f64)
}

fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        serde_json::Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Deepest of: bracket nesting, indentation/list nesting, markdown headings.
fn text_depth(text: &str) -> usize {
    let mut bracket = 0usize;
    let mut max_bracket = 0usize;
    for c in text.chars() {
        match c {
            '(' | '[' | '{' | '<' => {
                bracket += 1;
                max_bracket = max_bracket.max(bracket);
            }
            ')' | ']' | '}' | '>' => bracket = bracket.saturating_sub(1),
            _ => {}
        }
    }

    let mut max_indent = 0usize;
    let mut max_heading = 0usize;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        let leading = &line[..line.len() - trimmed.len()];
        let width: usize = leading.chars().map(|c| if c == '\t' { 4 } else { 1 }).sum();
        let is_item = trimmed.starts_with("- ") || trimmed.starts_with("* ");
        let level = width / 2 + usize::from(is_item);
        max_indent = max_indent.max(level);

        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if hashes > 0 && trimmed[hashes..].starts_with(' ') {
            max_heading = max_heading.max(hashes);
        }
    }

    max_bracket.max(max_indent).max(max_heading)
}

pub struct CompressionAnalyzer {
    config: AnalyzerConfig,
    corpus: RwLock<ShingleIndex>,
}

impl CompressionAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            corpus: RwLock::new(ShingleIndex::default()),
        }
    }

    pub fn with_corpus(config: AnalyzerConfig, corpus: ShingleIndex) -> Self {
        Self {
            config,
            corpus: RwLock::new(corpus),
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn corpus_snapshot(&self) -> ShingleIndex {
        self.corpus.read().clone()
    }

    /// Score a fragment that is not yet part of the corpus.
    pub fn analyze(
        &self,
        fragment: &MemoryFragment,
        now: u64,
    ) -> Result<CompressionProfile, AnalysisError> {
        self.score(fragment, false, now)
    }

    /// Score a fragment whose shingles are already in the corpus, discounting
    /// its own contribution.
    pub fn reanalyze(
        &self,
        fragment: &MemoryFragment,
        now: u64,
    ) -> Result<CompressionProfile, AnalysisError> {
        self.score(fragment, true, now)
    }

    /// Add a fragment's shingles to the corpus.
    pub fn absorb(&self, content: &str) {
        let hashes = shingle_hashes(&tokenize(content), self.config.shingle_width);
        self.corpus.write().add(&hashes);
    }

    fn score(
        &self,
        fragment: &MemoryFragment,
        absorbed: bool,
        now: u64,
    ) -> Result<CompressionProfile, AnalysisError> {
        let cfg = &self.config;

        let structural_depth = match fragment.header.content_type {
            ContentType::Json => {
                if fragment.content.trim().is_empty() {
                    return Err(AnalysisError::Empty);
                }
                let value: serde_json::Value = serde_json::from_str(&fragment.content)
                    .map_err(|e| AnalysisError::Unparseable(e.to_string()))?;
                json_depth(&value)
            }
            ContentType::Text => text_depth(&fragment.content),
        };

        let tokens = tokenize(&fragment.content);
        if tokens.is_empty() {
            return Err(AnalysisError::Empty);
        }

        let (entropy, information_bits) = token_entropy(&tokens);
        let repetition_density = self.repetition(&tokens, absorbed);
        let depth_score = structural_depth as f64 / (structural_depth as f64 + 2.0);

        let tier = if tokens.len() < cfg.min_tokens || information_bits < cfg.information_floor {
            FidelityTier::Degraded
        } else if repetition_density >= cfg.high_repetition
            || (entropy <= cfg.low_entropy && repetition_density >= cfg.low_entropy_repetition)
        {
            FidelityTier::LossySafe
        } else if entropy >= cfg.high_entropy && repetition_density <= cfg.low_repetition {
            FidelityTier::Lossless
        } else {
            FidelityTier::LossyRisky
        };

        let scheme = if tier == FidelityTier::Degraded {
            CompressionScheme::Summary
        } else if structural_depth >= cfg.fractal_depth {
            CompressionScheme::Fractal
        } else if tier == FidelityTier::LossySafe {
            CompressionScheme::MotifDelta
        } else {
            CompressionScheme::Literal
        };

        tracing::debug!(
            fragment = %fragment.header.id,
            entropy,
            repetition_density,
            structural_depth,
            tier = tier.as_str(),
            "analyzed fragment"
        );

        Ok(CompressionProfile {
            fragment_id: fragment.header.id,
            entropy,
            structural_depth,
            depth_score,
            repetition_density,
            token_count: tokens.len(),
            tier,
            scheme,
            analyzed_at: now,
        })
    }

    /// Fraction of shingles already seen earlier in the fragment or elsewhere
    /// in the corpus.
    fn repetition(&self, tokens: &[String], absorbed: bool) -> f64 {
        let hashes = shingle_hashes(tokens, self.config.shingle_width);
        if hashes.is_empty() {
            return 0.0;
        }

        let mut own: HashMap<u64, u32> = HashMap::new();
        for h in &hashes {
            *own.entry(*h).or_default() += 1;
        }

        let corpus = self.corpus.read();
        let mut seen: HashSet<u64> = HashSet::new();
        let mut repeated = 0usize;
        for h in &hashes {
            let elsewhere = if absorbed {
                corpus.count(*h).saturating_sub(own[h])
            } else {
                corpus.count(*h)
            };
            if !seen.insert(*h) || elsewhere > 0 {
                repeated += 1;
            }
        }
        repeated as f64 / hashes.len() as f64
    }
}
