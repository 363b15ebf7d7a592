use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::INITIAL_FIDELITY;
use crate::hierarchy::ClusterId;
use crate::observer::LayerState;

pub type FragmentId = Uuid;

/// Coarse classification of how much information loss a fragment's stored
/// representation tolerates. Ordered from most to least faithful.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum FidelityTier {
    #[default]
    Lossless,
    LossySafe,
    LossyRisky,
    Degraded,
}

impl FidelityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lossless => "lossless",
            Self::LossySafe => "lossy-safe",
            Self::LossyRisky => "lossy-risky",
            Self::Degraded => "degraded",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "lossy-safe" => Self::LossySafe,
            "lossy-risky" => Self::LossyRisky,
            "degraded" => Self::Degraded,
            _ => Self::Lossless,
        }
    }

    /// Whether stored content must reproduce the input byte-for-byte.
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Lossless)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Json,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Everything the engine keeps about a fragment besides its content.
/// Content lives in the motif arena and is reconstructed on decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentHeader {
    pub id: FragmentId,
    pub content_type: ContentType,
    pub embedding: Vec<f32>,
    pub created_at: u64,
    pub tier: FidelityTier,
    /// Continuous fidelity in [0, 1], mutated by observation and decay.
    pub fidelity: f64,
    pub compression_ratio: f64,
    pub cluster: Option<ClusterId>,
    #[serde(default)]
    pub label: Option<String>,
    pub last_accessed: u64,
    /// Time decay was last applied; fidelity decays from here.
    #[serde(default)]
    pub decayed_at: u64,
    #[serde(default)]
    pub layer_state: LayerState,
    /// Short summary used by surface views and degraded reads.
    #[serde(default)]
    pub summary: String,
}

impl FragmentHeader {
    pub fn new(content_type: ContentType, embedding: Vec<f32>, created_at: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_type,
            embedding,
            created_at,
            tier: FidelityTier::default(),
            fidelity: INITIAL_FIDELITY,
            compression_ratio: 1.0,
            cluster: None,
            label: None,
            last_accessed: created_at,
            decayed_at: created_at,
            layer_state: LayerState::default(),
            summary: String::new(),
        }
    }

    /// Set fidelity, clamped to [0, 1]. Returns the applied delta.
    pub fn set_fidelity(&mut self, fidelity: f64) -> f64 {
        let clamped = if fidelity.is_nan() { 0.0 } else { fidelity.clamp(0.0, 1.0) };
        let delta = clamped - self.fidelity;
        self.fidelity = clamped;
        delta
    }
}

/// A stored memory fragment with its content materialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryFragment {
    pub header: FragmentHeader,
    pub content: String,
}

impl MemoryFragment {
    pub fn new(content: impl Into<String>, content_type: ContentType, embedding: Vec<f32>, now: u64) -> Self {
        Self {
            header: FragmentHeader::new(content_type, embedding, now),
            content: content.into(),
        }
    }

    pub fn id(&self) -> FragmentId {
        self.header.id
    }

    pub fn tier(&self) -> FidelityTier {
        self.header.tier
    }

    pub fn fidelity(&self) -> f64 {
        self.header.fidelity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_string_roundtrip() {
        for tier in [
            FidelityTier::Lossless,
            FidelityTier::LossySafe,
            FidelityTier::LossyRisky,
            FidelityTier::Degraded,
        ] {
            assert_eq!(FidelityTier::from_str_lossy(tier.as_str()), tier);
        }
        assert_eq!(FidelityTier::from_str_lossy("garbage"), FidelityTier::Lossless);
    }

    #[test]
    fn test_tier_serde_kebab_case() {
        let json = serde_json::to_string(&FidelityTier::LossySafe).unwrap();
        assert_eq!(json, "\"lossy-safe\"");
    }

    #[test]
    fn test_tier_ordering() {
        assert!(FidelityTier::Lossless < FidelityTier::Degraded);
        assert!(FidelityTier::Lossless.is_exact());
        assert!(!FidelityTier::LossySafe.is_exact());
    }

    #[test]
    fn test_set_fidelity_clamps() {
        let mut h = FragmentHeader::new(ContentType::Text, vec![], 0);
        let d = h.set_fidelity(1.7);
        assert_eq!(h.fidelity, 1.0);
        assert!((d - (1.0 - INITIAL_FIDELITY)).abs() < 1e-12);
        h.set_fidelity(-3.0);
        assert_eq!(h.fidelity, 0.0);
        h.set_fidelity(f64::NAN);
        assert_eq!(h.fidelity, 0.0);
    }
}
