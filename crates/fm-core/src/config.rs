//! Engine tuning. Every threshold the engine consults lives here so callers
//! (and the TOML loader in fm-store) can override it; nothing below is a
//! fixed contract.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_HALF_LIFE_MS, DEFAULT_SESSION_WINDOW_MS, DEFAULT_SUPERPOSITION_TTL_MS,
    EMBEDDING_DIMS, SHINGLE_WIDTH,
};
use crate::error::{EngineError, Result};
use crate::observer::ObserverProfile;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub embedding_dims: EmbeddingDims,
    pub analyzer: AnalyzerConfig,
    pub encoder: EncoderConfig,
    pub hierarchy: HierarchyConfig,
    pub observer: ObserverConfig,
    pub branch: BranchConfig,
    pub quantum: QuantumConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EmbeddingDims(pub usize);

impl Default for EmbeddingDims {
    fn default() -> Self {
        Self(EMBEDDING_DIMS)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Tokens per shingle for repetition density.
    pub shingle_width: usize,
    /// Fewer tokens than this is below the information floor.
    pub min_tokens: usize,
    /// Minimum total information in bits (per-token entropy × count).
    pub information_floor: f64,
    pub high_entropy: f64,
    pub low_entropy: f64,
    pub low_repetition: f64,
    pub high_repetition: f64,
    /// Repetition needed for low-entropy content to count as lossy-safe.
    pub low_entropy_repetition: f64,
    /// Raw structural depth at which the fractal scheme is recommended.
    pub fractal_depth: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            shingle_width: SHINGLE_WIDTH,
            min_tokens: 3,
            information_floor: 2.0,
            high_entropy: 0.75,
            low_entropy: 0.5,
            low_repetition: 0.3,
            high_repetition: 0.6,
            low_entropy_repetition: 0.4,
            fractal_depth: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    /// Largest edit distance (1 − Dice similarity) a motif may have to be reused.
    pub max_motif_distance: f64,
    /// Derived chains deeper than this are flattened into literals.
    pub max_chain_depth: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_motif_distance: 0.4,
            max_chain_depth: 8,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Minimum cosine similarity to join an existing depth-0 cluster.
    pub assign_threshold: f64,
    pub max_iterations: usize,
    pub promote_min_size: usize,
    pub promote_min_cohesion: f64,
    /// Minimum centroid similarity for clusters sharing a meta-concept.
    pub meta_threshold: f64,
    /// Clusters probed per query before ranking members.
    pub probe_clusters: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            assign_threshold: 0.5,
            max_iterations: 20,
            promote_min_size: 2,
            promote_min_cohesion: 0.6,
            meta_threshold: 0.3,
            probe_clusters: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObserverConfig {
    pub half_life_ms: u64,
    /// Decay never pulls fidelity below this.
    pub decay_floor: f64,
    pub session_window_ms: u64,
    /// Below this fidelity a fragment is marked degraded.
    pub degraded_fidelity: f64,
    pub surface_weight: f64,
    pub core_weight: f64,
    pub deep_weight: f64,
    /// Replay fidelity cap for core-layer views.
    pub core_replay_fidelity: f64,
    /// Extra catalog entries, registered after the built-in kinds.
    pub extra_observers: Vec<ObserverProfile>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            half_life_ms: DEFAULT_HALF_LIFE_MS,
            decay_floor: 0.1,
            session_window_ms: DEFAULT_SESSION_WINDOW_MS,
            degraded_fidelity: 0.2,
            surface_weight: 0.25,
            core_weight: 0.6,
            deep_weight: 1.0,
            core_replay_fidelity: 0.6,
            extra_observers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BranchConfig {
    /// Scale of the uniform 1/n prior.
    pub prior_weight: f64,
    /// Scale of the hint-similarity term.
    pub hint_gain: f64,
    /// Half-width of the uniform "quantum noise" perturbation.
    pub noise_amplitude: f64,
    /// Fixed RNG seed for reproducible branching. None draws from the OS.
    pub seed: Option<u64>,
    pub max_branches: usize,
    pub cache_capacity: usize,
    pub ttl_ms: u64,
    /// Paths-not-taken kept per parent fragment.
    pub archive_capacity: usize,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            prior_weight: 1.0,
            hint_gain: 2.0,
            noise_amplitude: 0.05,
            seed: None,
            max_branches: 16,
            cache_capacity: 64,
            ttl_ms: DEFAULT_SUPERPOSITION_TTL_MS,
            archive_capacity: 32,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Classical,
    External,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuantumConfig {
    pub backend: BackendKind,
    pub shots: u32,
}

impl Default for QuantumConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Classical,
            shots: 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub workers: usize,
    /// Fragments re-analyzed per cycle.
    pub reanalysis_batch: usize,
    pub rebuild_depth: usize,
    pub interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            reanalysis_batch: 64,
            rebuild_depth: 1,
            interval_ms: 60_000,
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(EngineError::InvalidInput(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

impl EngineConfig {
    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dims.0 == 0 {
            return Err(EngineError::InvalidInput("embedding_dims must be > 0".into()));
        }
        let a = &self.analyzer;
        if a.shingle_width == 0 {
            return Err(EngineError::InvalidInput("analyzer.shingle_width must be > 0".into()));
        }
        for (name, v) in [
            ("analyzer.high_entropy", a.high_entropy),
            ("analyzer.low_entropy", a.low_entropy),
            ("analyzer.low_repetition", a.low_repetition),
            ("analyzer.high_repetition", a.high_repetition),
            ("analyzer.low_entropy_repetition", a.low_entropy_repetition),
            ("encoder.max_motif_distance", self.encoder.max_motif_distance),
            ("hierarchy.promote_min_cohesion", self.hierarchy.promote_min_cohesion),
            ("observer.decay_floor", self.observer.decay_floor),
            ("observer.degraded_fidelity", self.observer.degraded_fidelity),
            ("observer.surface_weight", self.observer.surface_weight),
            ("observer.core_weight", self.observer.core_weight),
            ("observer.deep_weight", self.observer.deep_weight),
            ("observer.core_replay_fidelity", self.observer.core_replay_fidelity),
            ("branch.noise_amplitude", self.branch.noise_amplitude),
        ] {
            check_unit(name, v)?;
        }
        for (name, v) in [
            ("hierarchy.assign_threshold", self.hierarchy.assign_threshold),
            ("hierarchy.meta_threshold", self.hierarchy.meta_threshold),
        ] {
            if !(-1.0..=1.0).contains(&v) {
                return Err(EngineError::InvalidInput(format!(
                    "{name} must be a cosine similarity in [-1, 1], got {v}"
                )));
            }
        }
        if self.branch.max_branches == 0 || self.branch.cache_capacity == 0 {
            return Err(EngineError::InvalidInput(
                "branch.max_branches and branch.cache_capacity must be > 0".into(),
            ));
        }
        for p in &self.observer.extra_observers {
            check_unit("observer impact_strength", p.impact_strength)?;
            check_unit("observer sharpening_factor", p.sharpening_factor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.observer.decay_floor = 1.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("observer.decay_floor"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"branch": {"seed": 7}, "embedding_dims": 16}"#).unwrap();
        assert_eq!(cfg.branch.seed, Some(7));
        assert_eq!(cfg.branch.hint_gain, BranchConfig::default().hint_gain);
        assert_eq!(cfg.embedding_dims.0, 16);
        assert_eq!(cfg.analyzer, AnalyzerConfig::default());
    }
}
