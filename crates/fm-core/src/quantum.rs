//! Circuit encodings of fragments and branch sets, measured on a pluggable
//! amplitude backend. The classical backend is always available and is
//! what every measurement falls back to.

use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::branch::{BranchId, StateId, SuperpositionState};
use crate::config::{BackendKind, QuantumConfig};
use crate::error::BackendUnavailable;
use crate::fragment::{FragmentHeader, FragmentId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitTemplate {
    Compression,
    PatternAnalysis,
    CausalSuperposition,
}

impl CircuitTemplate {
    pub fn qubits(&self) -> usize {
        match self {
            Self::Compression => 8,
            Self::PatternAnalysis => 6,
            Self::CausalSuperposition => 4,
        }
    }

    /// Fidelity the gate sequence itself preserves.
    pub fn gate_fidelity(&self) -> f64 {
        match self {
            Self::Compression => 0.95,
            Self::PatternAnalysis => 0.97,
            Self::CausalSuperposition => 0.99,
        }
    }

    pub fn max_outcomes(&self) -> usize {
        1 << self.qubits()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compression => "compression",
            Self::PatternAnalysis => "pattern-analysis",
            Self::CausalSuperposition => "causal-superposition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Compression, Self::PatternAnalysis, Self::CausalSuperposition]
            .into_iter()
            .find(|t| t.as_str() == s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    H(usize),
    Ry(usize, f64),
    Rz(usize, f64),
    Cnot { control: usize, target: usize },
    Measure(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "kebab-case")]
pub enum EncodingSource {
    Fragment(FragmentId),
    BranchSet(StateId),
}

/// One row of the classical outcome table. Outcome `i` corresponds to
/// computational basis state `i`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub index: usize,
    pub fragment: Option<FragmentId>,
    pub branch: Option<BranchId>,
    /// Expected probability under the classical simulation.
    pub expected: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantumEncoding {
    pub source: EncodingSource,
    pub template: CircuitTemplate,
    pub qubits: usize,
    pub fidelity_bound: f64,
    pub gates: Vec<Gate>,
    pub outcomes: Vec<Outcome>,
}

/// H layer, bound rotations, CNOT ladder, measurement.
fn gate_sequence(qubits: usize, ry: &[f64], rz: &[f64]) -> Vec<Gate> {
    let mut gates = Vec::with_capacity(qubits * 5);
    gates.extend((0..qubits).map(Gate::H));
    for q in 0..qubits {
        gates.push(Gate::Ry(q, ry.get(q).copied().unwrap_or(FRAC_PI_2)));
        gates.push(Gate::Rz(q, rz.get(q).copied().unwrap_or(FRAC_PI_2)));
    }
    gates.extend((0..qubits.saturating_sub(1)).map(|q| Gate::Cnot {
        control: q,
        target: q + 1,
    }));
    gates.extend((0..qubits).map(Gate::Measure));
    gates
}

/// Map a unit-range embedding component from [-1, 1] into [0, π].
fn to_angle(x: f32) -> f64 {
    (f64::from(x).clamp(-1.0, 1.0) + 1.0) * FRAC_PI_2
}

pub fn encode_fragment(header: &FragmentHeader, template: CircuitTemplate) -> QuantumEncoding {
    let q = template.qubits();
    let ry: Vec<f64> = header.embedding.iter().take(q).map(|x| to_angle(*x)).collect();
    let rz: Vec<f64> = header
        .embedding
        .iter()
        .skip(q)
        .take(q)
        .map(|x| to_angle(*x))
        .collect();
    QuantumEncoding {
        source: EncodingSource::Fragment(header.id),
        template,
        qubits: q,
        fidelity_bound: header.fidelity * template.gate_fidelity(),
        gates: gate_sequence(q, &ry, &rz),
        outcomes: vec![Outcome {
            index: 0,
            fragment: Some(header.id),
            branch: None,
            expected: 1.0,
        }],
    }
}

/// Amplitudes bind `Ry`, relative phases bind `Rz`. Branches beyond the
/// template's basis states are not representable.
///
/// Outcomes carry the pre-collapse distribution `a²`. Coherence is a
/// property of the classical collapse only, so a measurement and a
/// `SuperpositionState::collapse` of the same state may name different
/// branches when coherence reorders them.
pub fn encode_branch_set(
    state: &SuperpositionState,
    template: CircuitTemplate,
) -> Result<QuantumEncoding, String> {
    if state.branches.len() > template.max_outcomes() {
        return Err(format!(
            "{} branches exceed the {} outcomes of a {}-qubit template",
            state.branches.len(),
            template.max_outcomes(),
            template.qubits()
        ));
    }
    let q = template.qubits();
    let ry: Vec<f64> = state.amplitudes.iter().take(q).map(|a| a.clamp(0.0, 1.0) * PI).collect();
    let rz: Vec<f64> = state.phases.iter().take(q).copied().collect();
    let winner_coherence = state.collapse().map(|b| b.coherence).unwrap_or(0.0);

    let outcomes = state
        .branches
        .iter()
        .zip(&state.amplitudes)
        .enumerate()
        .map(|(i, (b, a))| Outcome {
            index: i,
            fragment: None,
            branch: Some(b.id),
            expected: a * a,
        })
        .collect();

    Ok(QuantumEncoding {
        source: EncodingSource::BranchSet(state.id),
        template,
        qubits: q,
        fidelity_bound: winner_coherence * template.gate_fidelity(),
        gates: gate_sequence(q, &ry, &rz),
        outcomes,
    })
}

/// Produces an outcome distribution for an encoding.
pub trait AmplitudeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probability per entry of `encoding.outcomes`.
    fn distribution(&self, encoding: &QuantumEncoding) -> Result<Vec<f64>, BackendUnavailable>;
}

/// Exact classical simulation of the outcome table.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClassicalBackend;

impl AmplitudeBackend for ClassicalBackend {
    fn name(&self) -> &'static str {
        "classical"
    }

    fn distribution(&self, encoding: &QuantumEncoding) -> Result<Vec<f64>, BackendUnavailable> {
        Ok(encoding.outcomes.iter().map(|o| o.expected).collect())
    }
}

/// Client for a real (or remote simulated) quantum device.
pub trait QuantumSdk: Send + Sync {
    /// Run `gates` on `qubits` qubits and return counts per measured basis
    /// state.
    fn execute(
        &self,
        qubits: usize,
        gates: &[Gate],
        shots: u32,
    ) -> Result<HashMap<u64, u32>, BackendUnavailable>;
}

pub struct ExternalSdkBackend {
    sdk: Arc<dyn QuantumSdk>,
    shots: u32,
}

impl ExternalSdkBackend {
    pub fn new(sdk: Arc<dyn QuantumSdk>, shots: u32) -> Self {
        Self { sdk, shots }
    }
}

impl AmplitudeBackend for ExternalSdkBackend {
    fn name(&self) -> &'static str {
        "external"
    }

    fn distribution(&self, encoding: &QuantumEncoding) -> Result<Vec<f64>, BackendUnavailable> {
        let counts = self
            .sdk
            .execute(encoding.qubits, &encoding.gates, self.shots)?;
        let hits: Vec<u32> = encoding
            .outcomes
            .iter()
            .map(|o| counts.get(&(o.index as u64)).copied().unwrap_or(0))
            .collect();
        let total: u64 = hits.iter().map(|c| u64::from(*c)).sum();
        if total == 0 {
            return Err(BackendUnavailable {
                reason: "backend returned no counts for any known outcome".into(),
            });
        }
        Ok(hits
            .into_iter()
            .map(|c| f64::from(c) / total as f64)
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub outcome: Outcome,
    pub probability: f64,
    pub backend: &'static str,
    /// Set when the configured backend failed and the classical one was
    /// used instead.
    pub fallback: Option<BackendUnavailable>,
}

pub struct QuantumBridge {
    kind: BackendKind,
    classical: ClassicalBackend,
    external: Option<ExternalSdkBackend>,
}

impl QuantumBridge {
    pub fn new(config: &QuantumConfig, sdk: Option<Arc<dyn QuantumSdk>>) -> Self {
        Self {
            kind: config.backend,
            classical: ClassicalBackend,
            external: sdk.map(|s| ExternalSdkBackend::new(s, config.shots)),
        }
    }

    fn configured(&self) -> Result<&dyn AmplitudeBackend, BackendUnavailable> {
        match self.kind {
            BackendKind::Classical => Ok(&self.classical),
            BackendKind::External => self
                .external
                .as_ref()
                .map(|b| b as &dyn AmplitudeBackend)
                .ok_or_else(|| BackendUnavailable {
                    reason: "no quantum SDK configured".into(),
                }),
        }
    }

    /// Highest-probability outcome, ties to the lowest index. Backend
    /// failures fall back to the classical simulation.
    pub fn measure(&self, encoding: &QuantumEncoding) -> Option<Measurement> {
        let attempt = self
            .configured()
            .and_then(|b| b.distribution(encoding).map(|d| (b.name(), d)));

        let (backend, dist, fallback) = match attempt {
            Ok((name, dist)) => (name, dist, None),
            Err(err) => {
                tracing::warn!(error = %err, "quantum backend unavailable, using classical shadow");
                let dist = self.classical.distribution(encoding).unwrap_or_default();
                (self.classical.name(), dist, Some(err))
            }
        };

        let mut best: Option<(usize, f64)> = None;
        for (i, p) in dist.iter().enumerate() {
            match best {
                Some((_, bp)) if bp >= *p => {}
                _ => best = Some((i, *p)),
            }
        }
        let (i, probability) = best?;
        Some(Measurement {
            outcome: encoding.outcomes.get(i)?.clone(),
            probability,
            backend,
            fallback,
        })
    }
}
