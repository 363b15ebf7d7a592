//! Read-time fidelity mutation. Who reads a fragment, and how deeply, changes
//! how well it is remembered afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ObserverConfig;
use crate::fragment::{FragmentHeader, FragmentId};
use crate::time::half_life_factor;
use crate::tokenizer::tokenize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Surface,
    Core,
    Deep,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Surface => "surface",
            Self::Core => "core",
            Self::Deep => "deep",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "core" => Self::Core,
            "deep" => Self::Deep,
            _ => Self::Surface,
        }
    }
}

/// How far a fragment has been observed within the current session.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LayerState {
    #[default]
    Unobserved,
    Surface,
    Core,
    Deep,
}

impl From<Layer> for LayerState {
    fn from(layer: Layer) -> Self {
        match layer {
            Layer::Surface => Self::Surface,
            Layer::Core => Self::Core,
            Layer::Deep => Self::Deep,
        }
    }
}

impl LayerState {
    /// Next state after an access `gap` millis after the previous one.
    /// Inside the session window the state only deepens; a longer gap
    /// starts over from unobserved.
    pub fn advance(self, requested: Layer, gap: u64, session_window: u64) -> Self {
        let base = if gap > session_window {
            Self::Unobserved
        } else {
            self
        };
        base.max(requested.into())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unobserved => "unobserved",
            Self::Surface => "surface",
            Self::Core => "core",
            Self::Deep => "deep",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "surface" => Self::Surface,
            "core" => Self::Core,
            "deep" => Self::Deep,
            _ => Self::Unobserved,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObserverKind {
    PrimaryAgent,
    EndUser,
    Plugin,
    SystemProcess,
}

impl ObserverKind {
    pub const ALL: [ObserverKind; 4] = [
        Self::PrimaryAgent,
        Self::EndUser,
        Self::Plugin,
        Self::SystemProcess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryAgent => "primary-agent",
            Self::EndUser => "end-user",
            Self::Plugin => "plugin",
            Self::SystemProcess => "system-process",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// (impact_strength, sharpening_factor)
    pub fn defaults(&self) -> (f64, f64) {
        match self {
            Self::PrimaryAgent => (1.0, 0.5),
            Self::EndUser => (0.8, 0.4),
            Self::Plugin => (0.5, 0.3),
            Self::SystemProcess => (0.2, 0.1),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ObserverProfile {
    pub id: String,
    pub kind: ObserverKind,
    pub impact_strength: f64,
    pub sharpening_factor: f64,
}

impl ObserverProfile {
    pub fn for_kind(kind: ObserverKind) -> Self {
        let (impact_strength, sharpening_factor) = kind.defaults();
        Self {
            id: kind.as_str().to_string(),
            kind,
            impact_strength,
            sharpening_factor,
        }
    }
}

/// Observer profiles by id. Seeded with one profile per kind.
#[derive(Clone, Debug)]
pub struct ObserverCatalog {
    profiles: Vec<ObserverProfile>,
}

impl Default for ObserverCatalog {
    fn default() -> Self {
        Self::seeded()
    }
}

impl ObserverCatalog {
    pub fn seeded() -> Self {
        Self {
            profiles: ObserverKind::ALL
                .into_iter()
                .map(ObserverProfile::for_kind)
                .collect(),
        }
    }

    pub fn with_extra(extra: &[ObserverProfile]) -> Self {
        let mut catalog = Self::seeded();
        for p in extra {
            catalog.register(p.clone());
        }
        catalog
    }

    /// Add a profile. Ids are unique; returns false if the id is taken.
    pub fn register(&mut self, profile: ObserverProfile) -> bool {
        if self.get(&profile.id).is_some() {
            tracing::warn!(id = %profile.id, "observer id already registered");
            return false;
        }
        self.profiles.push(profile);
        true
    }

    pub fn get(&self, id: &str) -> Option<&ObserverProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn profiles(&self) -> &[ObserverProfile] {
        &self.profiles
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub seq: u64,
    pub observer: String,
    pub fragment: FragmentId,
    pub layer: Layer,
    pub timestamp: u64,
    pub fidelity_delta: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaMemoryRecord {
    pub fragment: FragmentId,
    pub events: Vec<AccessEvent>,
    /// Sum of all fidelity deltas caused by observation.
    pub cognitive_drift: f64,
    pub access_count: u64,
}

impl MetaMemoryRecord {
    pub fn new(fragment: FragmentId) -> Self {
        Self {
            fragment,
            events: Vec::new(),
            cognitive_drift: 0.0,
            access_count: 0,
        }
    }

    pub fn record(&mut self, event: AccessEvent) {
        self.cognitive_drift += event.fidelity_delta;
        self.access_count += 1;
        self.events.push(event);
    }

    /// Replay an access log into per-fragment records.
    pub fn rebuild<'a>(
        log: impl IntoIterator<Item = &'a AccessEvent>,
    ) -> HashMap<FragmentId, MetaMemoryRecord> {
        let mut events: Vec<&AccessEvent> = log.into_iter().collect();
        events.sort_by_key(|e| e.seq);
        let mut out: HashMap<FragmentId, MetaMemoryRecord> = HashMap::new();
        for e in events {
            out.entry(e.fragment)
                .or_insert_with(|| MetaMemoryRecord::new(e.fragment))
                .record(e.clone());
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionalTag {
    Positive,
    Negative,
    Urgent,
    Neutral,
}

const URGENT_WORDS: &[&str] = &[
    "urgent", "asap", "immediately", "critical", "emergency", "deadline",
];
const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "happy", "love", "success", "excellent", "glad", "win", "thanks",
    "wonderful", "pleased",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "sad", "angry", "hate", "failure", "failed", "error", "terrible", "worried",
    "broken", "loss",
];

impl EmotionalTag {
    /// Lexicon tag. Any urgent word wins; otherwise the larger of the
    /// positive and negative counts, neutral on a tie.
    pub fn classify(text: &str) -> Self {
        let tokens = tokenize(text);
        let count = |lexicon: &[&str]| {
            tokens
                .iter()
                .filter(|t| lexicon.contains(&t.as_str()))
                .count()
        };
        if count(URGENT_WORDS) > 0 {
            return Self::Urgent;
        }
        let pos = count(POSITIVE_WORDS);
        let neg = count(NEGATIVE_WORDS);
        match pos.cmp(&neg) {
            std::cmp::Ordering::Greater => Self::Positive,
            std::cmp::Ordering::Less => Self::Negative,
            std::cmp::Ordering::Equal => Self::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Urgent => "urgent",
            Self::Neutral => "neutral",
        }
    }
}

/// What an access hands back, by layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "lowercase")]
pub enum ContentView {
    Surface { summary: String, tag: EmotionalTag },
    Core { content: String, replay_fidelity: f64 },
    Deep { content: String },
}

impl ContentView {
    pub fn text(&self) -> &str {
        match self {
            Self::Surface { summary, .. } => summary,
            Self::Core { content, .. } | Self::Deep { content } => content,
        }
    }

    pub fn layer(&self) -> Layer {
        match self {
            Self::Surface { .. } => Layer::Surface,
            Self::Core { .. } => Layer::Core,
            Self::Deep { .. } => Layer::Deep,
        }
    }
}

/// Which way an update moved fidelity relative to the degraded threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThresholdCrossing {
    None,
    Degraded,
    Restored,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FidelityUpdate {
    pub old: f64,
    pub new: f64,
    pub crossing: ThresholdCrossing,
}

impl FidelityUpdate {
    pub fn delta(&self) -> f64 {
        self.new - self.old
    }
}

/// The fidelity arithmetic. Stateless apart from configuration.
#[derive(Clone, Debug)]
pub struct ObserverModel {
    config: ObserverConfig,
}

impl ObserverModel {
    pub fn new(config: ObserverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    pub fn layer_weight(&self, layer: Layer) -> f64 {
        match layer {
            Layer::Surface => self.config.surface_weight,
            Layer::Core => self.config.core_weight,
            Layer::Deep => self.config.deep_weight,
        }
    }

    /// `floor + (f − floor)·0.5^(elapsed / half_life)`. Fidelity already
    /// under the floor stays where it is.
    pub fn decay(&self, fidelity: f64, elapsed_millis: u64) -> f64 {
        let floor = self.config.decay_floor;
        if fidelity <= floor {
            return fidelity;
        }
        floor + (fidelity - floor) * half_life_factor(elapsed_millis, self.config.half_life_ms)
    }

    /// `f + (1 − f)·impact·sharpening·layer_weight`, clamped to [0, 1].
    pub fn sharpen(&self, fidelity: f64, profile: &ObserverProfile, layer: Layer) -> f64 {
        let gain = profile.impact_strength * profile.sharpening_factor * self.layer_weight(layer);
        (fidelity + (1.0 - fidelity) * gain).clamp(0.0, 1.0)
    }

    fn crossing(&self, old: f64, new: f64) -> ThresholdCrossing {
        let t = self.config.degraded_fidelity;
        if old >= t && new < t {
            ThresholdCrossing::Degraded
        } else if old < t && new >= t {
            ThresholdCrossing::Restored
        } else {
            ThresholdCrossing::None
        }
    }

    /// Decay for the time since the last update, then sharpen for this
    /// access. Advances the layer state and access timestamps.
    pub fn observe(
        &self,
        header: &mut FragmentHeader,
        profile: &ObserverProfile,
        layer: Layer,
        now: u64,
    ) -> FidelityUpdate {
        let old = header.fidelity;
        let decayed = self.decay(old, now.saturating_sub(header.decayed_at));
        let sharpened = self.sharpen(decayed, profile, layer);
        header.set_fidelity(sharpened);

        let gap = now.saturating_sub(header.last_accessed);
        header.layer_state = header
            .layer_state
            .advance(layer, gap, self.config.session_window_ms);
        header.last_accessed = now;
        header.decayed_at = now;

        FidelityUpdate {
            old,
            new: header.fidelity,
            crossing: self.crossing(old, header.fidelity),
        }
    }

    /// Decay only, as the background sweep does. Sessions that have timed
    /// out reset to unobserved.
    pub fn decay_to(&self, header: &mut FragmentHeader, now: u64) -> FidelityUpdate {
        let old = header.fidelity;
        let decayed = self.decay(old, now.saturating_sub(header.decayed_at));
        header.set_fidelity(decayed);
        header.decayed_at = now.max(header.decayed_at);
        if now.saturating_sub(header.last_accessed) > self.config.session_window_ms {
            header.layer_state = LayerState::Unobserved;
        }
        FidelityUpdate {
            old,
            new: header.fidelity,
            crossing: self.crossing(old, header.fidelity),
        }
    }
}
