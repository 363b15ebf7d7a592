//! Fractal memory engine.
//!
//! Stores text and JSON fragments as motif-delta chains chosen by a
//! compression analyzer, organizes them in a concept-cluster hierarchy,
//! and recalls them through observer-dependent fidelity. Alternative
//! continuations of a fragment live in weighted superpositions until they
//! are collapsed; a bridge can encode fragments and branch sets as circuits
//! for a quantum backend, with a classical shadow as fallback.
//!
//! No SQL, no transport: persistence lives in `fm-store`.

pub mod analyzer;
pub mod branch;
pub mod config;
pub mod constants;
pub mod delta;
pub mod embedding;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod fragment;
pub mod hierarchy;
pub mod maintenance;
pub mod observer;
pub mod phasor;
pub mod quantum;
pub mod serde_compat;
pub mod snapshot;
pub mod time;
pub mod tokenizer;

pub use analyzer::{CompressionAnalyzer, CompressionProfile, CompressionScheme, ShingleIndex};
pub use branch::{
    BranchId, BranchSimulator, CausalBranch, PathsNotTaken, ScenarioHint, StateId,
    SuperpositionState,
};
pub use config::{
    AnalyzerConfig, BackendKind, BranchConfig, EmbeddingDims, EncoderConfig, EngineConfig,
    HierarchyConfig, MaintenanceConfig, ObserverConfig, QuantumConfig,
};
pub use delta::{Delta, DeltaMismatch};
pub use embedding::{Embedder, cosine};
pub use encoder::{EncodedSeed, FractalEncoder, MotifArena, MotifHandle};
pub use engine::{
    AccessOutcome, EngineStats, FragmentView, IngestMetadata, MemoryEngine, ReanalysisReport,
};
pub use error::{AnalysisError, BackendUnavailable, EngineError, ReconstructionError, Result};
pub use events::EngineEvent;
pub use fragment::{ContentType, FidelityTier, FragmentHeader, FragmentId, MemoryFragment};
pub use hierarchy::{ClusterId, ClusterIndex, ConceptCluster, RebuildJob};
pub use maintenance::{
    CycleReport, Maintenance, MaintenanceCursors, MaintenancePool, MaintenanceTask, TaskOutcome,
    run_periodic,
};
pub use observer::{
    AccessEvent, ContentView, EmotionalTag, Layer, LayerState, MetaMemoryRecord, ObserverCatalog,
    ObserverKind, ObserverProfile,
};
pub use quantum::{
    AmplitudeBackend, CircuitTemplate, EncodingSource, Measurement, QuantumBridge,
    QuantumEncoding, QuantumSdk,
};
pub use serde_compat::{CURRENT_VERSION, export_json, import_json};
pub use snapshot::{EngineSnapshot, FragmentRecord};
pub use time::{Clock, ManualClock, SystemClock};
