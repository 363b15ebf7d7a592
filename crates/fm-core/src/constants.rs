/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;

/// Tolerance for Σ(amplitude²) = 1 checks
pub const AMPLITUDE_TOLERANCE: f64 = 1e-9;

/// Default dimensionality of the hashing embedder
pub const EMBEDDING_DIMS: usize = 64;

/// Shingle width (tokens) for repetition density
pub const SHINGLE_WIDTH: usize = 3;

/// Estimated storage cost of one copy op in a delta, in bytes
pub const COPY_OP_COST: usize = 4;

/// Largest LCS table (segments × segments) before deltas fall back to
/// prefix/suffix matching. LCS is O(n·m) in memory.
pub const MAX_LCS_CELLS: usize = 1 << 20;

/// Maximum length of a motif or surface summary, in characters
pub const SUMMARY_CHARS: usize = 160;

/// Default half-life for fidelity decay: one day, in milliseconds
pub const DEFAULT_HALF_LIFE_MS: u64 = 24 * 60 * 60 * 1000;

/// Default observer session window: 30 minutes, in milliseconds
pub const DEFAULT_SESSION_WINDOW_MS: u64 = 30 * 60 * 1000;

/// Default superposition TTL: 10 minutes, in milliseconds
pub const DEFAULT_SUPERPOSITION_TTL_MS: u64 = 10 * 60 * 1000;

/// Fidelity a fragment starts with on ingest
pub const INITIAL_FIDELITY: f64 = 0.5;
