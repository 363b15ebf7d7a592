use std::fmt;

use crate::encoder::MotifHandle;
use crate::fragment::FragmentId;
use crate::hierarchy::ClusterId;

/// Content could not be scored. Callers fall back to the lossless tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    Empty,
    Unparseable(String),
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::Empty => write!(f, "content is empty"),
            AnalysisError::Unparseable(msg) => write!(f, "content is unparseable: {msg}"),
        }
    }
}

impl std::error::Error for AnalysisError {}

/// A motif needed for expansion is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconstructionError {
    MotifEvicted { handle: MotifHandle },
    UnknownMotif { handle: MotifHandle },
}

impl ReconstructionError {
    pub fn handle(&self) -> MotifHandle {
        match self {
            ReconstructionError::MotifEvicted { handle }
            | ReconstructionError::UnknownMotif { handle } => *handle,
        }
    }
}

impl fmt::Display for ReconstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconstructionError::MotifEvicted { handle } => {
                write!(f, "motif {} has been evicted", handle.0)
            }
            ReconstructionError::UnknownMotif { handle } => {
                write!(f, "motif {} does not exist", handle.0)
            }
        }
    }
}

impl std::error::Error for ReconstructionError {}

/// The external quantum backend could not run a circuit.
/// Never leaves the quantum bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendUnavailable {
    pub reason: String,
}

impl fmt::Display for BackendUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quantum backend unavailable: {}", self.reason)
    }
}

impl std::error::Error for BackendUnavailable {}

/// What a caller-facing engine operation can fail with.
#[derive(Debug)]
pub enum EngineError {
    FragmentNotFound(FragmentId),
    ClusterNotFound(ClusterId),
    StateNotFound(u64),
    BranchNotFound(u64),
    Analysis(AnalysisError),
    Reconstruction(ReconstructionError),
    InvalidInput(String),
    Cancelled,
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::FragmentNotFound(_)
                | EngineError::ClusterNotFound(_)
                | EngineError::StateNotFound(_)
                | EngineError::BranchNotFound(_)
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::FragmentNotFound(id) => write!(f, "fragment not found: {id}"),
            EngineError::ClusterNotFound(id) => write!(f, "cluster not found: {}", id.0),
            EngineError::StateNotFound(id) => write!(f, "superposition state not found: {id}"),
            EngineError::BranchNotFound(id) => write!(f, "branch not found: {id}"),
            EngineError::Analysis(e) => write!(f, "analysis failed: {e}"),
            EngineError::Reconstruction(e) => write!(f, "reconstruction failed: {e}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Analysis(e) => Some(e),
            EngineError::Reconstruction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AnalysisError> for EngineError {
    fn from(e: AnalysisError) -> Self {
        EngineError::Analysis(e)
    }
}

impl From<ReconstructionError> for EngineError {
    fn from(e: ReconstructionError) -> Self {
        EngineError::Reconstruction(e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(EngineError::FragmentNotFound(uuid::Uuid::nil()).is_not_found());
        assert!(EngineError::StateNotFound(3).is_not_found());
        assert!(!EngineError::Cancelled.is_not_found());
    }

    #[test]
    fn test_display_messages() {
        let e = EngineError::from(ReconstructionError::MotifEvicted { handle: MotifHandle(7) });
        assert_eq!(e.to_string(), "reconstruction failed: motif 7 has been evicted");
        let e = EngineError::from(AnalysisError::Empty);
        assert_eq!(e.to_string(), "analysis failed: content is empty");
    }
}
