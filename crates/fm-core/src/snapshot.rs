//! Serializable image of a whole engine. The store persists it table by
//! table; JSON export writes it in one piece.

use serde::{Deserialize, Serialize};

use crate::analyzer::{CompressionProfile, ShingleIndex};
use crate::branch::{BranchId, CausalBranch, StateId};
use crate::encoder::{EncodedSeed, MotifNode};
use crate::fragment::FragmentHeader;
use crate::hierarchy::ConceptCluster;
use crate::observer::AccessEvent;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentRecord {
    pub header: FragmentHeader,
    pub seed: EncodedSeed,
    pub profile: CompressionProfile,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub embedding_dims: usize,
    pub fragments: Vec<FragmentRecord>,
    pub motifs: Vec<MotifNode>,
    pub clusters: Vec<ConceptCluster>,
    #[serde(default)]
    pub corpus: ShingleIndex,
    /// Ordered by sequence number.
    #[serde(default)]
    pub access_log: Vec<AccessEvent>,
    #[serde(default)]
    pub persisted_branches: Vec<CausalBranch>,
    #[serde(default)]
    pub next_access_seq: u64,
    #[serde(default)]
    pub next_branch_id: BranchId,
    #[serde(default)]
    pub next_state_id: StateId,
}

impl EngineSnapshot {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty() && self.motifs.is_empty()
    }
}
