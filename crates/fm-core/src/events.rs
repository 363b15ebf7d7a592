use serde::{Deserialize, Serialize};

use crate::branch::BranchId;
use crate::fragment::{FidelityTier, FragmentId};

/// Outbound notifications, published on the engine's broadcast channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    FidelityChanged {
        fragment: FragmentId,
        old_tier: FidelityTier,
        new_tier: FidelityTier,
    },
    BranchCollapsed {
        parent: FragmentId,
        winner: BranchId,
        coherence: f64,
    },
    /// A subsystem fell back to a lesser mode of operation.
    DegradedMode { reason: String },
}
