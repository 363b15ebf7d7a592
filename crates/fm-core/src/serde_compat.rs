//! JSON export/import of an engine snapshot.
//!
//! The envelope carries a format version and an export timestamp; the body
//! is the snapshot itself.

use serde::{Deserialize, Serialize};

use crate::snapshot::EngineSnapshot;
use crate::time::{millis_to_iso8601, now_unix_millis};

pub const CURRENT_VERSION: &str = "1.0";

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WireExport {
    pub version: String,
    #[serde(default)]
    pub timestamp: String,
    pub snapshot: EngineSnapshot,
}

impl WireExport {
    pub fn from_snapshot(snapshot: EngineSnapshot) -> Self {
        Self {
            version: CURRENT_VERSION.to_string(),
            timestamp: millis_to_iso8601(now_unix_millis()),
            snapshot,
        }
    }

    /// Major version of the envelope, e.g. `1` for `"1.0"`.
    pub fn major_version(&self) -> Option<u32> {
        self.version.split('.').next()?.parse().ok()
    }
}

/// Parse an export. A different major version is accepted with a warning;
/// every snapshot field past the core tables has a default.
pub fn import_json(json: &str) -> Result<EngineSnapshot, serde_json::Error> {
    let wire: WireExport = serde_json::from_str(json)?;
    let current = CURRENT_VERSION.split('.').next().and_then(|v| v.parse::<u32>().ok());
    if wire.major_version() != current {
        tracing::warn!(
            version = %wire.version,
            expected = CURRENT_VERSION,
            "importing export with a different format version"
        );
    }
    Ok(wire.snapshot)
}

pub fn export_json(snapshot: &EngineSnapshot) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&WireExport::from_snapshot(snapshot.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{MotifBody, MotifHandle, MotifNode};

    fn snapshot() -> EngineSnapshot {
        EngineSnapshot {
            embedding_dims: 8,
            motifs: vec![MotifNode {
                handle: MotifHandle(0),
                origin: None,
                base: None,
                body: MotifBody::Literal("hello world".into()),
                summary: "hello world".into(),
                depth: 0,
                content_len: 11,
            }],
            next_access_seq: 3,
            ..EngineSnapshot::default()
        }
    }

    #[test]
    fn test_roundtrip() {
        let snap = snapshot();
        let json = export_json(&snap).unwrap();
        assert_eq!(import_json(&json).unwrap(), snap);
    }

    #[test]
    fn test_version_field() {
        let json = export_json(&snapshot()).unwrap();
        let wire: WireExport = serde_json::from_str(&json).unwrap();
        assert_eq!(wire.version, CURRENT_VERSION);
        assert_eq!(wire.major_version(), Some(1));
        assert!(wire.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_missing_optional_tables_default() {
        let json = r#"{
            "version": "1.0",
            "snapshot": {"embedding_dims": 4, "fragments": [], "motifs": [], "clusters": []}
        }"#;
        let snap = import_json(json).unwrap();
        assert!(snap.access_log.is_empty());
        assert_eq!(snap.next_branch_id, 0);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(import_json("{\"version\": 1}").is_err());
    }
}
