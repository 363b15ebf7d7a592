use std::fs;
use std::path::Path;

use fm_core::{export_json, import_json};

use crate::error::{Result, StoreError};
use crate::store::Store;

impl Store {
    /// Replace the store contents with a JSON export file.
    pub fn import_json_file(&self, path: &Path) -> Result<()> {
        let json = fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", path.display()))
        })?;
        self.import_json_str(&json)
    }

    pub fn import_json_str(&self, json: &str) -> Result<()> {
        let snapshot =
            import_json(json).map_err(|e| StoreError::InvalidData(format!("invalid JSON: {e}")))?;
        self.replace(&snapshot)
    }

    pub fn export_json_file(&self, path: &Path) -> Result<()> {
        let json = self.export_json_string()?;
        fs::write(path, json).map_err(|e| {
            StoreError::InvalidData(format!("failed to write {}: {e}", path.display()))
        })
    }

    pub fn export_json_string(&self) -> Result<String> {
        let snapshot = self.load()?;
        export_json(&snapshot).map_err(|e| StoreError::InvalidData(format!("JSON export failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fm_core::{EngineConfig, IngestMetadata, Layer, ManualClock, MemoryEngine};

    fn engine() -> MemoryEngine {
        let e = MemoryEngine::with_parts(
            EngineConfig::default(),
            Arc::new(ManualClock::new(5_000)),
            None,
        )
        .unwrap();
        let id = e
            .ingest(
                "Granite forms when magma cools slowly beneath the surface of the crust.",
                IngestMetadata::text(),
            )
            .unwrap();
        e.access(id, "primary-agent", Layer::Deep).unwrap();
        e
    }

    #[test]
    fn test_export_import_roundtrip() {
        let source = Store::open_in_memory().unwrap();
        source.checkpoint(&engine().snapshot()).unwrap();
        let json = source.export_json_string().unwrap();

        let target = Store::open_in_memory().unwrap();
        target.import_json_str(&json).unwrap();
        assert_eq!(target.load().unwrap(), source.load().unwrap());
    }

    #[test]
    fn test_import_replaces_existing() {
        let store = Store::open_in_memory().unwrap();
        store.checkpoint(&engine().snapshot()).unwrap();
        let json = store.export_json_string().unwrap();

        let other = Store::open_in_memory().unwrap();
        let e = engine();
        e.ingest("A second, unrelated note about tidal pools.", IngestMetadata::text())
            .unwrap();
        other.checkpoint(&e.snapshot()).unwrap();
        assert_eq!(other.fragment_count().unwrap(), 2);

        other.import_json_str(&json).unwrap();
        assert_eq!(other.fragment_count().unwrap(), 1);
        assert_eq!(other.access_events_since(0).unwrap().len(), 1);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let store = Store::open_in_memory().unwrap();
        store.checkpoint(&engine().snapshot()).unwrap();
        store.export_json_file(&path).unwrap();

        let fresh = Store::open_in_memory().unwrap();
        fresh.import_json_file(&path).unwrap();
        assert_eq!(fresh.fragment_count().unwrap(), 1);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.import_json_str("{not json"),
            Err(StoreError::InvalidData(_))
        ));
    }
}
