use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use fm_core::analyzer::ShingleIndex;
use fm_core::encoder::{MotifBody, MotifNode};
use fm_core::{
    AccessEvent, CausalBranch, ClusterId, CompressionProfile, CompressionScheme, ConceptCluster,
    ContentType, EncodedSeed, EngineSnapshot, FidelityTier, FragmentHeader, FragmentId,
    FragmentRecord, Layer, LayerState, MaintenanceCursors, MotifHandle,
};

use crate::error::{Result, StoreError};
use crate::schema;

const LAST_CHECKPOINT_SEQ: &str = "last_checkpoint_seq";

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata_on(&self.conn, key, value)
    }

    fn metadata_u64(&self, key: &str) -> Result<u64> {
        match self.get_metadata(key)? {
            Some(v) => v
                .parse()
                .map_err(|e| StoreError::InvalidData(format!("metadata {key}='{v}': {e}"))),
            None => Ok(0),
        }
    }

    /// Highest access-event sequence number written by a checkpoint.
    pub fn last_checkpoint_seq(&self) -> Result<u64> {
        self.metadata_u64(LAST_CHECKPOINT_SEQ)
    }

    /// Highest access-event sequence number stored, checkpointed or not.
    pub fn last_event_seq(&self) -> Result<u64> {
        let max: Option<i64> =
            self.conn
                .query_row("SELECT MAX(seq) FROM access_events", [], |row| row.get(0))?;
        Ok(max.map(to_u64).unwrap_or(0))
    }

    pub fn fragment_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM fragments", [], |row| row.get(0))?;
        Ok(to_usize(n))
    }

    /// Size of the database in bytes (page_count × page_size).
    pub fn db_size(&self) -> u64 {
        let pages: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap_or(0);
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap_or(0);
        to_u64(pages * page_size)
    }

    // --- Checkpoint ---

    /// Replace every table except the access log with `snapshot`, in one
    /// transaction. Access events are only ever appended.
    pub fn checkpoint(&self, snapshot: &EngineSnapshot) -> Result<()> {
        self.write_snapshot(snapshot, false)
    }

    /// Like [`Store::checkpoint`], but the access log is replaced too.
    pub fn replace(&self, snapshot: &EngineSnapshot) -> Result<()> {
        self.write_snapshot(snapshot, true)
    }

    fn write_snapshot(&self, snapshot: &EngineSnapshot, replace_log: bool) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        if replace_log {
            tx.execute_batch("DELETE FROM access_events;")?;
        }
        tx.execute_batch(
            "DELETE FROM seeds;
             DELETE FROM compression_profiles;
             DELETE FROM meta_memory;
             DELETE FROM fragments;
             DELETE FROM motifs;
             DELETE FROM clusters;
             DELETE FROM branches;",
        )?;

        for node in &snapshot.motifs {
            save_motif_on(&tx, node)?;
        }
        for record in &snapshot.fragments {
            save_fragment_on(&tx, record)?;
        }
        for cluster in &snapshot.clusters {
            save_cluster_on(&tx, cluster)?;
        }
        for branch in &snapshot.persisted_branches {
            save_branch_on(&tx, branch)?;
        }
        append_events_on(&tx, &snapshot.access_log)?;
        rebuild_meta_memory_on(&tx)?;

        let last_seq = snapshot.access_log.iter().map(|e| e.seq).max().unwrap_or(0);
        set_metadata_on(&tx, LAST_CHECKPOINT_SEQ, &last_seq.to_string())?;
        set_metadata_on(&tx, "embedding_dims", &snapshot.embedding_dims.to_string())?;
        set_metadata_on(&tx, "next_access_seq", &snapshot.next_access_seq.to_string())?;
        set_metadata_on(&tx, "next_branch_id", &snapshot.next_branch_id.to_string())?;
        set_metadata_on(&tx, "next_state_id", &snapshot.next_state_id.to_string())?;
        set_metadata_on(&tx, "corpus", &serde_json::to_string(&snapshot.corpus)?)?;

        tx.commit()?;
        tracing::info!(
            fragments = snapshot.fragments.len(),
            motifs = snapshot.motifs.len(),
            last_seq,
            "checkpoint written"
        );
        Ok(())
    }

    /// Append access events. Events already stored are skipped, so callers
    /// may resend overlapping ranges.
    pub fn append_events(&self, events: &[AccessEvent]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let written = append_events_on(&tx, events)?;
        tx.commit()?;
        Ok(written)
    }

    /// Recompute the derived `meta_memory` table from the access log.
    pub fn rebuild_meta_memory(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        rebuild_meta_memory_on(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// (access_count, cognitive_drift) from the derived table.
    pub fn meta_memory(&self, fragment: FragmentId) -> Result<Option<(u64, f64)>> {
        let row = self
            .conn
            .query_row(
                "SELECT access_count, cognitive_drift FROM meta_memory WHERE fragment_id = ?1",
                [fragment.to_string()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(count, drift)| (to_u64(count), drift)))
    }

    // --- Maintenance cursors ---

    /// Persist where background maintenance stopped. A suspended rebuild is
    /// not saved; it restarts from scratch after a reopen.
    pub fn save_cursors(&self, cursors: &MaintenanceCursors) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        set_metadata_on(&tx, "reanalysis_pos", &cursors.reanalysis_pos.to_string())?;
        set_metadata_on(&tx, "reanalysis_retry", &serde_json::to_string(&cursors.retry)?)?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_cursors(&self) -> Result<MaintenanceCursors> {
        let retry = match self.get_metadata("reanalysis_retry")? {
            Some(json) => serde_json::from_str(&json)?,
            None => Default::default(),
        };
        Ok(MaintenanceCursors {
            reanalysis_pos: usize::try_from(self.metadata_u64("reanalysis_pos")?).unwrap_or(0),
            retry,
            rebuild: None,
        })
    }

    // --- Load ---

    /// The last checkpoint plus every access event appended since.
    pub fn load(&self) -> Result<EngineSnapshot> {
        let corpus: ShingleIndex = match self.get_metadata("corpus")? {
            Some(json) => serde_json::from_str(&json)?,
            None => ShingleIndex::default(),
        };
        Ok(EngineSnapshot {
            embedding_dims: usize::try_from(self.metadata_u64("embedding_dims")?).unwrap_or(0),
            fragments: self.load_fragments()?,
            motifs: self.load_motifs()?,
            clusters: self.load_clusters()?,
            corpus,
            access_log: self.access_events_since(0)?,
            persisted_branches: self.load_branches()?,
            next_access_seq: self.metadata_u64("next_access_seq")?,
            next_branch_id: self.metadata_u64("next_branch_id")?,
            next_state_id: self.metadata_u64("next_state_id")?,
        })
    }

    fn load_fragments(&self) -> Result<Vec<FragmentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.id, f.content_type, f.tier, f.fidelity, f.compression_ratio, f.cluster_id,
                    f.label, f.created_at, f.last_accessed, f.decayed_at, f.layer_state,
                    f.summary, f.embedding,
                    p.entropy, p.structural_depth, p.depth_score, p.repetition_density,
                    p.token_count, p.tier, p.scheme, p.analyzed_at,
                    s.motif, s.base, s.stored_bytes, s.original_len, s.depth
             FROM fragments f
             JOIN compression_profiles p ON p.fragment_id = f.id
             JOIN seeds s ON s.fragment_id = f.id
             ORDER BY f.id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(FragmentRow {
                id: row.get(0)?,
                content_type: row.get(1)?,
                tier: row.get(2)?,
                fidelity: row.get(3)?,
                compression_ratio: row.get(4)?,
                cluster: row.get(5)?,
                label: row.get(6)?,
                created_at: row.get(7)?,
                last_accessed: row.get(8)?,
                decayed_at: row.get(9)?,
                layer_state: row.get(10)?,
                summary: row.get(11)?,
                embedding: row.get(12)?,
                entropy: row.get(13)?,
                structural_depth: row.get(14)?,
                depth_score: row.get(15)?,
                repetition_density: row.get(16)?,
                token_count: row.get(17)?,
                profile_tier: row.get(18)?,
                scheme: row.get(19)?,
                analyzed_at: row.get(20)?,
                motif: row.get(21)?,
                base: row.get(22)?,
                stored_bytes: row.get(23)?,
                original_len: row.get(24)?,
                depth: row.get(25)?,
            })
        })?;

        rows.map(|r| r?.into_record()).collect()
    }

    fn load_motifs(&self) -> Result<Vec<MotifNode>> {
        let mut stmt = self.conn.prepare(
            "SELECT handle, origin, base, body, summary, depth, content_len
             FROM motifs ORDER BY handle",
        )?;
        let rows: Vec<(i64, Option<String>, Option<i64>, String, String, i64, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut nodes = Vec::with_capacity(rows.len());
        for (i, (handle, origin, base, body, summary, depth, content_len)) in
            rows.into_iter().enumerate()
        {
            // Handles index the arena directly, so gaps mean a damaged table
            if to_usize(handle) != i {
                return Err(StoreError::InvalidData(format!(
                    "motif handles not contiguous at {handle}"
                )));
            }
            let body: MotifBody = serde_json::from_str(&body)?;
            nodes.push(MotifNode {
                handle: MotifHandle(to_u32(handle)),
                origin: origin.as_deref().map(parse_uuid).transpose()?,
                base: base.map(|b| MotifHandle(to_u32(b))),
                body,
                summary,
                depth: to_usize(depth),
                content_len: to_usize(content_len),
            });
        }
        Ok(nodes)
    }

    fn load_clusters(&self) -> Result<Vec<ConceptCluster>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, depth, parent, children, members, centroid, cohesion
             FROM clusters ORDER BY id",
        )?;
        let rows: Vec<(i64, i64, Option<i64>, String, String, String, f64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(id, depth, parent, children, members, centroid, cohesion)| {
                Ok(ConceptCluster {
                    id: ClusterId(to_u32(id)),
                    depth: to_usize(depth),
                    members: serde_json::from_str(&members)?,
                    parent: parent.map(|p| ClusterId(to_u32(p))),
                    children: serde_json::from_str(&children)?,
                    centroid: serde_json::from_str(&centroid)?,
                    cohesion,
                })
            })
            .collect()
    }

    fn load_branches(&self) -> Result<Vec<CausalBranch>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, parent, weight, delta, coherence, created_at FROM branches ORDER BY id",
        )?;
        let rows: Vec<(i64, String, f64, String, f64, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(id, parent, weight, delta, coherence, created_at)| {
                Ok(CausalBranch {
                    id: to_u64(id),
                    parent: parse_uuid(&parent)?,
                    weight,
                    delta: serde_json::from_str(&delta)?,
                    coherence,
                    created_at: to_u64(created_at),
                })
            })
            .collect()
    }

    /// Access events with `seq > after`, in sequence order.
    pub fn access_events_since(&self, after: u64) -> Result<Vec<AccessEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, observer, fragment_id, layer, timestamp, fidelity_delta
             FROM access_events WHERE seq > ?1 ORDER BY seq",
        )?;
        let rows: Vec<(i64, String, String, String, i64, f64)> = stmt
            .query_map([after as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(seq, observer, fragment, layer, timestamp, fidelity_delta)| {
                Ok(AccessEvent {
                    seq: to_u64(seq),
                    observer,
                    fragment: parse_uuid(&fragment)?,
                    layer: Layer::from_str_lossy(&layer),
                    timestamp: to_u64(timestamp),
                    fidelity_delta,
                })
            })
            .collect()
    }
}

struct FragmentRow {
    id: String,
    content_type: String,
    tier: String,
    fidelity: f64,
    compression_ratio: f64,
    cluster: Option<i64>,
    label: Option<String>,
    created_at: i64,
    last_accessed: i64,
    decayed_at: i64,
    layer_state: String,
    summary: String,
    embedding: String,
    entropy: f64,
    structural_depth: i64,
    depth_score: f64,
    repetition_density: f64,
    token_count: i64,
    profile_tier: String,
    scheme: String,
    analyzed_at: i64,
    motif: i64,
    base: Option<i64>,
    stored_bytes: i64,
    original_len: i64,
    depth: i64,
}

impl FragmentRow {
    fn into_record(self) -> Result<FragmentRecord> {
        let id = parse_uuid(&self.id)?;
        let header = FragmentHeader {
            id,
            content_type: ContentType::from_str_lossy(&self.content_type),
            embedding: serde_json::from_str(&self.embedding)?,
            created_at: to_u64(self.created_at),
            tier: FidelityTier::from_str_lossy(&self.tier),
            fidelity: self.fidelity,
            compression_ratio: self.compression_ratio,
            cluster: self.cluster.map(|c| ClusterId(to_u32(c))),
            label: self.label,
            last_accessed: to_u64(self.last_accessed),
            decayed_at: to_u64(self.decayed_at),
            layer_state: LayerState::from_str_lossy(&self.layer_state),
            summary: self.summary,
        };
        let profile = CompressionProfile {
            fragment_id: id,
            entropy: self.entropy,
            structural_depth: to_usize(self.structural_depth),
            depth_score: self.depth_score,
            repetition_density: self.repetition_density,
            token_count: to_usize(self.token_count),
            tier: FidelityTier::from_str_lossy(&self.profile_tier),
            scheme: CompressionScheme::from_str_lossy(&self.scheme),
            analyzed_at: to_u64(self.analyzed_at),
        };
        let seed = EncodedSeed {
            motif: MotifHandle(to_u32(self.motif)),
            base: self.base.map(|b| MotifHandle(to_u32(b))),
            stored_bytes: to_usize(self.stored_bytes),
            original_len: to_usize(self.original_len),
            depth: to_usize(self.depth),
        };
        Ok(FragmentRecord {
            header,
            seed,
            profile,
        })
    }
}

fn set_metadata_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn save_motif_on(conn: &Connection, node: &MotifNode) -> Result<()> {
    conn.execute(
        "INSERT INTO motifs (handle, origin, base, body, summary, depth, content_len)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            i64::from(node.handle.0),
            node.origin.map(|o| o.to_string()),
            node.base.map(|b| i64::from(b.0)),
            serde_json::to_string(&node.body)?,
            node.summary,
            node.depth as i64,
            node.content_len as i64,
        ],
    )?;
    Ok(())
}

fn save_fragment_on(conn: &Connection, record: &FragmentRecord) -> Result<()> {
    let h = &record.header;
    let id = h.id.to_string();
    conn.execute(
        "INSERT INTO fragments (id, content_type, tier, fidelity, compression_ratio, cluster_id,
                                label, created_at, last_accessed, decayed_at, layer_state,
                                summary, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            id,
            h.content_type.as_str(),
            h.tier.as_str(),
            h.fidelity,
            h.compression_ratio,
            h.cluster.map(|c| i64::from(c.0)),
            h.label,
            h.created_at as i64,
            h.last_accessed as i64,
            h.decayed_at as i64,
            h.layer_state.as_str(),
            h.summary,
            serde_json::to_string(&h.embedding)?,
        ],
    )?;

    let p = &record.profile;
    conn.execute(
        "INSERT INTO compression_profiles (fragment_id, entropy, structural_depth, depth_score,
                                           repetition_density, token_count, tier, scheme,
                                           analyzed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            p.entropy,
            p.structural_depth as i64,
            p.depth_score,
            p.repetition_density,
            p.token_count as i64,
            p.tier.as_str(),
            p.scheme.as_str(),
            p.analyzed_at as i64,
        ],
    )?;

    let s = &record.seed;
    conn.execute(
        "INSERT INTO seeds (fragment_id, motif, base, stored_bytes, original_len, depth)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            i64::from(s.motif.0),
            s.base.map(|b| i64::from(b.0)),
            s.stored_bytes as i64,
            s.original_len as i64,
            s.depth as i64,
        ],
    )?;
    Ok(())
}

fn save_cluster_on(conn: &Connection, cluster: &ConceptCluster) -> Result<()> {
    conn.execute(
        "INSERT INTO clusters (id, depth, parent, children, members, centroid, cohesion)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            i64::from(cluster.id.0),
            cluster.depth as i64,
            cluster.parent.map(|p| i64::from(p.0)),
            serde_json::to_string(&cluster.children)?,
            serde_json::to_string(&cluster.members)?,
            serde_json::to_string(&cluster.centroid)?,
            cluster.cohesion,
        ],
    )?;
    Ok(())
}

fn save_branch_on(conn: &Connection, branch: &CausalBranch) -> Result<()> {
    conn.execute(
        "INSERT INTO branches (id, parent, weight, delta, coherence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            branch.id as i64,
            branch.parent.to_string(),
            branch.weight,
            serde_json::to_string(&branch.delta)?,
            branch.coherence,
            branch.created_at as i64,
        ],
    )?;
    Ok(())
}

fn append_events_on(conn: &Connection, events: &[AccessEvent]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO access_events
             (seq, observer, fragment_id, layer, timestamp, fidelity_delta)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    let mut written = 0;
    for e in events {
        written += stmt.execute(params![
            e.seq as i64,
            e.observer,
            e.fragment.to_string(),
            e.layer.as_str(),
            e.timestamp as i64,
            e.fidelity_delta,
        ])?;
    }
    Ok(written)
}

fn rebuild_meta_memory_on(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DELETE FROM meta_memory;
         INSERT INTO meta_memory (fragment_id, access_count, cognitive_drift)
         SELECT fragment_id, COUNT(*), SUM(fidelity_delta)
         FROM access_events GROUP BY fragment_id;",
    )?;
    Ok(())
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("invalid UUID '{s}': {e}")))
}

// SQLite integers are i64; every stored count, id and timestamp is
// non-negative, so negative values clamp to zero.
fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn to_usize(v: i64) -> usize {
    usize::try_from(v).unwrap_or(0)
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fm_core::{EngineConfig, IngestMetadata, ManualClock, MemoryEngine};

    const NOTE: &str = "Tidal locking keeps one face of the moon turned toward the earth \
        because its rotation period matches its orbital period.";

    fn engine() -> MemoryEngine {
        MemoryEngine::with_parts(
            EngineConfig::default(),
            Arc::new(ManualClock::new(1_000)),
            None,
        )
        .unwrap()
    }

    fn populated() -> MemoryEngine {
        let e = engine();
        let a = e.ingest(NOTE, IngestMetadata::text().with_label("moon")).unwrap();
        e.ingest(&NOTE.replace("moon", "satellite"), IngestMetadata::text())
            .unwrap();
        e.ingest(r#"{"orbit": {"period_days": 27.3}}"#, IngestMetadata::json())
            .unwrap();
        e.access(a, "end-user", Layer::Core).unwrap();
        e.access(a, "primary-agent", Layer::Deep).unwrap();
        let state = e.request_branches(a, &[], 2).unwrap();
        let winner = e.collapse(state.id).unwrap();
        e.persist_branch(&winner).unwrap();
        e.rebuild(1);
        e
    }

    #[test]
    fn test_checkpoint_load_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let engine = populated();
        let snapshot = engine.snapshot();

        store.checkpoint(&snapshot).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_checkpoint_overwrites_previous() {
        let store = Store::open_in_memory().unwrap();
        let engine = populated();
        store.checkpoint(&engine.snapshot()).unwrap();
        store.checkpoint(&engine.snapshot()).unwrap();
        assert_eq!(store.fragment_count().unwrap(), 3);
        assert_eq!(store.access_events_since(0).unwrap().len(), 2);
    }

    #[test]
    fn test_events_appended_after_checkpoint_are_loaded() {
        let store = Store::open_in_memory().unwrap();
        let engine = populated();
        store.checkpoint(&engine.snapshot()).unwrap();
        assert_eq!(store.last_checkpoint_seq().unwrap(), 2);

        let id = engine.fragment_ids()[0];
        engine.access(id, "plugin", Layer::Surface).unwrap();
        let fresh = engine.access_events_since(store.last_event_seq().unwrap());
        assert_eq!(fresh.len(), 1);
        assert_eq!(store.append_events(&fresh).unwrap(), 1);
        // resending is harmless
        assert_eq!(store.append_events(&fresh).unwrap(), 0);

        assert_eq!(store.last_checkpoint_seq().unwrap(), 2);
        assert_eq!(store.last_event_seq().unwrap(), 3);
        let loaded = store.load().unwrap();
        assert_eq!(loaded.access_log.len(), 3);
    }

    #[test]
    fn test_meta_memory_derived_from_events() {
        let store = Store::open_in_memory().unwrap();
        let engine = populated();
        store.checkpoint(&engine.snapshot()).unwrap();

        let log = engine.access_events_since(0);
        let target = log[0].fragment;
        let drift: f64 = log.iter().map(|e| e.fidelity_delta).sum();
        let (count, stored_drift) = store.meta_memory(target).unwrap().unwrap();
        assert_eq!(count, 2);
        assert!((stored_drift - drift).abs() < 1e-12);

        store.conn().execute_batch("DELETE FROM meta_memory;").unwrap();
        assert!(store.meta_memory(target).unwrap().is_none());
        store.rebuild_meta_memory().unwrap();
        assert_eq!(store.meta_memory(target).unwrap().unwrap().0, 2);
    }

    #[test]
    fn test_restored_engine_continues() {
        let store = Store::open_in_memory().unwrap();
        let engine = populated();
        store.checkpoint(&engine.snapshot()).unwrap();

        let restored = MemoryEngine::restore(
            EngineConfig::default(),
            Arc::new(ManualClock::new(2_000)),
            None,
            store.load().unwrap(),
        )
        .unwrap();
        let id = engine.fragment_ids()[0];
        assert_eq!(
            restored.read(id, 1.0).unwrap().content,
            engine.read(id, 1.0).unwrap().content
        );
        let out = restored.access(id, "plugin", Layer::Surface).unwrap();
        assert!(out.fidelity > 0.0);
        assert_eq!(restored.access_events_since(2).len(), 1);
    }

    #[test]
    fn test_load_empty_db() {
        let store = Store::open_in_memory().unwrap();
        let snapshot = store.load().unwrap();
        assert!(snapshot.is_empty());
        assert!(snapshot.access_log.is_empty());
        assert_eq!(store.last_checkpoint_seq().unwrap(), 0);
    }

    #[test]
    fn test_cursor_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let fresh = store.load_cursors().unwrap();
        assert_eq!(fresh.reanalysis_pos, 0);
        assert!(fresh.retry.is_empty());

        let mut cursors = MaintenanceCursors {
            reanalysis_pos: 7,
            ..MaintenanceCursors::default()
        };
        cursors.retry.insert(Uuid::new_v4());
        store.save_cursors(&cursors).unwrap();

        let loaded = store.load_cursors().unwrap();
        assert_eq!(loaded.reanalysis_pos, 7);
        assert_eq!(loaded.retry, cursors.retry);
        assert!(loaded.rebuild.is_none());
    }

    #[test]
    fn test_metadata() {
        let store = Store::open_in_memory().unwrap();

        assert!(store.get_metadata("foo").unwrap().is_none());

        store.set_metadata("foo", "bar").unwrap();
        assert_eq!(store.get_metadata("foo").unwrap(), Some("bar".to_string()));

        store.set_metadata("foo", "baz").unwrap();
        assert_eq!(store.get_metadata("foo").unwrap(), Some("baz".to_string()));
    }

    #[test]
    fn test_damaged_motif_table_rejected() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO motifs (handle, body, summary, depth, content_len)
                 VALUES (3, '\"evicted\"', 's', 0, 1)",
                [],
            )
            .unwrap();
        assert!(matches!(store.load(), Err(StoreError::InvalidData(_))));
    }
}
