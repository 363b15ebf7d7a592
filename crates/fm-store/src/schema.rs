use rusqlite::Connection;

use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: i64 = 2;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every ~400KB instead of the default ~4MB
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Stale WAL data from a crashed process. In-memory DBs and fresh files
    // legitimately fail this.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fragments (
            id                TEXT PRIMARY KEY,
            content_type      TEXT NOT NULL,
            tier              TEXT NOT NULL,
            fidelity          REAL NOT NULL,
            compression_ratio REAL NOT NULL,
            cluster_id        INTEGER,
            label             TEXT,
            created_at        INTEGER NOT NULL,
            last_accessed     INTEGER NOT NULL,
            decayed_at        INTEGER NOT NULL DEFAULT 0,
            layer_state       TEXT NOT NULL DEFAULT 'unobserved',
            summary           TEXT NOT NULL DEFAULT '',
            embedding         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS compression_profiles (
            fragment_id        TEXT PRIMARY KEY REFERENCES fragments(id),
            entropy            REAL NOT NULL,
            structural_depth   INTEGER NOT NULL,
            depth_score        REAL NOT NULL,
            repetition_density REAL NOT NULL,
            token_count        INTEGER NOT NULL,
            tier               TEXT NOT NULL,
            scheme             TEXT NOT NULL,
            analyzed_at        INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS motifs (
            handle      INTEGER PRIMARY KEY,
            origin      TEXT,
            base        INTEGER,
            body        TEXT NOT NULL,
            summary     TEXT NOT NULL,
            depth       INTEGER NOT NULL,
            content_len INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS seeds (
            fragment_id  TEXT PRIMARY KEY REFERENCES fragments(id),
            motif        INTEGER NOT NULL REFERENCES motifs(handle),
            base         INTEGER,
            stored_bytes INTEGER NOT NULL,
            original_len INTEGER NOT NULL,
            depth        INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS clusters (
            id       INTEGER PRIMARY KEY,
            depth    INTEGER NOT NULL,
            parent   INTEGER,
            children TEXT NOT NULL,
            members  TEXT NOT NULL,
            centroid TEXT NOT NULL,
            cohesion REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS access_events (
            seq            INTEGER PRIMARY KEY,
            observer       TEXT NOT NULL,
            fragment_id    TEXT NOT NULL,
            layer          TEXT NOT NULL,
            timestamp      INTEGER NOT NULL,
            fidelity_delta REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS meta_memory (
            fragment_id     TEXT PRIMARY KEY,
            access_count    INTEGER NOT NULL,
            cognitive_drift REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branches (
            id         INTEGER PRIMARY KEY,
            parent     TEXT NOT NULL,
            weight     REAL NOT NULL,
            delta      TEXT NOT NULL,
            coherence  REAL NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_fragment ON access_events(fragment_id);
        CREATE INDEX IF NOT EXISTS idx_fragments_cluster ON fragments(cluster_id);
        CREATE INDEX IF NOT EXISTS idx_branches_parent ON branches(parent);
        ",
    )?;

    if let Some(found) = get_schema_version(conn)?
        && found > SCHEMA_VERSION
    {
        return Err(StoreError::InvalidData(format!(
            "database schema v{found} is newer than supported v{SCHEMA_VERSION}"
        )));
    }

    // v1 databases predate decay bookkeeping: backfill from last access
    if conn
        .prepare("SELECT decayed_at FROM fragments LIMIT 0")
        .is_err()
    {
        conn.execute_batch(
            "ALTER TABLE fragments ADD COLUMN decayed_at INTEGER NOT NULL DEFAULT 0;
             UPDATE fragments SET decayed_at = last_accessed;",
        )?;
        tracing::info!("migrated fragments table: added decayed_at");
    }

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
