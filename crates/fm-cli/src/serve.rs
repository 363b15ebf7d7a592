//! Long-running mode: periodic maintenance in the background, one fragment
//! ingested per stdin line (`?text` lines query instead). Exits cleanly on
//! stdin EOF, ctrl-c or SIGTERM.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fm_core::{EngineEvent, IngestMetadata, Layer, Maintenance, MemoryEngine, run_periodic};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Session;

const QUERY_LIMIT: usize = 3;

/// Spawn a reader thread forwarding stdin lines. The channel closes on EOF.
///
/// A plain thread rather than `spawn_blocking`: a blocked stdin read must
/// not hold up runtime shutdown after a signal.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Resolves on SIGTERM. The handler is installed before this returns, so a
/// signal sent right after startup is not lost.
#[cfg(unix)]
fn terminate() -> Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sig = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    Ok(async move {
        sig.recv().await;
    })
}

#[cfg(not(unix))]
fn terminate() -> Result<impl std::future::Future<Output = ()>> {
    Ok(std::future::pending::<()>())
}

/// Print the best hits, one `<id> <score>` line each, then a `.` line.
/// Only the new access events are written; fragment state waits for the
/// next checkpoint.
fn answer(session: &Session, engine: &MemoryEngine, query: &str) -> Result<()> {
    match engine.query_text("end-user", query, Layer::Surface, QUERY_LIMIT) {
        Ok(hits) => {
            for hit in hits {
                println!("{} {:.3}", hit.id, hit.score);
            }
        }
        Err(e) => tracing::warn!("query failed: {e}"),
    }
    println!(".");

    let after = session.store.last_event_seq()?;
    let written = session.store.append_events(&engine.access_events_since(after))?;
    tracing::debug!(written, "appended access events");
    Ok(())
}

pub(crate) async fn run(session: &Session, interval_ms: Option<u64>) -> Result<()> {
    let engine = Arc::new(session.engine()?);
    let cursors = session
        .store
        .load_cursors()
        .context("failed to load maintenance cursors")?;
    let maintenance = Arc::new(Maintenance::with_cursors(engine.clone(), cursors));
    let interval =
        Duration::from_millis(interval_ms.unwrap_or(engine.config().maintenance.interval_ms).max(1));

    let cancel = CancellationToken::new();
    let periodic = tokio::spawn(run_periodic(maintenance.clone(), interval, cancel.clone()));

    let sigterm = terminate()?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
            _ = sigterm => tracing::info!("terminated, shutting down"),
        }
    };
    tokio::pin!(shutdown);

    let mut events = engine.subscribe();
    let mut lines = stdin_lines();
    tracing::info!(store = session.location.name(), ?interval, "serving");
    println!("serving store '{}'", session.location.name());

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    tracing::info!("stdin closed, shutting down");
                    break;
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if let Some(query) = text.strip_prefix('?') {
                    answer(session, &engine, query.trim())?;
                    continue;
                }
                match engine.ingest(text, IngestMetadata::text()) {
                    Ok(id) => {
                        println!("{id}");
                        session.checkpoint(&engine)?;
                    }
                    Err(e) => tracing::warn!("ingest failed: {e}"),
                }
            }
            event = events.recv() => {
                if let Ok(EngineEvent::DegradedMode { reason }) = event {
                    tracing::warn!("degraded mode: {reason}");
                }
            }
            _ = &mut shutdown => break,
        }
    }

    cancel.cancel();
    if let Err(e) = periodic.await {
        tracing::error!("maintenance loop panicked: {e}");
    }

    session.checkpoint(&engine)?;
    session.store.save_cursors(&maintenance.cursors())?;
    session
        .store
        .conn()
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .context("failed to checkpoint WAL")?;
    Ok(())
}
