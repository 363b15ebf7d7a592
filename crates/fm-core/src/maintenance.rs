//! Background upkeep: decay, superposition expiry, incremental
//! re-analysis and resumable hierarchy rebuilds.
//!
//! `Maintenance` owns the cursors that make work resumable across cycles.
//! `MaintenancePool` runs tasks on blocking worker threads and stops on a
//! `CancellationToken`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MaintenanceConfig;
use crate::engine::MemoryEngine;
use crate::error::{EngineError, Result};
use crate::fragment::FragmentId;
use crate::hierarchy::RebuildJob;

const TASK_QUEUE: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MaintenanceTask {
    DecaySweep,
    PurgeSuperpositions,
    /// Next batch of fragments, plus anything that failed last time.
    Reanalyze,
    Rebuild { depth: usize },
    /// Evict motifs of degraded fragments nothing derives from.
    Compact,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    Decayed(usize),
    Purged(usize),
    Reanalyzed {
        analyzed: usize,
        tier_changes: usize,
        failed: usize,
    },
    Rebuilt,
    /// The rebuild stopped early; its job was kept for the next attempt.
    RebuildSuspended { iteration: usize },
    Compacted(usize),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub outcomes: Vec<TaskOutcome>,
    pub cancelled: bool,
}

/// Where maintenance left off. Owned by a `Maintenance` and copied out by
/// `cursors`, so a new instance can pick up the same work.
#[derive(Clone, Default)]
pub struct MaintenanceCursors {
    pub reanalysis_pos: usize,
    pub retry: BTreeSet<FragmentId>,
    pub rebuild: Option<RebuildJob>,
}

pub struct Maintenance {
    engine: Arc<MemoryEngine>,
    config: MaintenanceConfig,
    cursors: Mutex<MaintenanceCursors>,
}

impl Maintenance {
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self::with_cursors(engine, MaintenanceCursors::default())
    }

    pub fn with_cursors(engine: Arc<MemoryEngine>, cursors: MaintenanceCursors) -> Self {
        let config = engine.config().maintenance.clone();
        Self {
            engine,
            config,
            cursors: Mutex::new(cursors),
        }
    }

    /// A copy of the current cursors, taken between tasks.
    pub fn cursors(&self) -> MaintenanceCursors {
        self.cursors.lock().clone()
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    /// Fragments waiting for a re-analysis retry.
    pub fn pending_retries(&self) -> Vec<FragmentId> {
        self.cursors.lock().retry.iter().copied().collect()
    }

    pub fn has_suspended_rebuild(&self) -> bool {
        self.cursors.lock().rebuild.is_some()
    }

    pub fn run_task(&self, task: &MaintenanceTask, cancel: &CancellationToken) -> TaskOutcome {
        match task {
            MaintenanceTask::DecaySweep => TaskOutcome::Decayed(self.engine.decay_sweep()),
            MaintenanceTask::PurgeSuperpositions => {
                TaskOutcome::Purged(self.engine.purge_superpositions())
            }
            MaintenanceTask::Reanalyze => self.reanalyze_batch(),
            MaintenanceTask::Rebuild { depth } => self.rebuild(*depth, cancel),
            MaintenanceTask::Compact => TaskOutcome::Compacted(self.engine.compact()),
        }
    }

    /// One pass over the routine tasks. Stops between tasks once cancelled.
    pub fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let tasks = [
            MaintenanceTask::DecaySweep,
            MaintenanceTask::PurgeSuperpositions,
            MaintenanceTask::Reanalyze,
            MaintenanceTask::Rebuild {
                depth: self.config.rebuild_depth,
            },
        ];
        let mut report = CycleReport::default();
        for task in &tasks {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = self.run_task(task, cancel);
            if matches!(outcome, TaskOutcome::RebuildSuspended { .. }) {
                report.cancelled = true;
            }
            report.outcomes.push(outcome);
        }
        tracing::debug!(tasks = report.outcomes.len(), cancelled = report.cancelled, "maintenance cycle");
        report
    }

    fn reanalyze_batch(&self) -> TaskOutcome {
        let ids = self.engine.fragment_ids();
        let batch = {
            let mut cursors = self.cursors.lock();
            let mut batch: Vec<FragmentId> = std::mem::take(&mut cursors.retry).into_iter().collect();
            if !ids.is_empty() {
                let start = cursors.reanalysis_pos % ids.len();
                let take = self.config.reanalysis_batch.min(ids.len());
                batch.extend(ids.iter().cycle().skip(start).take(take).copied());
                cursors.reanalysis_pos = (start + take) % ids.len();
            }
            batch.sort();
            batch.dedup();
            batch
        };

        let report = self.engine.reanalyze(&batch);
        if !report.failed.is_empty() {
            tracing::warn!(failed = report.failed.len(), "re-analysis failures queued for retry");
            // Fragments that were deleted meanwhile are dropped, not retried
            let live: BTreeSet<FragmentId> = ids.into_iter().collect();
            self.cursors
                .lock()
                .retry
                .extend(report.failed.iter().filter(|id| live.contains(id)));
        }
        TaskOutcome::Reanalyzed {
            analyzed: report.analyzed,
            tier_changes: report.tier_changes,
            failed: report.failed.len(),
        }
    }

    /// Resume a suspended job when the fragment set has not changed size,
    /// otherwise start over.
    fn rebuild(&self, depth: usize, cancel: &CancellationToken) -> TaskOutcome {
        let suspended = self.cursors.lock().rebuild.take();
        let mut job = match suspended {
            Some(job) if job.snapshot_len() == self.engine.fragment_count() => {
                tracing::debug!(iteration = job.iteration(), "resuming rebuild");
                job
            }
            _ => self.engine.start_rebuild(depth),
        };

        if job.run(|| cancel.is_cancelled()) {
            self.engine.install_rebuild(job);
            TaskOutcome::Rebuilt
        } else {
            let iteration = job.iteration();
            tracing::info!(iteration, "rebuild suspended");
            self.cursors.lock().rebuild = Some(job);
            TaskOutcome::RebuildSuspended { iteration }
        }
    }
}

/// Worker pool draining a shared task queue on blocking threads.
pub struct MaintenancePool {
    tx: mpsc::Sender<MaintenanceTask>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    outcomes: Arc<Mutex<Vec<TaskOutcome>>>,
}

impl MaintenancePool {
    /// Must be called from within a tokio runtime.
    pub fn spawn(maintenance: Arc<Maintenance>, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<MaintenanceTask>(TASK_QUEUE);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = CancellationToken::new();
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let cancel = cancel.clone();
                let maintenance = maintenance.clone();
                let outcomes = outcomes.clone();
                tokio::spawn(async move {
                    loop {
                        let task = tokio::select! {
                            _ = cancel.cancelled() => break,
                            task = async { rx.lock().await.recv().await } => task,
                        };
                        let Some(task) = task else { break };

                        let m = maintenance.clone();
                        let c = cancel.clone();
                        match tokio::task::spawn_blocking(move || m.run_task(&task, &c)).await {
                            Ok(outcome) => outcomes.lock().push(outcome),
                            Err(e) => tracing::error!(worker, error = %e, "maintenance task panicked"),
                        }
                    }
                    tracing::debug!(worker, "maintenance worker stopped");
                })
            })
            .collect();

        Self {
            tx,
            cancel,
            workers: handles,
            outcomes,
        }
    }

    pub async fn submit(&self, task: MaintenanceTask) -> Result<()> {
        self.tx.send(task).await.map_err(|_| EngineError::Cancelled)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Let queued tasks finish, then stop the workers.
    pub async fn drain(self) -> Vec<TaskOutcome> {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.await;
        }
        std::mem::take(&mut *self.outcomes.lock())
    }

    /// Cancel running work and stop the workers.
    pub async fn shutdown(self) -> Vec<TaskOutcome> {
        self.cancel.cancel();
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.await;
        }
        std::mem::take(&mut *self.outcomes.lock())
    }
}

/// Run a cycle every `interval` until cancelled.
pub async fn run_periodic(
    maintenance: Arc<Maintenance>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let m = maintenance.clone();
        let c = cancel.clone();
        match tokio::task::spawn_blocking(move || m.run_cycle(&c)).await {
            Ok(report) if report.cancelled => break,
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "maintenance cycle panicked"),
        }
    }
    tracing::info!("periodic maintenance stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::IngestMetadata;
    use crate::time::ManualClock;

    const DOCS: [&str; 4] = [
        "Rust ownership rules prevent data races at compile time.",
        "Borrowed references in Rust must never outlive their owners.",
        "Sourdough bread needs a lively starter and a long proof.",
        "A hot oven and steam give sourdough bread its crust.",
    ];

    fn setup(batch: usize) -> (Arc<Maintenance>, Arc<ManualClock>, Vec<FragmentId>) {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = EngineConfig::default();
        config.maintenance.reanalysis_batch = batch;
        let engine = Arc::new(MemoryEngine::with_parts(config, clock.clone(), None).unwrap());
        let ids = DOCS
            .iter()
            .map(|d| engine.ingest(d, IngestMetadata::text()).unwrap())
            .collect();
        (Arc::new(Maintenance::new(engine)), clock, ids)
    }

    #[test]
    fn test_reanalysis_cursor_wraps() {
        let (m, _, _) = setup(3);
        let c = CancellationToken::new();
        for _ in 0..3 {
            match m.run_task(&MaintenanceTask::Reanalyze, &c) {
                TaskOutcome::Reanalyzed { analyzed, failed, .. } => {
                    assert_eq!(analyzed, 3);
                    assert_eq!(failed, 0);
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        // 9 fragments read in total over 4 fragments: cursor is at 9 % 4
        assert_eq!(m.cursors.lock().reanalysis_pos, 1);
    }

    #[test]
    fn test_failed_reanalysis_is_retried() {
        let (m, _, ids) = setup(8);
        let seed = m.engine().seed(ids[0]).unwrap();
        m.engine().evict_motif(seed.motif);

        let c = CancellationToken::new();
        m.run_task(&MaintenanceTask::Reanalyze, &c);
        assert!(m.pending_retries().contains(&ids[0]));

        match m.run_task(&MaintenanceTask::Reanalyze, &c) {
            TaskOutcome::Reanalyzed { failed, .. } => assert!(failed >= 1),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_rebuild_resumes() {
        let (m, _, _) = setup(8);
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let outcome = m.run_task(&MaintenanceTask::Rebuild { depth: 1 }, &cancelled);
        assert!(matches!(outcome, TaskOutcome::RebuildSuspended { .. }));
        assert!(m.has_suspended_rebuild());

        // a fresh instance picks up the suspended job
        let engine = m.engine().clone();
        let m = Maintenance::with_cursors(engine, m.cursors());
        assert!(m.has_suspended_rebuild());

        let live = CancellationToken::new();
        let outcome = m.run_task(&MaintenanceTask::Rebuild { depth: 1 }, &live);
        assert_eq!(outcome, TaskOutcome::Rebuilt);
        assert!(!m.has_suspended_rebuild());
        assert_eq!(m.engine().cluster_index().fragment_count(), DOCS.len());
    }

    #[test]
    fn test_cursors_copied_while_shared() {
        let (m, _, _) = setup(3);
        let worker = m.clone();
        worker.run_task(&MaintenanceTask::Reanalyze, &CancellationToken::new());
        assert!(Arc::strong_count(&m) > 1);
        let cursors = m.cursors();
        assert_eq!(cursors.reanalysis_pos, 3);
        assert!(cursors.retry.is_empty());
    }

    #[test]
    fn test_cycle_runs_every_routine_task() {
        let (m, clock, _) = setup(2);
        clock.advance(1_000);
        let report = m.run_cycle(&CancellationToken::new());
        assert!(!report.cancelled);
        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.outcomes[0], TaskOutcome::Decayed(DOCS.len()));
        assert_eq!(report.outcomes[3], TaskOutcome::Rebuilt);
    }

    #[test]
    fn test_cycle_stops_when_cancelled() {
        let (m, _, _) = setup(2);
        let c = CancellationToken::new();
        c.cancel();
        let report = m.run_cycle(&c);
        assert!(report.cancelled);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_drains_queue() {
        let (m, _, _) = setup(8);
        let pool = MaintenancePool::spawn(m.clone(), 2);
        pool.submit(MaintenanceTask::DecaySweep).await.unwrap();
        pool.submit(MaintenanceTask::Reanalyze).await.unwrap();
        pool.submit(MaintenanceTask::Rebuild { depth: 1 }).await.unwrap();
        let outcomes = pool.drain().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.contains(&TaskOutcome::Rebuilt));
    }

    #[tokio::test]
    async fn test_pool_shutdown_stops_workers() {
        let (m, _, _) = setup(8);
        let pool = MaintenancePool::spawn(m, 3);
        let token = pool.cancellation_token();
        pool.shutdown().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_periodic_stops_on_cancel() {
        let (m, _, _) = setup(2);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_periodic(m, Duration::from_millis(10), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
