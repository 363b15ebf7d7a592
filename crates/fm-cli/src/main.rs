mod serve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fm_core::{
    CircuitTemplate, ContentType, EncodingSource, EngineConfig, EngineError, FragmentId,
    IngestMetadata, Layer, Maintenance, MaintenancePool, MaintenanceTask, MemoryEngine,
    ScenarioHint, SystemClock, TaskOutcome,
};
use fm_store::{Store, StoreLocation, load_config};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "fm", about = "Fractal memory engine CLI")]
struct Cli {
    /// Named store under the data directory
    #[arg(long, global = true)]
    store: Option<String>,

    /// Engine config (TOML). Defaults to fm.toml in the data directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LayerArg {
    Surface,
    Core,
    Deep,
}

impl From<LayerArg> for Layer {
    fn from(l: LayerArg) -> Self {
        match l {
            LayerArg::Surface => Layer::Surface,
            LayerArg::Core => Layer::Core,
            LayerArg::Deep => Layer::Deep,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest text or JSON files
    Ingest {
        /// File path(s) to ingest
        files: Vec<PathBuf>,

        /// Ingest all .txt, .md and .json files in a directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Treat every file as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rank fragments against a text query
    Query {
        text: String,

        #[arg(long, default_value = "end-user")]
        observer: String,

        #[arg(long, value_enum, default_value = "surface")]
        layer: LayerArg,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Observe one fragment
    Access {
        id: String,

        #[arg(long, default_value = "end-user")]
        observer: String,

        #[arg(long, value_enum, default_value = "deep")]
        layer: LayerArg,
    },

    /// Simulate alternative continuations of a fragment and collapse them
    Branch {
        id: String,

        /// Scenario hint; repeat for several
        #[arg(long = "hint")]
        hints: Vec<String>,

        /// Number of branches
        #[arg(short = 'n', default_value_t = 3)]
        count: usize,

        /// Store the winning branch as a new fragment
        #[arg(long)]
        commit: bool,

        /// Also measure the branch set through the quantum bridge
        #[arg(long)]
        quantum: bool,
    },

    /// Rebuild the concept-cluster hierarchy
    Rebuild {
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Run maintenance cycles on the worker pool
    Maintain {
        #[arg(long, default_value_t = 1)]
        cycles: usize,

        #[arg(long)]
        workers: Option<usize>,
    },

    /// Keep the engine open: run periodic maintenance and ingest stdin lines
    Serve {
        /// Maintenance interval; defaults to the configured one
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Show engine statistics
    Stats,

    /// Export state to a JSON file
    Export { path: PathBuf },

    /// Import state from a JSON file
    Import { path: PathBuf },
}

pub(crate) struct Session {
    location: StoreLocation,
    store: Store,
    config: EngineConfig,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let location = StoreLocation::new(cli.store.as_deref(), None);
        let config = load_config(cli.config.as_deref(), &location.config_path())
            .context("failed to load config")?;
        let store = location
            .open()
            .with_context(|| format!("failed to open store '{}'", location.name()))?;
        Ok(Self {
            location,
            store,
            config,
        })
    }

    /// Restore the engine from the last checkpoint.
    pub(crate) fn engine(&self) -> Result<MemoryEngine> {
        let snapshot = self.store.load().context("failed to load checkpoint")?;
        let engine = MemoryEngine::restore(
            self.config.clone(),
            Arc::new(SystemClock),
            None,
            snapshot,
        )
        .context("failed to restore engine")?;
        Ok(engine)
    }

    pub(crate) fn checkpoint(&self, engine: &MemoryEngine) -> Result<()> {
        self.store
            .checkpoint(&engine.snapshot())
            .context("failed to write checkpoint")
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let session = Session::open(&cli)?;

    match &cli.command {
        Commands::Ingest { files, dir, json } => {
            cmd_ingest(&session, files, dir.as_deref(), *json)
        }
        Commands::Query {
            text,
            observer,
            layer,
            limit,
        } => cmd_query(&session, text, observer, (*layer).into(), *limit),
        Commands::Access {
            id,
            observer,
            layer,
        } => cmd_access(&session, id, observer, (*layer).into()),
        Commands::Branch {
            id,
            hints,
            count,
            commit,
            quantum,
        } => cmd_branch(&session, id, hints, *count, *commit, *quantum),
        Commands::Rebuild { depth } => cmd_rebuild(&session, *depth).await,
        Commands::Maintain { cycles, workers } => cmd_maintain(&session, *cycles, *workers).await,
        Commands::Serve { interval_ms } => serve::run(&session, *interval_ms).await,
        Commands::Stats => cmd_stats(&session),
        Commands::Export { path } => cmd_export(&session, path),
        Commands::Import { path } => cmd_import(&session, path),
    }
}

fn parse_id(id: &str) -> Result<FragmentId> {
    FragmentId::parse_str(id).with_context(|| format!("invalid fragment id '{id}'"))
}

fn preview(text: &str, max: usize) -> String {
    let line = text.replace('\n', " ");
    if line.chars().count() <= max {
        line
    } else {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}…")
    }
}

fn collect_paths(files: &[PathBuf], dir: Option<&Path>) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = files.to_vec();

    if let Some(dir) = dir {
        let mut found = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read dir {}", dir.display()))?;
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_file()
                && let Some(ext) = p.extension().and_then(|e| e.to_str())
                && matches!(ext, "txt" | "md" | "json")
            {
                found.push(p);
            }
        }
        found.sort();
        paths.extend(found);
    }

    if paths.is_empty() {
        bail!("nothing to ingest: pass files or --dir");
    }
    Ok(paths)
}

fn cmd_ingest(session: &Session, files: &[PathBuf], dir: Option<&Path>, json: bool) -> Result<()> {
    let engine = session.engine()?;
    let paths = collect_paths(files, dir)?;

    for path in &paths {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed");
        let is_json = json || path.extension().is_some_and(|e| e == "json");
        let metadata = if is_json {
            IngestMetadata::json()
        } else {
            IngestMetadata::text()
        };
        let id = engine
            .ingest(&content, metadata.with_label(name))
            .with_context(|| format!("failed to ingest {}", path.display()))?;
        let header = engine.header(id)?;
        println!(
            "ingested {} → {} ({}, ratio {:.2})",
            path.display(),
            id,
            header.tier.as_str(),
            header.compression_ratio
        );
    }

    session.checkpoint(&engine)?;
    println!("done. fragments={}", engine.fragment_count());
    Ok(())
}

fn cmd_query(
    session: &Session,
    text: &str,
    observer: &str,
    layer: Layer,
    limit: usize,
) -> Result<()> {
    let engine = session.engine()?;
    let hits = engine
        .query_text(observer, text, layer, limit)
        .context("query failed")?;

    if hits.is_empty() {
        println!("(no memories found)");
    }
    for hit in &hits {
        println!(
            "{:.3}  {}  [{}] {}",
            hit.score,
            hit.id,
            hit.tier.as_str(),
            hit.label.as_deref().unwrap_or("-")
        );
        println!("    {}", preview(hit.view.text(), 120));
    }

    session.checkpoint(&engine)
}

fn cmd_access(session: &Session, id: &str, observer: &str, layer: Layer) -> Result<()> {
    let engine = session.engine()?;
    let id = parse_id(id)?;
    let outcome = match engine.access(id, observer, layer) {
        Ok(outcome) => outcome,
        Err(e) if e.is_not_found() => {
            bail!("no fragment {id} in store '{}'", session.location.name())
        }
        Err(e) => return Err(e).with_context(|| format!("failed to access {id}")),
    };

    println!("fragment: {id}");
    println!("layer:    {}", outcome.view.layer().as_str());
    println!("tier:     {}", outcome.tier.as_str());
    println!(
        "fidelity: {:.3} ({:+.3})",
        outcome.fidelity, outcome.fidelity_delta
    );
    println!();
    println!("{}", outcome.view.text());

    session.checkpoint(&engine)
}

fn cmd_branch(
    session: &Session,
    id: &str,
    hints: &[String],
    count: usize,
    commit: bool,
    quantum: bool,
) -> Result<()> {
    let engine = session.engine()?;
    let id = parse_id(id)?;
    let hints: Vec<ScenarioHint> = hints.iter().map(ScenarioHint::new).collect();

    let state = engine
        .request_branches(id, &hints, count)
        .context("failed to simulate branches")?;
    for (branch, p) in state.branches.iter().zip(state.probabilities()) {
        println!(
            "branch {:>3}  p={:.3}  coherence={:.3}",
            branch.id, p, branch.coherence
        );
    }

    if quantum {
        let encoding = engine
            .encode_to_circuit(
                EncodingSource::BranchSet(state.id),
                CircuitTemplate::CausalSuperposition,
            )
            .context("failed to encode branch set")?;
        let measured = engine.measure(&encoding).context("measurement failed")?;
        println!(
            "measured: {} (fidelity bound {:.2})",
            measured.header.label.as_deref().unwrap_or("-"),
            encoding.fidelity_bound
        );
        println!("{}", preview(&measured.content, 200));
    }

    let winner = engine.collapse(state.id).context("collapse failed")?;
    println!("collapsed → branch {}", winner.id);
    if commit {
        let new_id = engine.commit_branch(&winner)?;
        println!("committed as {new_id}");
    } else {
        engine.persist_branch(&winner)?;
    }

    session.checkpoint(&engine)
}

/// Cancel `token` on ctrl-c. The returned task must be aborted once the
/// guarded work is done.
fn cancel_on_interrupt(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling");
            token.cancel();
        }
    })
}

async fn cmd_rebuild(session: &Session, depth: Option<usize>) -> Result<()> {
    let engine = Arc::new(session.engine()?);
    let depth = depth.unwrap_or(engine.config().maintenance.rebuild_depth);

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_interrupt(cancel.clone());
    let result = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.rebuild_until(depth, &cancel))
            .await
            .context("rebuild task panicked")?
    };
    interrupt.abort();

    match result {
        Ok(()) => {}
        Err(EngineError::Cancelled) => {
            println!("rebuild cancelled, index unchanged");
            return Ok(());
        }
        Err(e) => return Err(e).context("rebuild failed"),
    }
    let index = engine.cluster_index();
    println!(
        "rebuilt: clusters={}, depth={}",
        index.clusters().len(),
        index.max_depth()
    );
    session.checkpoint(&engine)
}

async fn cmd_maintain(session: &Session, cycles: usize, workers: Option<usize>) -> Result<()> {
    let engine = Arc::new(session.engine()?);
    let cursors = session
        .store
        .load_cursors()
        .context("failed to load maintenance cursors")?;
    let maintenance = Arc::new(Maintenance::with_cursors(engine.clone(), cursors));
    let workers = workers.unwrap_or(engine.config().maintenance.workers);
    let depth = engine.config().maintenance.rebuild_depth;

    let pool = MaintenancePool::spawn(maintenance.clone(), workers);
    let interrupt = cancel_on_interrupt(pool.cancellation_token());
    for _ in 0..cycles {
        for task in [
            MaintenanceTask::DecaySweep,
            MaintenanceTask::PurgeSuperpositions,
            MaintenanceTask::Reanalyze,
            MaintenanceTask::Rebuild { depth },
            MaintenanceTask::Compact,
        ] {
            pool.submit(task).await.context("maintenance pool closed")?;
        }
    }
    let outcomes = pool.drain().await;
    interrupt.abort();
    for outcome in &outcomes {
        println!("{}", describe(outcome));
    }
    let retries = maintenance.pending_retries().len();
    if retries > 0 {
        println!("retry: {retries} fragments queued for the next run");
    }
    if maintenance.has_suspended_rebuild() {
        println!("rebuild: suspended, restarts on the next run");
    }

    session.checkpoint(&engine)?;
    session.store.save_cursors(&maintenance.cursors())?;
    Ok(())
}

pub(crate) fn describe(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Decayed(n) => format!("decay: {n} fragments"),
        TaskOutcome::Purged(n) => format!("purge: {n} superpositions"),
        TaskOutcome::Reanalyzed {
            analyzed,
            tier_changes,
            failed,
        } => format!("reanalyze: {analyzed} analyzed, {tier_changes} tier changes, {failed} failed"),
        TaskOutcome::Rebuilt => "rebuild: done".to_string(),
        TaskOutcome::RebuildSuspended { iteration } => {
            format!("rebuild: suspended at iteration {iteration}")
        }
        TaskOutcome::Compacted(n) => format!("compact: {n} motifs evicted"),
    }
}

fn cmd_stats(session: &Session) -> Result<()> {
    let engine = session.engine()?;
    let stats = engine.stats();
    let tiers: Vec<String> = stats
        .tiers
        .iter()
        .map(|(tier, n)| format!("{tier}={n}"))
        .collect();

    println!("store:      {}", session.location.name());
    println!("fragments:  {}", stats.fragments);
    println!("tiers:      {}", tiers.join(" "));
    println!(
        "motifs:     {} ({} evicted)",
        stats.motifs, stats.evicted_motifs
    );
    println!(
        "bytes:      {} stored / {} original",
        stats.stored_bytes, stats.original_bytes
    );
    println!(
        "clusters:   {} (depth {})",
        stats.clusters, stats.hierarchy_depth
    );
    println!("events:     {}", stats.access_events);
    println!("branches:   {} persisted", stats.persisted_branches);
    println!(
        "db_size:    {:.1}MB",
        session.store.db_size() as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

fn cmd_export(session: &Session, path: &Path) -> Result<()> {
    session
        .store
        .export_json_file(path)
        .context("failed to export JSON")?;
    println!("exported to {}", path.display());
    Ok(())
}

fn cmd_import(session: &Session, path: &Path) -> Result<()> {
    session
        .store
        .import_json_file(path)
        .context("failed to import JSON")?;

    // Fails on a dimension mismatch with the active config
    let engine = session.engine()?;
    let text = engine
        .fragment_ids()
        .into_iter()
        .filter_map(|id| engine.header(id).ok())
        .filter(|h| h.content_type == ContentType::Text)
        .count();
    println!(
        "imported from {}. fragments={} (text={}), events={}",
        path.display(),
        engine.fragment_count(),
        text,
        engine.stats().access_events
    );
    Ok(())
}
