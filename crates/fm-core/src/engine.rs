//! `MemoryEngine`: the facade that wires analyzer, encoder, hierarchy,
//! observer, branching and the quantum bridge together.
//!
//! Lock order, outermost first: fragment map, fragment slot, motif arena,
//! cluster index, superposition cache, branch archive, access log. No path
//! takes them in any other order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::analyzer::{CompressionAnalyzer, CompressionProfile};
use crate::branch::{
    BranchArchive, BranchId, BranchSimulator, CausalBranch, PathsNotTaken, ScenarioHint,
    StateId, SuperpositionCache, SuperpositionState,
};
use crate::config::EngineConfig;
use crate::delta::{Delta, similarity};
use crate::embedding::{Embedder, cosine};
use crate::encoder::{
    EncodedSeed, FractalEncoder, MotifArena, MotifBody, MotifHandle, PreparedMotif,
};
use crate::error::{AnalysisError, EngineError, ReconstructionError, Result};
use crate::events::EngineEvent;
use crate::fragment::{ContentType, FidelityTier, FragmentHeader, FragmentId, MemoryFragment};
use crate::hierarchy::{ClusterId, ClusterIndex, ConceptCluster, RebuildJob};
use crate::observer::{
    AccessEvent, ContentView, EmotionalTag, Layer, MetaMemoryRecord, ObserverCatalog,
    ObserverModel, ObserverProfile, ThresholdCrossing,
};
use crate::quantum::{
    CircuitTemplate, EncodingSource, QuantumBridge, QuantumEncoding, QuantumSdk,
    encode_branch_set, encode_fragment,
};
use crate::snapshot::{EngineSnapshot, FragmentRecord};
use crate::time::{Clock, SystemClock};
use crate::tokenizer::summarize;

const EVENT_CAPACITY: usize = 256;

/// Caller-supplied facts about new content.
#[derive(Clone, Debug, Default)]
pub struct IngestMetadata {
    pub content_type: ContentType,
    /// Overrides the built-in hashing embedder.
    pub embedding: Option<Vec<f32>>,
    pub label: Option<String>,
}

impl IngestMetadata {
    pub fn text() -> Self {
        Self::default()
    }

    pub fn json() -> Self {
        Self {
            content_type: ContentType::Json,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Result of one observer access.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessOutcome {
    pub fragment: FragmentId,
    pub view: ContentView,
    pub fidelity: f64,
    pub fidelity_delta: f64,
    pub tier: FidelityTier,
}

/// A ranked query hit. Producing it counted as an access.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentView {
    pub id: FragmentId,
    pub score: f64,
    pub similarity: f64,
    pub label: Option<String>,
    pub view: ContentView,
    pub fidelity: f64,
    pub fidelity_delta: f64,
    pub tier: FidelityTier,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub fragments: usize,
    pub tiers: BTreeMap<String, usize>,
    pub motifs: usize,
    pub evicted_motifs: usize,
    pub stored_bytes: usize,
    pub original_bytes: usize,
    pub clusters: usize,
    pub hierarchy_depth: usize,
    pub access_events: usize,
    pub pending_superpositions: usize,
    pub archived_branches: usize,
    pub persisted_branches: usize,
}

/// Outcome of re-scoring a batch of fragments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReanalysisReport {
    pub analyzed: usize,
    pub tier_changes: usize,
    pub failed: Vec<FragmentId>,
}

struct FragmentSlot {
    header: FragmentHeader,
    seed: EncodedSeed,
    profile: CompressionProfile,
    meta: MetaMemoryRecord,
}

pub struct MemoryEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    embedder: Embedder,
    analyzer: CompressionAnalyzer,
    encoder: FractalEncoder,
    observer: ObserverModel,
    catalog: RwLock<ObserverCatalog>,
    simulator: BranchSimulator,
    quantum: QuantumBridge,
    fragments: RwLock<HashMap<FragmentId, Arc<Mutex<FragmentSlot>>>>,
    motifs: RwLock<MotifArena>,
    clusters: RwLock<Arc<ClusterIndex>>,
    superpositions: Mutex<SuperpositionCache>,
    archive: Mutex<BranchArchive>,
    persisted: Mutex<BTreeMap<BranchId, CausalBranch>>,
    access_log: Mutex<Vec<AccessEvent>>,
    access_seq: AtomicU64,
    events: broadcast::Sender<EngineEvent>,
}

impl MemoryEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(SystemClock), None)
    }

    /// Full constructor: injectable clock and optional quantum SDK.
    pub fn with_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        sdk: Option<Arc<dyn QuantumSdk>>,
    ) -> Result<Self> {
        config.validate()?;
        let dims = config.embedding_dims.0;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            embedder: Embedder::new(dims),
            analyzer: CompressionAnalyzer::new(config.analyzer.clone()),
            encoder: FractalEncoder::new(config.encoder.clone()),
            observer: ObserverModel::new(config.observer.clone()),
            catalog: RwLock::new(ObserverCatalog::with_extra(&config.observer.extra_observers)),
            simulator: BranchSimulator::new(config.branch.clone()),
            quantum: QuantumBridge::new(&config.quantum, sdk),
            fragments: RwLock::new(HashMap::new()),
            motifs: RwLock::new(MotifArena::default()),
            clusters: RwLock::new(Arc::new(ClusterIndex::new(dims))),
            superpositions: Mutex::new(SuperpositionCache::new(
                config.branch.cache_capacity,
                config.branch.ttl_ms,
            )),
            archive: Mutex::new(BranchArchive::new(config.branch.archive_capacity)),
            persisted: Mutex::new(BTreeMap::new()),
            access_log: Mutex::new(Vec::new()),
            access_seq: AtomicU64::new(1),
            events,
            clock,
            config,
        })
    }

    /// Rebuild an engine from a snapshot. Meta-memory is replayed from the
    /// access log.
    pub fn restore(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        sdk: Option<Arc<dyn QuantumSdk>>,
        snapshot: EngineSnapshot,
    ) -> Result<Self> {
        if !snapshot.is_empty() && snapshot.embedding_dims != config.embedding_dims.0 {
            return Err(EngineError::InvalidInput(format!(
                "snapshot uses {}-dimensional embeddings, config expects {}",
                snapshot.embedding_dims, config.embedding_dims.0
            )));
        }
        let mut engine = Self::with_parts(config, clock, sdk)?;
        engine.analyzer = CompressionAnalyzer::with_corpus(
            engine.config.analyzer.clone(),
            snapshot.corpus,
        );

        let mut meta = MetaMemoryRecord::rebuild(&snapshot.access_log);
        let mut slots = HashMap::with_capacity(snapshot.fragments.len());
        for record in snapshot.fragments {
            let id = record.header.id;
            let slot = FragmentSlot {
                meta: meta.remove(&id).unwrap_or_else(|| MetaMemoryRecord::new(id)),
                header: record.header,
                seed: record.seed,
                profile: record.profile,
            };
            slots.insert(id, Arc::new(Mutex::new(slot)));
        }

        let next_seq = snapshot
            .access_log
            .iter()
            .map(|e| e.seq + 1)
            .max()
            .unwrap_or(1)
            .max(snapshot.next_access_seq);

        *engine.fragments.get_mut() = slots;
        *engine.motifs.get_mut() = MotifArena::from_nodes(snapshot.motifs);
        *engine.clusters.get_mut() = Arc::new(ClusterIndex::from_clusters(
            engine.config.embedding_dims.0,
            snapshot.clusters,
        ));
        *engine.access_log.get_mut() = snapshot.access_log;
        *engine.persisted.get_mut() = snapshot
            .persisted_branches
            .into_iter()
            .map(|b| (b.id, b))
            .collect();
        engine.access_seq = AtomicU64::new(next_seq);
        engine
            .simulator
            .resume_ids(snapshot.next_branch_id, snapshot.next_state_id);

        tracing::info!(
            fragments = engine.fragment_count(),
            events = engine.access_log.lock().len(),
            "engine restored"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        tracing::debug!(?event, "engine event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn register_observer(&self, profile: ObserverProfile) -> bool {
        self.catalog.write().register(profile)
    }

    fn observer_profile(&self, observer: &str) -> Result<ObserverProfile> {
        self.catalog
            .read()
            .get(observer)
            .cloned()
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown observer: {observer}")))
    }

    fn slot(&self, id: FragmentId) -> Result<Arc<Mutex<FragmentSlot>>> {
        self.fragments
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::FragmentNotFound(id))
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.read().len()
    }

    /// All fragment ids, sorted.
    pub fn fragment_ids(&self) -> Vec<FragmentId> {
        let mut ids: Vec<FragmentId> = self.fragments.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn header(&self, id: FragmentId) -> Result<FragmentHeader> {
        Ok(self.slot(id)?.lock().header.clone())
    }

    pub fn profile(&self, id: FragmentId) -> Result<CompressionProfile> {
        Ok(self.slot(id)?.lock().profile.clone())
    }

    pub fn seed(&self, id: FragmentId) -> Result<EncodedSeed> {
        Ok(self.slot(id)?.lock().seed.clone())
    }

    pub fn meta_memory(&self, id: FragmentId) -> Result<MetaMemoryRecord> {
        Ok(self.slot(id)?.lock().meta.clone())
    }

    pub fn cluster_index(&self) -> Arc<ClusterIndex> {
        self.clusters.read().clone()
    }

    pub fn cluster(&self, id: ClusterId) -> Result<ConceptCluster> {
        self.cluster_index()
            .get(id)
            .cloned()
            .ok_or(EngineError::ClusterNotFound(id))
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        self.embedder.embed(text)
    }

    // --- storage path ---

    /// Analyze, encode and place new content.
    pub fn ingest(&self, content: &str, metadata: IngestMetadata) -> Result<FragmentId> {
        // Nothing to fall back to a lossless copy of
        if content.trim().is_empty() {
            return Err(AnalysisError::Empty.into());
        }
        let dims = self.config.embedding_dims.0;
        let embedding = match metadata.embedding {
            Some(e) if e.len() != dims => {
                return Err(EngineError::InvalidInput(format!(
                    "embedding has {} dimensions, expected {dims}",
                    e.len()
                )));
            }
            Some(e) => e,
            None => self.embedder.embed(content),
        };

        let now = self.now();
        let mut fragment = MemoryFragment::new(content, metadata.content_type, embedding, now);
        fragment.header.label = metadata.label;
        let id = fragment.id();

        let profile = match self.analyzer.analyze(&fragment, now) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(fragment = %id, error = %e, "analysis failed, storing lossless");
                CompressionProfile::lossless_fallback(id, now)
            }
        };
        fragment.header.tier = profile.tier;
        self.analyzer.absorb(content);

        let context = self.cluster_index().context_for(&fragment.header.embedding);
        let prepared = self.encoder.prepare(&self.motifs.read(), &fragment, &context);
        let seed = self.encoder.commit(&mut self.motifs.write(), prepared);

        fragment.header.compression_ratio = seed.compression_ratio();
        fragment.header.summary =
            summarize(&FractalEncoder::storable_content(content, fragment.header.tier));

        // Assignment and insertion happen under the map lock so a rebuild
        // install sees either both or neither
        let mut fragments = self.fragments.write();
        let cluster = {
            let mut guard = self.clusters.write();
            Arc::make_mut(&mut guard).assign(
                id,
                &fragment.header.embedding,
                self.config.hierarchy.assign_threshold,
            )
        };
        fragment.header.cluster = Some(cluster);

        tracing::debug!(
            fragment = %id,
            tier = fragment.header.tier.as_str(),
            ratio = fragment.header.compression_ratio,
            cluster = cluster.0,
            "ingested fragment"
        );

        let slot = FragmentSlot {
            header: fragment.header,
            seed,
            profile,
            meta: MetaMemoryRecord::new(id),
        };
        fragments.insert(id, Arc::new(Mutex::new(slot)));
        Ok(id)
    }

    // --- decode and recovery ---

    fn decode_slot(&self, slot: &mut FragmentSlot, fidelity: f64) -> String {
        let attempt = self
            .encoder
            .decode_content(&self.motifs.read(), &slot.seed, fidelity);
        match attempt {
            Ok(content) => content,
            Err(err) => self.recover(slot, err),
        }
    }

    /// Re-encode against the nearest surviving ancestor, or fall back to
    /// the summary when nothing below the fragment survives. Either way the
    /// fragment ends up degraded.
    fn recover(&self, slot: &mut FragmentSlot, err: ReconstructionError) -> String {
        let id = slot.header.id;
        tracing::warn!(
            fragment = %id,
            motif = err.handle().0,
            error = %err,
            "reconstruction failed, recovering"
        );
        self.emit(EngineEvent::DegradedMode {
            reason: format!("fragment {id}: {err}"),
        });

        let rebuilt = {
            let mut arena = self.motifs.write();
            let own = slot.seed.motif;
            let ancestor = arena.nearest_surviving_ancestor(own);
            match ancestor.and_then(|a| arena.expand(a).ok().map(|c| (a, c))) {
                Some((base, base_content)) => {
                    let extra = match arena.get(own).map(|n| &n.body) {
                        Some(MotifBody::Derived(d)) => d.inserted_text(),
                        _ => String::new(),
                    };
                    let content = if extra.is_empty() {
                        base_content.clone()
                    } else {
                        format!("{} {extra}", base_content.trim_end())
                    };
                    let prepared = PreparedMotif {
                        origin: id,
                        base: Some(base),
                        delta: Some(Delta::diff(&base_content, &content)),
                        similarity: similarity(&base_content, &content),
                        original_len: content.len(),
                        stored_content: content.clone(),
                    };
                    slot.seed = self.encoder.commit(&mut arena, prepared);
                    Some(content)
                }
                None => None,
            }
        };

        let old_tier = slot.header.tier;
        slot.header.tier = FidelityTier::Degraded;
        match rebuilt {
            Some(content) => {
                let halved = slot.header.fidelity / 2.0;
                slot.header.set_fidelity(halved);
                slot.header.compression_ratio = slot.seed.compression_ratio();
                if old_tier != FidelityTier::Degraded {
                    self.emit(EngineEvent::FidelityChanged {
                        fragment: id,
                        old_tier,
                        new_tier: FidelityTier::Degraded,
                    });
                }
                content
            }
            None => {
                if old_tier != FidelityTier::Degraded {
                    self.emit(EngineEvent::FidelityChanged {
                        fragment: id,
                        old_tier,
                        new_tier: FidelityTier::Degraded,
                    });
                }
                let arena = self.motifs.read();
                arena
                    .get(slot.seed.motif)
                    .map(|n| n.summary.clone())
                    .unwrap_or_else(|| slot.header.summary.clone())
            }
        }
    }

    /// Content at the given fidelity, without counting as an observation.
    pub fn read(&self, id: FragmentId, fidelity: f64) -> Result<MemoryFragment> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();
        let content = self.decode_slot(&mut slot, fidelity);
        Ok(MemoryFragment {
            header: slot.header.clone(),
            content,
        })
    }

    // --- observer path ---

    fn apply_crossing(&self, slot: &mut FragmentSlot, crossing: ThresholdCrossing) {
        let old_tier = slot.header.tier;
        let new_tier = match crossing {
            ThresholdCrossing::None => return,
            ThresholdCrossing::Degraded => FidelityTier::Degraded,
            ThresholdCrossing::Restored => slot.profile.tier,
        };
        if old_tier == new_tier {
            return;
        }
        slot.header.tier = new_tier;
        self.emit(EngineEvent::FidelityChanged {
            fragment: slot.header.id,
            old_tier,
            new_tier,
        });
    }

    /// Observe a fragment at a layer. Mutates its fidelity and appends an
    /// access event.
    pub fn access(&self, id: FragmentId, observer: &str, layer: Layer) -> Result<AccessOutcome> {
        let profile = self.observer_profile(observer)?;
        let slot = self.slot(id)?;
        let mut slot = slot.lock();
        let now = self.now();

        let update = self.observer.observe(&mut slot.header, &profile, layer, now);
        self.apply_crossing(&mut slot, update.crossing);

        let view = match layer {
            Layer::Surface => ContentView::Surface {
                tag: EmotionalTag::classify(&slot.header.summary),
                summary: slot.header.summary.clone(),
            },
            Layer::Core => {
                let replay_fidelity = slot
                    .header
                    .fidelity
                    .min(self.observer.config().core_replay_fidelity);
                ContentView::Core {
                    content: self.decode_slot(&mut slot, replay_fidelity),
                    replay_fidelity,
                }
            }
            Layer::Deep => ContentView::Deep {
                content: self.decode_slot(&mut slot, 1.0),
            },
        };

        let event = AccessEvent {
            seq: self.access_seq.fetch_add(1, Ordering::SeqCst),
            observer: profile.id.clone(),
            fragment: id,
            layer,
            timestamp: now,
            fidelity_delta: update.delta(),
        };
        slot.meta.record(event.clone());
        self.access_log.lock().push(event);

        Ok(AccessOutcome {
            fragment: id,
            view,
            fidelity: slot.header.fidelity,
            fidelity_delta: update.delta(),
            tier: slot.header.tier,
        })
    }

    /// Rank by `cosine × (½ + ½·fidelity)`, probing the best clusters first.
    /// Every hit is an access by `observer`.
    pub fn query(
        &self,
        observer: &str,
        query_embedding: &[f32],
        layer: Layer,
        limit: usize,
    ) -> Result<Vec<FragmentView>> {
        self.observer_profile(observer)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let index = self.cluster_index();
        let mut candidates: Vec<FragmentId> = index
            .probe(query_embedding, self.config.hierarchy.probe_clusters)
            .into_iter()
            .filter_map(|c| index.get(c))
            .flat_map(|c| c.members.iter().copied())
            .collect();
        if candidates.len() < limit {
            candidates = self.fragment_ids();
        }

        let mut scored: Vec<(FragmentId, f64, f64)> = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Ok(slot) = self.slot(id) else {
                continue;
            };
            let slot = slot.lock();
            let sim = cosine(query_embedding, &slot.header.embedding);
            scored.push((id, sim * (0.5 + 0.5 * slot.header.fidelity), sim));
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(limit);

        let mut views = Vec::with_capacity(scored.len());
        for (id, score, sim) in scored {
            let outcome = self.access(id, observer, layer)?;
            let label = self.header(id)?.label;
            views.push(FragmentView {
                id,
                score,
                similarity: sim,
                label,
                view: outcome.view,
                fidelity: outcome.fidelity,
                fidelity_delta: outcome.fidelity_delta,
                tier: outcome.tier,
            });
        }
        Ok(views)
    }

    pub fn query_text(
        &self,
        observer: &str,
        text: &str,
        layer: Layer,
        limit: usize,
    ) -> Result<Vec<FragmentView>> {
        let embedding = self.embedder.embed(text);
        self.query(observer, &embedding, layer, limit)
    }

    /// Apply time decay to every fragment.
    pub fn decay_sweep(&self) -> usize {
        let now = self.now();
        let slots: Vec<_> = self.fragments.read().values().cloned().collect();
        let mut changed = 0;
        for slot in slots {
            let mut slot = slot.lock();
            let update = self.observer.decay_to(&mut slot.header, now);
            if update.delta() != 0.0 {
                changed += 1;
            }
            self.apply_crossing(&mut slot, update.crossing);
        }
        tracing::debug!(changed, "decay sweep");
        changed
    }

    /// Access events with `seq > after`, in order.
    pub fn access_events_since(&self, after: u64) -> Vec<AccessEvent> {
        self.access_log
            .lock()
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }

    /// Replace every fragment's meta-memory with a replay of the log.
    pub fn rebuild_meta_memory(&self) {
        let mut records = MetaMemoryRecord::rebuild(self.access_log.lock().iter());
        let slots: Vec<_> = self.fragments.read().values().cloned().collect();
        for slot in slots {
            let mut slot = slot.lock();
            let id = slot.header.id;
            slot.meta = records.remove(&id).unwrap_or_else(|| MetaMemoryRecord::new(id));
        }
    }

    // --- hierarchy ---

    /// A rebuild job over the current fragments, seeded from the current
    /// index.
    pub fn start_rebuild(&self, depth: usize) -> RebuildJob {
        let slots: Vec<_> = self.fragments.read().values().cloned().collect();
        let points = slots
            .iter()
            .map(|s| {
                let s = s.lock();
                (s.header.id, s.header.embedding.clone())
            })
            .collect();
        RebuildJob::new(
            &self.cluster_index(),
            points,
            self.config.hierarchy.clone(),
            depth,
        )
    }

    /// Swap in the result of a finished job and update fragment cluster
    /// references. Fragments ingested after the job took its snapshot are
    /// assigned into the new index before it goes live.
    pub fn install_rebuild(&self, job: RebuildJob) {
        let mut index = job.finish();
        let threshold = self.config.hierarchy.assign_threshold;

        let fragments = self.fragments.read();
        let mut late = 0;
        for slot in fragments.values() {
            let mut slot = slot.lock();
            let cluster = match index.cluster_of(slot.header.id) {
                Some(c) => c,
                None => {
                    late += 1;
                    index.assign(slot.header.id, &slot.header.embedding, threshold)
                }
            };
            slot.header.cluster = Some(cluster);
        }
        let clusters = index.clusters().len();
        let depth = index.max_depth();
        *self.clusters.write() = Arc::new(index);
        drop(fragments);

        tracing::info!(clusters, depth, late, "cluster index swapped");
    }

    pub fn rebuild(&self, depth: usize) {
        let mut job = self.start_rebuild(depth);
        job.run(|| false);
        self.install_rebuild(job);
    }

    /// Rebuild unless cancelled. A cancelled rebuild leaves the current
    /// index untouched.
    pub fn rebuild_until(&self, depth: usize, cancel: &CancellationToken) -> Result<()> {
        let mut job = self.start_rebuild(depth);
        if !job.run(|| cancel.is_cancelled()) {
            tracing::info!("rebuild cancelled");
            return Err(EngineError::Cancelled);
        }
        self.install_rebuild(job);
        Ok(())
    }

    // --- re-analysis and compaction ---

    /// Re-score fragments against the current corpus. Fragments that were
    /// degraded by observation keep that tier.
    pub fn reanalyze(&self, ids: &[FragmentId]) -> ReanalysisReport {
        let now = self.now();
        let mut report = ReanalysisReport::default();
        for id in ids {
            let Ok(slot) = self.slot(*id) else {
                report.failed.push(*id);
                continue;
            };
            let mut slot = slot.lock();
            let content = match self
                .encoder
                .decode_content(&self.motifs.read(), &slot.seed, 1.0)
            {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(fragment = %id, error = %e, "re-analysis could not decode");
                    report.failed.push(*id);
                    continue;
                }
            };
            let fragment = MemoryFragment {
                header: slot.header.clone(),
                content,
            };
            let profile = match self.analyzer.reanalyze(&fragment, now) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(fragment = %id, error = %e, "re-analysis failed, keeping lossless");
                    CompressionProfile::lossless_fallback(*id, now)
                }
            };

            let degraded_by_fidelity =
                slot.header.fidelity < self.observer.config().degraded_fidelity;
            if !degraded_by_fidelity && slot.header.tier != profile.tier {
                let old_tier = slot.header.tier;
                slot.header.tier = profile.tier;
                report.tier_changes += 1;
                self.emit(EngineEvent::FidelityChanged {
                    fragment: *id,
                    old_tier,
                    new_tier: profile.tier,
                });
            }
            slot.profile = profile;
            report.analyzed += 1;
        }
        report
    }

    pub fn evict_motif(&self, handle: MotifHandle) -> bool {
        self.motifs.write().evict(handle)
    }

    /// Evict the motifs of degraded fragments that no live motif derives
    /// from. Returns how many were evicted.
    pub fn compact(&self) -> usize {
        let slots: Vec<_> = self.fragments.read().values().cloned().collect();
        let degraded: Vec<MotifHandle> = slots
            .iter()
            .filter_map(|s| {
                let s = s.lock();
                (s.header.tier == FidelityTier::Degraded).then_some(s.seed.motif)
            })
            .collect();

        let mut arena = self.motifs.write();
        // Leaves are chosen before anything is evicted
        let leaves: Vec<MotifHandle> = degraded
            .into_iter()
            .filter(|h| arena.dependents(*h) == 0)
            .collect();
        let evicted = leaves.into_iter().filter(|h| arena.evict(*h)).count();
        tracing::info!(evicted, "compacted motif arena");
        evicted
    }

    // --- branching ---

    fn parent_content(&self, id: FragmentId) -> Result<(String, FragmentHeader)> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();
        let content = self.decode_slot(&mut slot, 1.0);
        Ok((content, slot.header.clone()))
    }

    pub fn request_branches(
        &self,
        fragment: FragmentId,
        hints: &[ScenarioHint],
        n: usize,
    ) -> Result<SuperpositionState> {
        let max = self.config.branch.max_branches;
        if n == 0 || n > max {
            return Err(EngineError::InvalidInput(format!(
                "branch count must be in 1..={max}, got {n}"
            )));
        }
        let (content, _) = self.parent_content(fragment)?;
        let now = self.now();
        let state = self.simulator.branch(fragment, &content, n, hints, now);

        let evicted = self.superpositions.lock().insert(state.clone());
        if !evicted.is_empty() {
            self.archive
                .lock()
                .archive(evicted.into_iter().flat_map(|s| s.branches));
        }
        tracing::debug!(
            fragment = %fragment,
            state = state.id,
            branches = state.branches.len(),
            "superposition created"
        );
        Ok(state)
    }

    pub fn superposition(&self, state: StateId) -> Result<SuperpositionState> {
        self.superpositions
            .lock()
            .get(state, self.now())
            .cloned()
            .ok_or(EngineError::StateNotFound(state))
    }

    /// Resolve a pending superposition. The losers become paths not taken;
    /// the parent fragment is not touched.
    pub fn collapse(&self, state: StateId) -> Result<CausalBranch> {
        let state = self
            .superpositions
            .lock()
            .take(state, self.now())
            .ok_or(EngineError::StateNotFound(state))?;
        let winner = state
            .collapse()
            .cloned()
            .ok_or_else(|| EngineError::InvalidInput("superposition has no branches".into()))?;

        self.archive
            .lock()
            .archive(state.branches.into_iter().filter(|b| b.id != winner.id));
        self.emit(EngineEvent::BranchCollapsed {
            parent: winner.parent,
            winner: winner.id,
            coherence: winner.coherence,
        });
        Ok(winner)
    }

    /// Promote a branch to a fragment of its own through the normal ingest
    /// path.
    ///
    /// The branch's delta needs the parent's exact content, so a parent whose
    /// motif chain has been evicted since branching is a reconstruction
    /// error here rather than a recovery.
    pub fn commit_branch(&self, branch: &CausalBranch) -> Result<FragmentId> {
        let (parent_content, parent) = {
            let slot = self.slot(branch.parent)?;
            let slot = slot.lock();
            let content = self
                .encoder
                .decode_content(&self.motifs.read(), &slot.seed, 1.0)?;
            (content, slot.header.clone())
        };
        let content = branch
            .content(&parent_content)
            .map_err(|e| EngineError::InvalidInput(format!("branch {}: {e}", branch.id)))?;
        self.ingest(
            &content,
            IngestMetadata {
                content_type: parent.content_type,
                embedding: None,
                label: Some(format!("branch {} of {}", branch.id, branch.parent)),
            },
        )
    }

    /// Keep a branch beyond collapse; it is saved with the next checkpoint.
    pub fn persist_branch(&self, branch: &CausalBranch) -> Result<()> {
        self.slot(branch.parent)?;
        self.persisted.lock().insert(branch.id, branch.clone());
        Ok(())
    }

    pub fn persisted_branches(&self) -> Vec<CausalBranch> {
        self.persisted.lock().values().cloned().collect()
    }

    /// Every uncollapsed branch of a fragment: still-pending states plus
    /// archived losers.
    pub fn explore_paths_not_taken(&self, fragment: FragmentId) -> Result<PathsNotTaken> {
        self.slot(fragment)?;
        let now = self.now();
        let ttl = self.config.branch.ttl_ms;
        let mut branches: Vec<CausalBranch> = self
            .superpositions
            .lock()
            .pending_for(fragment)
            .filter(|s| now.saturating_sub(s.created_at) <= ttl)
            .flat_map(|s| s.branches.iter().cloned())
            .collect();
        branches.extend(self.archive.lock().for_parent(fragment).cloned());
        Ok(PathsNotTaken::new(branches))
    }

    /// Drop expired superpositions; their branches are archived.
    pub fn purge_superpositions(&self) -> usize {
        let expired = self.superpositions.lock().purge_expired(self.now());
        let n = expired.len();
        if n > 0 {
            self.archive
                .lock()
                .archive(expired.into_iter().flat_map(|s| s.branches));
            tracing::debug!(expired = n, "purged superpositions");
        }
        n
    }

    // --- quantum bridge ---

    pub fn encode_to_circuit(
        &self,
        source: EncodingSource,
        template: CircuitTemplate,
    ) -> Result<QuantumEncoding> {
        match source {
            EncodingSource::Fragment(id) => {
                let header = self.header(id)?;
                Ok(encode_fragment(&header, template))
            }
            EncodingSource::BranchSet(state) => {
                let state = self.superposition(state)?;
                encode_branch_set(&state, template).map_err(EngineError::InvalidInput)
            }
        }
    }

    /// Measure an encoding and materialize the outcome. Backend trouble is
    /// reported as a degraded-mode event, never as an error.
    pub fn measure(&self, encoding: &QuantumEncoding) -> Result<MemoryFragment> {
        let measurement = self
            .quantum
            .measure(encoding)
            .ok_or_else(|| EngineError::InvalidInput("encoding has no outcomes".into()))?;
        if let Some(err) = &measurement.fallback {
            self.emit(EngineEvent::DegradedMode {
                reason: err.to_string(),
            });
        }

        if let Some(id) = measurement.outcome.fragment {
            return self.read(id, 1.0);
        }

        let EncodingSource::BranchSet(state_id) = encoding.source else {
            return Err(EngineError::InvalidInput("outcome has no source".into()));
        };
        let Some(branch_id) = measurement.outcome.branch else {
            return Err(EngineError::InvalidInput("outcome names no branch".into()));
        };
        let state = self.superposition(state_id)?;
        let branch = state
            .branch(branch_id)
            .ok_or(EngineError::BranchNotFound(branch_id))?;

        let (parent_content, parent) = self.parent_content(branch.parent)?;
        let content = branch
            .content(&parent_content)
            .map_err(|e| EngineError::InvalidInput(format!("branch {branch_id}: {e}")))?;
        let mut fragment = MemoryFragment::new(
            content,
            parent.content_type,
            parent.embedding,
            self.now(),
        );
        fragment.header.label = Some(format!("branch {branch_id}"));
        fragment.header.set_fidelity(encoding.fidelity_bound);
        fragment.header.cluster = parent.cluster;
        Ok(fragment)
    }

    // --- snapshots ---

    pub fn snapshot(&self) -> EngineSnapshot {
        let slots: Vec<_> = self.fragments.read().values().cloned().collect();
        let mut fragments: Vec<FragmentRecord> = slots
            .iter()
            .map(|s| {
                let s = s.lock();
                FragmentRecord {
                    header: s.header.clone(),
                    seed: s.seed.clone(),
                    profile: s.profile.clone(),
                }
            })
            .collect();
        fragments.sort_by(|a, b| a.header.id.cmp(&b.header.id));

        let (next_branch_id, next_state_id) = self.simulator.next_ids();
        EngineSnapshot {
            embedding_dims: self.config.embedding_dims.0,
            fragments,
            motifs: self.motifs.read().nodes().to_vec(),
            clusters: self.cluster_index().clusters().to_vec(),
            corpus: self.analyzer.corpus_snapshot(),
            access_log: self.access_log.lock().clone(),
            persisted_branches: self.persisted_branches(),
            next_access_seq: self.access_seq.load(Ordering::SeqCst),
            next_branch_id,
            next_state_id,
        }
    }

    pub fn stats(&self) -> EngineStats {
        let slots: Vec<_> = self.fragments.read().values().cloned().collect();
        let mut stats = EngineStats {
            fragments: slots.len(),
            ..EngineStats::default()
        };
        for s in &slots {
            let s = s.lock();
            *stats.tiers.entry(s.header.tier.as_str().to_string()).or_default() += 1;
            stats.original_bytes += s.seed.original_len;
        }
        {
            let arena = self.motifs.read();
            stats.motifs = arena.len();
            stats.evicted_motifs = arena.nodes().iter().filter(|n| n.is_evicted()).count();
            stats.stored_bytes = arena.total_stored_bytes();
        }
        let index = self.cluster_index();
        stats.clusters = index.clusters().len();
        stats.hierarchy_depth = index.max_depth();
        stats.access_events = self.access_log.lock().len();
        stats.pending_superpositions = self.superpositions.lock().len();
        stats.archived_branches = self.archive.lock().len();
        stats.persisted_branches = self.persisted.lock().len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BranchConfig;
    use crate::time::ManualClock;

    const TEXT: &str = "Quartz crystals vibrate at a precise frequency when voltage \
        is applied, which makes them ideal timekeepers for watches and radios.";

    fn engine() -> (MemoryEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = EngineConfig {
            branch: BranchConfig {
                seed: Some(42),
                ..BranchConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine = MemoryEngine::with_parts(config, clock.clone(), None).unwrap();
        (engine, clock)
    }

    #[test]
    fn test_ingest_and_deep_read() {
        let (e, _) = engine();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let f = e.read(id, 1.0).unwrap();
        assert_eq!(f.header.tier, FidelityTier::Lossless);
        assert_eq!(f.content, TEXT);
        assert!(f.header.cluster.is_some());
    }

    #[test]
    fn test_empty_content_rejected() {
        let (e, _) = engine();
        assert!(matches!(
            e.ingest("   ", IngestMetadata::text()),
            Err(EngineError::Analysis(AnalysisError::Empty))
        ));
    }

    #[test]
    fn test_wrong_embedding_dims_rejected() {
        let (e, _) = engine();
        let meta = IngestMetadata {
            embedding: Some(vec![1.0; 3]),
            ..IngestMetadata::default()
        };
        assert!(e.ingest(TEXT, meta).is_err());
    }

    #[test]
    fn test_unparseable_json_falls_back_to_lossless() {
        let (e, _) = engine();
        let id = e.ingest("{not json", IngestMetadata::json()).unwrap();
        assert_eq!(e.header(id).unwrap().tier, FidelityTier::Lossless);
        assert_eq!(e.read(id, 1.0).unwrap().content, "{not json");
    }

    #[test]
    fn test_unknown_fragment_not_found() {
        let (e, _) = engine();
        let err = e
            .access(FragmentId::from_u128(5), "end-user", Layer::Deep)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unknown_observer_rejected() {
        let (e, _) = engine();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        assert!(matches!(
            e.access(id, "nobody", Layer::Deep),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_surface_view_has_summary_and_tag() {
        let (e, _) = engine();
        let id = e
            .ingest("The launch was a great success. Everyone celebrated.", IngestMetadata::text())
            .unwrap();
        let out = e.access(id, "plugin", Layer::Surface).unwrap();
        match out.view {
            ContentView::Surface { summary, tag } => {
                assert_eq!(summary, "The launch was a great success.");
                assert_eq!(tag, EmotionalTag::Positive);
            }
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[test]
    fn test_decay_degrades_and_emits_event() {
        let (e, clock) = engine();
        let mut rx = e.subscribe();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        clock.advance(e.config().observer.half_life_ms * 4);
        assert_eq!(e.decay_sweep(), 1);
        let h = e.header(id).unwrap();
        assert_eq!(h.tier, FidelityTier::Degraded);
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::FidelityChanged {
                fragment: id,
                old_tier: FidelityTier::Lossless,
                new_tier: FidelityTier::Degraded,
            }
        );
    }

    #[test]
    fn test_recovery_serves_summary_when_nothing_survives() {
        let (e, _) = engine();
        let mut rx = e.subscribe();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let seed = e.seed(id).unwrap();
        assert!(e.evict_motif(seed.motif));

        let out = e.access(id, "primary-agent", Layer::Deep).unwrap();
        assert_eq!(out.tier, FidelityTier::Degraded);
        assert_eq!(out.view.text(), e.header(id).unwrap().summary);
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::DegradedMode { .. }));
    }

    #[test]
    fn test_recovery_reencodes_from_ancestor() {
        let (e, _) = engine();
        let a = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let b_text = TEXT.replace("radios", "clocks");
        let b = e.ingest(&b_text, IngestMetadata::text()).unwrap();
        let seed_a = e.seed(a).unwrap();
        let seed_b = e.seed(b).unwrap();
        assert_eq!(seed_b.base, Some(seed_a.motif));
        let before = e.header(b).unwrap().fidelity;

        e.evict_motif(seed_b.motif);
        let f = e.read(b, 1.0).unwrap();
        assert_eq!(f.header.tier, FidelityTier::Degraded);
        assert!((f.header.fidelity - before / 2.0).abs() < 1e-12);
        assert!(f.content.starts_with("Quartz crystals"));
        // the re-encoded motif reads cleanly next time
        assert_eq!(e.read(b, 1.0).unwrap().content, f.content);
    }

    #[test]
    fn test_compact_evicts_unreferenced_degraded_motifs() {
        let (e, clock) = engine();
        let a = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        e.ingest(&TEXT.replace("radios", "clocks"), IngestMetadata::text())
            .unwrap();
        clock.advance(e.config().observer.half_life_ms * 4);
        e.decay_sweep();
        // a is the base of b's motif, so only b's motif goes
        assert_eq!(e.compact(), 1);
        assert_eq!(e.stats().evicted_motifs, 1);
        assert_eq!(e.read(a, 1.0).unwrap().content, TEXT);
    }

    #[test]
    fn test_collapse_archives_losers() {
        let (e, _) = engine();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let state = e.request_branches(id, &[], 3).unwrap();
        assert_eq!(e.explore_paths_not_taken(id).unwrap().len(), 3);

        let winner = e.collapse(state.id).unwrap();
        let paths: Vec<_> = e.explore_paths_not_taken(id).unwrap().collect();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|b| b.id != winner.id));
        assert!(matches!(e.collapse(state.id), Err(EngineError::StateNotFound(_))));
        // the parent is untouched
        assert_eq!(e.read(id, 1.0).unwrap().content, TEXT);
    }

    #[test]
    fn test_commit_branch_creates_fragment() {
        let (e, _) = engine();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let hint = ScenarioHint::new("Engineers later replaced them with atomic references.");
        let state = e.request_branches(id, &[hint.clone()], 1).unwrap();
        let winner = e.collapse(state.id).unwrap();
        let child = e.commit_branch(&winner).unwrap();
        let content = e.read(child, 1.0).unwrap().content;
        assert!(content.ends_with(&hint.text));
        assert_eq!(e.fragment_count(), 2);
    }

    #[test]
    fn test_superposition_expires() {
        let (e, clock) = engine();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let state = e.request_branches(id, &[], 2).unwrap();
        clock.advance(e.config().branch.ttl_ms + 1);
        assert!(e.superposition(state.id).is_err());
        assert_eq!(e.purge_superpositions(), 1);
        assert_eq!(e.explore_paths_not_taken(id).unwrap().len(), 2);
    }

    #[test]
    fn test_expired_collapse_keeps_paths() {
        let (e, clock) = engine();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let state = e.request_branches(id, &[], 2).unwrap();
        clock.advance(e.config().branch.ttl_ms + 1);

        assert!(matches!(e.collapse(state.id), Err(EngineError::StateNotFound(_))));
        assert_eq!(e.purge_superpositions(), 1);
        assert_eq!(e.explore_paths_not_taken(id).unwrap().len(), 2);
    }

    #[test]
    fn test_branch_count_above_limit_rejected() {
        let (e, _) = engine();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let max = e.config().branch.max_branches;
        assert!(matches!(
            e.request_branches(id, &[], max + 1),
            Err(EngineError::InvalidInput(_))
        ));
        assert_eq!(e.request_branches(id, &[], max).unwrap().branches.len(), max);
    }

    #[test]
    fn test_commit_branch_needs_exact_parent() {
        let (e, _) = engine();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let state = e.request_branches(id, &[], 2).unwrap();
        let winner = e.collapse(state.id).unwrap();
        e.evict_motif(e.seed(id).unwrap().motif);
        assert!(matches!(
            e.commit_branch(&winner),
            Err(EngineError::Reconstruction(ReconstructionError::MotifEvicted { .. }))
        ));
        assert_eq!(e.fragment_count(), 1);
    }

    #[test]
    fn test_ingest_during_rebuild_keeps_cluster() {
        let (e, _) = engine();
        e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let mut job = e.start_rebuild(1);
        job.run(|| false);

        let late = e
            .ingest("Tidal pools shelter anemones between the rocks.", IngestMetadata::text())
            .unwrap();
        e.install_rebuild(job);

        let index = e.cluster_index();
        let cluster = index.cluster_of(late);
        assert!(cluster.is_some());
        assert_eq!(e.header(late).unwrap().cluster, cluster);
        assert_eq!(index.fragment_count(), 2);
    }

    #[test]
    fn test_ingest_updates_index_in_place() {
        let (e, _) = engine();
        e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let before = Arc::as_ptr(&e.cluster_index());
        e.ingest("Tidal pools shelter anemones between the rocks.", IngestMetadata::text())
            .unwrap();
        assert_eq!(Arc::as_ptr(&e.cluster_index()), before);
    }

    #[test]
    fn test_rebuild_until_cancelled_keeps_index() {
        let (e, _) = engine();
        e.ingest(TEXT, IngestMetadata::text()).unwrap();
        let before = e.cluster_index();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(e.rebuild_until(1, &cancel), Err(EngineError::Cancelled)));
        assert!(Arc::ptr_eq(&before, &e.cluster_index()));
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let (e, clock) = engine();
        let id = e.ingest(TEXT, IngestMetadata::text()).unwrap();
        e.access(id, "end-user", Layer::Core).unwrap();
        let snap = e.snapshot();

        let restored =
            MemoryEngine::restore(e.config().clone(), clock, None, snap.clone()).unwrap();
        assert_eq!(restored.snapshot(), snap);
        assert_eq!(restored.meta_memory(id).unwrap().access_count, 1);
        let next = restored.access(id, "end-user", Layer::Core).unwrap();
        assert!(next.fidelity > 0.0);
        assert_eq!(restored.access_events_since(1).len(), 1);
    }
}
