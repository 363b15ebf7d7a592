//! Causal branching: speculative continuations of a fragment held in
//! superposition until one is collapsed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::BranchConfig;
use crate::constants::EPSILON;
use crate::delta::{Delta, DeltaMismatch, similarity};
use crate::fragment::FragmentId;
use crate::phasor::{
    coherence, interference_matrix, is_normalized, normalize_amplitudes, phase_difference,
};
use crate::tokenizer::{split_sentences, tokenize};

pub type BranchId = u64;
pub type StateId = u64;

/// A caller's guess at where things go next.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioHint {
    pub text: String,
    #[serde(default = "default_hint_weight")]
    pub weight: f64,
}

fn default_hint_weight() -> f64 {
    1.0
}

impl ScenarioHint {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            weight: 1.0,
        }
    }

    pub fn weighted(text: impl Into<String>, weight: f64) -> Self {
        Self {
            text: text.into(),
            weight,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CausalBranch {
    pub id: BranchId,
    pub parent: FragmentId,
    /// Normalized probability weight.
    pub weight: f64,
    /// Divergent content, relative to the parent.
    pub delta: Delta,
    pub coherence: f64,
    pub created_at: u64,
}

impl CausalBranch {
    pub fn content(&self, parent_content: &str) -> Result<String, DeltaMismatch> {
        self.delta.apply(parent_content)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuperpositionState {
    pub id: StateId,
    pub parent: FragmentId,
    pub branches: Vec<CausalBranch>,
    /// Σa² = 1.
    pub amplitudes: Vec<f64>,
    /// Phase of each branch relative to the parent.
    pub phases: Vec<f64>,
    /// Pairwise `cos Δφ`.
    pub interference: Vec<Vec<f64>>,
    pub created_at: u64,
}

impl SuperpositionState {
    fn scores(&self) -> Vec<f64> {
        self.branches
            .iter()
            .zip(&self.amplitudes)
            .map(|(b, a)| a * a * b.coherence)
            .collect()
    }

    /// Normalized `a² × coherence` per branch.
    pub fn probabilities(&self) -> Vec<f64> {
        let scores = self.scores();
        let total: f64 = scores.iter().sum();
        if total <= EPSILON {
            let n = scores.len().max(1) as f64;
            return vec![1.0 / n; scores.len()];
        }
        scores.into_iter().map(|s| s / total).collect()
    }

    /// The branch with the highest `a² × coherence`; ties go to the lowest
    /// branch id. Does not modify the state.
    pub fn collapse(&self) -> Option<&CausalBranch> {
        let scores = self.scores();
        let mut best: Option<(usize, f64)> = None;
        for (i, s) in scores.iter().enumerate() {
            match best {
                Some((bi, bs))
                    if bs > *s || (bs == *s && self.branches[bi].id < self.branches[i].id) => {}
                _ => best = Some((i, *s)),
            }
        }
        best.map(|(i, _)| &self.branches[i])
    }

    pub fn branch(&self, id: BranchId) -> Option<&CausalBranch> {
        self.branches.iter().find(|b| b.id == id)
    }
}

/// Generates and superposes branches. Owns the noise RNG and the id
/// counters.
pub struct BranchSimulator {
    config: BranchConfig,
    rng: Mutex<SmallRng>,
    next_branch: AtomicU64,
    next_state: AtomicU64,
}

impl BranchSimulator {
    pub fn new(config: BranchConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
            next_branch: AtomicU64::new(1),
            next_state: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BranchConfig {
        &self.config
    }

    /// Continue numbering after restored ids.
    pub fn resume_ids(&self, next_branch: BranchId, next_state: StateId) {
        self.next_branch.fetch_max(next_branch, Ordering::SeqCst);
        self.next_state.fetch_max(next_state, Ordering::SeqCst);
    }

    pub fn next_ids(&self) -> (BranchId, StateId) {
        (
            self.next_branch.load(Ordering::SeqCst),
            self.next_state.load(Ordering::SeqCst),
        )
    }

    /// Candidate continuations with normalized weights. Returns each branch
    /// with its full content.
    pub fn generate(
        &self,
        parent: FragmentId,
        parent_content: &str,
        n: usize,
        hints: &[ScenarioHint],
        now: u64,
    ) -> Vec<(CausalBranch, String)> {
        let requested = n;
        let n = n.clamp(1, self.config.max_branches);
        if n != requested {
            tracing::warn!(requested, generated = n, "branch count clamped");
        }
        let prior = self.config.prior_weight / n as f64;

        let mut out = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);
        {
            let mut rng = self.rng.lock();
            for i in 0..n {
                let continuation = match hints.get(i) {
                    Some(h) => h.text.clone(),
                    None => recombine(parent_content, i),
                };
                let content = append_continuation(parent_content, &continuation);

                let hint_term: f64 = hints
                    .iter()
                    .map(|h| h.weight * similarity(&content, &h.text))
                    .sum();
                let noise = if self.config.noise_amplitude > 0.0 {
                    rng.random_range(-self.config.noise_amplitude..=self.config.noise_amplitude)
                } else {
                    0.0
                };
                weights.push((prior + self.config.hint_gain * hint_term + noise).max(EPSILON));

                let branch = CausalBranch {
                    id: self.next_branch.fetch_add(1, Ordering::SeqCst),
                    parent,
                    weight: 0.0,
                    delta: Delta::diff(parent_content, &content),
                    coherence: 1.0,
                    created_at: now,
                };
                out.push((branch, content));
            }
        }

        let total: f64 = weights.iter().sum();
        for ((branch, _), w) in out.iter_mut().zip(&weights) {
            branch.weight = w / total;
        }
        out
    }

    /// Amplitudes from weights, interference from content similarity, and
    /// per-branch coherence.
    pub fn superpose(
        &self,
        parent: FragmentId,
        parent_content: &str,
        generated: Vec<(CausalBranch, String)>,
        now: u64,
    ) -> SuperpositionState {
        let n = generated.len();
        let mut amplitudes: Vec<f64> = generated.iter().map(|(b, _)| b.weight.max(0.0).sqrt()).collect();
        normalize_amplitudes(&mut amplitudes);
        debug_assert!(is_normalized(&amplitudes));

        let mut sims = vec![vec![1.0; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = similarity(&generated[i].1, &generated[j].1);
                sims[i][j] = s;
                sims[j][i] = s;
            }
        }
        let interference = interference_matrix(&sims);
        let coherences = coherence(&amplitudes, &interference);
        let phases = generated
            .iter()
            .map(|(_, content)| phase_difference(similarity(parent_content, content)))
            .collect();

        let branches = generated
            .into_iter()
            .zip(coherences)
            .map(|((mut b, _), c)| {
                b.coherence = c;
                b
            })
            .collect();

        SuperpositionState {
            id: self.next_state.fetch_add(1, Ordering::SeqCst),
            parent,
            branches,
            amplitudes,
            phases,
            interference,
            created_at: now,
        }
    }

    pub fn branch(
        &self,
        parent: FragmentId,
        parent_content: &str,
        n: usize,
        hints: &[ScenarioHint],
        now: u64,
    ) -> SuperpositionState {
        let generated = self.generate(parent, parent_content, n, hints, now);
        self.superpose(parent, parent_content, generated, now)
    }
}

fn append_continuation(parent: &str, continuation: &str) -> String {
    let mut content = parent.trim_end().to_string();
    if !content.is_empty() && !continuation.is_empty() {
        content.push(' ');
    }
    content.push_str(continuation.trim());
    content
}

/// A continuation built from the parent's own material. Multi-sentence
/// parents are rotated; single sentences fall back to a keyword rotation.
fn recombine(parent: &str, index: usize) -> String {
    let sentences = split_sentences(parent);
    if sentences.len() >= 2 {
        let k = sentences.len();
        let start = (index + 1) % k;
        return (0..k.min(2))
            .map(|o| sentences[(start + o) % k].as_str())
            .collect::<Vec<_>>()
            .join(" ");
    }

    let mut keywords: Vec<String> = Vec::new();
    for t in tokenize(parent) {
        if t.len() > 3 && !keywords.contains(&t) {
            keywords.push(t);
        }
    }
    if keywords.is_empty() {
        return format!("variant {}", index + 1);
    }
    let k = keywords.len();
    (0..k.min(6))
        .map(|o| keywords[(index + o) % k].as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pending superpositions, oldest first. Bounded in size and age.
#[derive(Debug)]
pub struct SuperpositionCache {
    capacity: usize,
    ttl_ms: u64,
    entries: VecDeque<SuperpositionState>,
}

impl SuperpositionCache {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl_ms,
            entries: VecDeque::new(),
        }
    }

    fn expired(&self, state: &SuperpositionState, now: u64) -> bool {
        now.saturating_sub(state.created_at) > self.ttl_ms
    }

    /// Insert, returning whatever had to be evicted to make room.
    pub fn insert(&mut self, state: SuperpositionState) -> Vec<SuperpositionState> {
        self.entries.push_back(state);
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some(old) = self.entries.pop_front() {
                evicted.push(old);
            }
        }
        evicted
    }

    pub fn get(&self, id: StateId, now: u64) -> Option<&SuperpositionState> {
        self.entries
            .iter()
            .find(|s| s.id == id)
            .filter(|s| !self.expired(s, now))
    }

    /// Remove a live state. An expired one stays put for `purge_expired`.
    pub fn take(&mut self, id: StateId, now: u64) -> Option<SuperpositionState> {
        let pos = self.entries.iter().position(|s| s.id == id)?;
        if self.expired(&self.entries[pos], now) {
            return None;
        }
        self.entries.remove(pos)
    }

    pub fn purge_expired(&mut self, now: u64) -> Vec<SuperpositionState> {
        let (expired, live): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|s| now.saturating_sub(s.created_at) > self.ttl_ms);
        self.entries = live.into();
        expired
    }

    pub fn pending_for(&self, parent: FragmentId) -> impl Iterator<Item = &SuperpositionState> {
        self.entries.iter().filter(move |s| s.parent == parent)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Losing branches per parent, most recent `capacity` kept.
#[derive(Debug, Default, Clone)]
pub struct BranchArchive {
    capacity: usize,
    by_parent: HashMap<FragmentId, VecDeque<CausalBranch>>,
}

impl BranchArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            by_parent: HashMap::new(),
        }
    }

    pub fn archive(&mut self, branches: impl IntoIterator<Item = CausalBranch>) {
        for b in branches {
            let list = self.by_parent.entry(b.parent).or_default();
            list.push_back(b);
            while list.len() > self.capacity {
                list.pop_front();
            }
        }
    }

    pub fn for_parent(&self, parent: FragmentId) -> impl Iterator<Item = &CausalBranch> {
        self.by_parent.get(&parent).into_iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_parent.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every uncollapsed branch of a fragment, ordered by id. A snapshot: it
/// never touches the engine, and can be cloned or restarted freely.
#[derive(Clone, Debug)]
pub struct PathsNotTaken {
    branches: Vec<CausalBranch>,
    pos: usize,
}

impl PathsNotTaken {
    pub fn new(mut branches: Vec<CausalBranch>) -> Self {
        branches.sort_by_key(|b| b.id);
        branches.dedup_by_key(|b| b.id);
        Self { branches, pos: 0 }
    }

    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn as_slice(&self) -> &[CausalBranch] {
        &self.branches
    }
}

impl Iterator for PathsNotTaken {
    type Item = CausalBranch;

    fn next(&mut self) -> Option<Self::Item> {
        let b = self.branches.get(self.pos)?.clone();
        self.pos += 1;
        Some(b)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.branches.len() - self.pos;
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for PathsNotTaken {}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    const PARENT: &str = "The expedition reached the ridge at dawn. Supplies were running low.";

    fn sim(seed: u64) -> BranchSimulator {
        BranchSimulator::new(BranchConfig {
            seed: Some(seed),
            ..BranchConfig::default()
        })
    }

    fn parent_id() -> FragmentId {
        FragmentId::from_u128(1)
    }

    #[test]
    fn test_weights_normalized_and_ids_increase() {
        let s = sim(42);
        let generated = s.generate(parent_id(), PARENT, 4, &[], 0);
        assert_eq!(generated.len(), 4);
        let total: f64 = generated.iter().map(|(b, _)| b.weight).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        for w in generated.windows(2) {
            assert!(w[0].0.id < w[1].0.id);
        }
    }

    #[test]
    fn test_branch_content_is_delta_against_parent() {
        let s = sim(42);
        let hint = ScenarioHint::new("They turned back toward the valley.");
        let generated = s.generate(parent_id(), PARENT, 1, std::slice::from_ref(&hint), 0);
        let (branch, content) = &generated[0];
        assert!(content.ends_with(&hint.text));
        assert_eq!(branch.content(PARENT).unwrap(), *content);
    }

    #[test]
    fn test_recombination_differs_per_index() {
        assert_ne!(recombine(PARENT, 0), recombine(PARENT, 1));
        assert_eq!(recombine(PARENT, 3), recombine(PARENT, 3));
        assert_eq!(recombine("", 0), "variant 1");
    }

    #[test]
    fn test_hinted_branch_wins_collapse() {
        let s = sim(7);
        let hints = vec![
            ScenarioHint::weighted("They turned back toward the valley.", 0.1),
            ScenarioHint::weighted("A storm rolled in from the north and trapped them.", 1.0),
            ScenarioHint::weighted("Rescue helicopters spotted the camp.", 0.1),
        ];
        let state = s.branch(parent_id(), PARENT, 3, &hints, 0);
        let winner = state.collapse().unwrap();
        assert_eq!(winner.id, state.branches[1].id);

        let probs = state.probabilities();
        let best = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(best, 1);
        assert_relative_eq!(probs.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_collapse_idempotent_and_pure() {
        let s = sim(3);
        let state = s.branch(parent_id(), PARENT, 5, &[], 0);
        let before = state.clone();
        let a = state.collapse().unwrap().id;
        let b = state.collapse().unwrap().id;
        assert_eq!(a, b);
        assert_eq!(state, before);
    }

    #[test]
    fn test_collapse_tie_goes_to_lowest_id() {
        let s = BranchSimulator::new(BranchConfig {
            noise_amplitude: 0.0,
            ..BranchConfig::default()
        });
        let hints = vec![ScenarioHint::new("same"), ScenarioHint::new("same")];
        let state = s.branch(parent_id(), PARENT, 2, &hints, 0);
        assert_eq!(state.collapse().unwrap().id, state.branches[0].id);
    }

    #[test]
    fn test_single_branch_fully_coherent() {
        let state = sim(1).branch(parent_id(), PARENT, 1, &[], 0);
        assert_eq!(state.branches[0].coherence, 1.0);
        assert!(is_normalized(&state.amplitudes));
    }

    #[test]
    fn test_cache_capacity_and_ttl() {
        let s = sim(1);
        let mut cache = SuperpositionCache::new(2, 100);
        let a = s.branch(parent_id(), PARENT, 2, &[], 0);
        let b = s.branch(parent_id(), PARENT, 2, &[], 50);
        let c = s.branch(parent_id(), PARENT, 2, &[], 60);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        assert!(cache.insert(a).is_empty());
        assert!(cache.insert(b).is_empty());
        let evicted = cache.insert(c);
        assert_eq!(evicted[0].id, a_id);

        assert!(cache.get(b_id, 100).is_some());
        assert!(cache.get(b_id, 151).is_none());
        let expired = cache.purge_expired(155);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, b_id);
        assert!(cache.take(c_id, 155).is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_take_leaves_expired_state_for_purge() {
        let s = sim(1);
        let mut cache = SuperpositionCache::new(4, 100);
        let state = s.branch(parent_id(), PARENT, 2, &[], 0);
        let id = state.id;
        cache.insert(state);

        assert!(cache.take(id, 101).is_none());
        assert_eq!(cache.len(), 1);
        let expired = cache.purge_expired(101);
        assert_eq!(expired[0].branches.len(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_archive_bounded_per_parent() {
        let s = sim(1);
        let mut archive = BranchArchive::new(3);
        let state = s.branch(parent_id(), PARENT, 5, &[], 0);
        let last = state.branches[4].id;
        archive.archive(state.branches);
        assert_eq!(archive.len(), 3);
        assert_eq!(archive.for_parent(parent_id()).last().unwrap().id, last);
    }

    #[test]
    fn test_paths_not_taken_restartable() {
        let s = sim(1);
        let state = s.branch(parent_id(), PARENT, 3, &[], 0);
        let mut branches = state.branches.clone();
        branches.reverse();
        let mut paths = PathsNotTaken::new(branches);
        assert_eq!(paths.len(), 3);
        let first: Vec<_> = paths.clone().map(|b| b.id).collect();
        assert!(first.windows(2).all(|w| w[0] < w[1]));
        paths.next();
        paths.restart();
        assert_eq!(paths.map(|b| b.id).collect::<Vec<_>>(), first);
    }

    proptest! {
        #[test]
        fn prop_amplitudes_normalized(seed in any::<u64>(), n in 1usize..10, hints in 0usize..4) {
            let s = sim(seed);
            let hints: Vec<_> = (0..hints)
                .map(|i| ScenarioHint::weighted(format!("outcome number {i}"), 0.5))
                .collect();
            let state = s.branch(parent_id(), PARENT, n, &hints, 0);
            prop_assert!(is_normalized(&state.amplitudes));
            for b in &state.branches {
                prop_assert!((0.0..=1.0).contains(&b.coherence));
            }
        }
    }
}
