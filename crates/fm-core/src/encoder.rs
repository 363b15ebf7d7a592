//! Fractal encoding: every fragment's content becomes a motif in an
//! append-only arena. A motif is either a literal leaf or a reference to an
//! older motif plus a delta, so the arena forms a forest of self-similar
//! expansion rules. Handles only ever point backwards, which rules out
//! cycles without any bookkeeping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::EncoderConfig;
use crate::delta::{Delta, similarity};
use crate::error::ReconstructionError;
use crate::fragment::{FidelityTier, FragmentId, MemoryFragment};
use crate::hierarchy::HierarchyContext;
use crate::tokenizer::{normalize_whitespace, summarize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MotifHandle(pub u32);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotifBody {
    Literal(String),
    Derived(Delta),
    /// Body dropped to reclaim space. The summary survives.
    Evicted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotifNode {
    pub handle: MotifHandle,
    pub origin: Option<FragmentId>,
    pub base: Option<MotifHandle>,
    pub body: MotifBody,
    pub summary: String,
    /// Number of derived links between this node and its literal root.
    pub depth: usize,
    /// Byte length of the fully expanded content.
    pub content_len: usize,
}

impl MotifNode {
    pub fn is_evicted(&self) -> bool {
        matches!(self.body, MotifBody::Evicted)
    }

    /// Bytes this node itself occupies.
    pub fn stored_bytes(&self) -> usize {
        match &self.body {
            MotifBody::Literal(text) => text.len(),
            MotifBody::Derived(delta) => delta.stored_bytes(),
            MotifBody::Evicted => 0,
        }
    }
}

/// Compressed form of one fragment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodedSeed {
    pub motif: MotifHandle,
    pub base: Option<MotifHandle>,
    pub stored_bytes: usize,
    pub original_len: usize,
    pub depth: usize,
}

impl EncodedSeed {
    pub fn compression_ratio(&self) -> f64 {
        if self.stored_bytes == 0 || self.original_len == 0 {
            return 1.0;
        }
        self.original_len as f64 / self.stored_bytes as f64
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MotifArena {
    nodes: Vec<MotifNode>,
    #[serde(skip)]
    by_origin: HashMap<FragmentId, MotifHandle>,
}

impl MotifArena {
    pub fn from_nodes(nodes: Vec<MotifNode>) -> Self {
        let mut arena = Self {
            nodes,
            by_origin: HashMap::new(),
        };
        arena.rebuild_origin_index();
        arena
    }

    /// Latest motif per origin fragment wins.
    pub fn rebuild_origin_index(&mut self) {
        self.by_origin.clear();
        for node in &self.nodes {
            if let Some(origin) = node.origin {
                self.by_origin.insert(origin, node.handle);
            }
        }
    }

    pub fn nodes(&self) -> &[MotifNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, handle: MotifHandle) -> Option<&MotifNode> {
        self.nodes.get(handle.0 as usize)
    }

    pub fn motif_for(&self, fragment: FragmentId) -> Option<MotifHandle> {
        self.by_origin.get(&fragment).copied()
    }

    pub fn total_stored_bytes(&self) -> usize {
        self.nodes.iter().map(MotifNode::stored_bytes).sum()
    }

    fn node(&self, handle: MotifHandle) -> Result<&MotifNode, ReconstructionError> {
        self.get(handle)
            .ok_or(ReconstructionError::UnknownMotif { handle })
    }

    /// Handles from `handle` down to its literal root, inclusive.
    fn chain(&self, handle: MotifHandle) -> Result<Vec<MotifHandle>, ReconstructionError> {
        let mut chain = vec![handle];
        let mut current = self.node(handle)?;
        while let Some(base) = current.base {
            chain.push(base);
            current = self.node(base)?;
        }
        Ok(chain)
    }

    /// Fully expanded content of a motif.
    pub fn expand(&self, handle: MotifHandle) -> Result<String, ReconstructionError> {
        let chain = self.chain(handle)?;
        let mut content = String::new();
        for h in chain.iter().rev() {
            let node = self.node(*h)?;
            content = match &node.body {
                MotifBody::Literal(text) => text.clone(),
                MotifBody::Derived(delta) => delta
                    .apply(&content)
                    .map_err(|_| ReconstructionError::UnknownMotif { handle: *h })?,
                MotifBody::Evicted => {
                    return Err(ReconstructionError::MotifEvicted { handle: *h });
                }
            };
        }
        Ok(content)
    }

    /// Expand at most `levels` derived links; the unexpanded remainder is
    /// stood in for by its summary.
    fn expand_partial(
        &self,
        handle: MotifHandle,
        levels: usize,
    ) -> Result<String, ReconstructionError> {
        let chain = self.chain(handle)?;
        if levels >= chain.len() {
            return self.expand(handle);
        }
        if levels == 0 {
            return Ok(self.node(handle)?.summary.clone());
        }

        let mut approx = self.node(chain[levels])?.summary.clone();
        for h in chain[..levels].iter().rev() {
            let node = self.node(*h)?;
            let extra = match &node.body {
                MotifBody::Derived(delta) => delta.inserted_text(),
                MotifBody::Literal(text) => text.clone(),
                MotifBody::Evicted => {
                    return Err(ReconstructionError::MotifEvicted { handle: *h });
                }
            };
            if !extra.is_empty() {
                if !approx.is_empty() {
                    approx.push(' ');
                }
                approx.push_str(&extra);
            }
        }
        Ok(approx)
    }

    /// Drop a motif's body. Returns false if it was already gone.
    pub fn evict(&mut self, handle: MotifHandle) -> bool {
        match self.nodes.get_mut(handle.0 as usize) {
            Some(node) if !node.is_evicted() => {
                node.body = MotifBody::Evicted;
                true
            }
            _ => false,
        }
    }

    /// Live motifs that use `handle` as their base.
    pub fn dependents(&self, handle: MotifHandle) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.base == Some(handle) && !n.is_evicted())
            .count()
    }

    /// Closest motif below `handle` that still expands completely.
    pub fn nearest_surviving_ancestor(&self, handle: MotifHandle) -> Option<MotifHandle> {
        let chain = self.chain(handle).ok()?;
        chain
            .into_iter()
            .skip(1)
            .find(|h| self.expand(*h).is_ok())
    }

    fn push(
        &mut self,
        origin: Option<FragmentId>,
        base: Option<MotifHandle>,
        body: MotifBody,
        summary: String,
        content_len: usize,
    ) -> MotifHandle {
        let handle = MotifHandle(self.nodes.len() as u32);
        let depth = base
            .and_then(|b| self.get(b))
            .map(|b| b.depth + 1)
            .unwrap_or(0);
        self.nodes.push(MotifNode {
            handle,
            origin,
            base,
            body,
            summary,
            depth,
            content_len,
        });
        if let Some(origin) = origin {
            self.by_origin.insert(origin, handle);
        }
        handle
    }
}

/// Result of the read-only search phase, committed under a write lock.
#[derive(Clone, Debug)]
pub struct PreparedMotif {
    pub origin: FragmentId,
    pub base: Option<MotifHandle>,
    pub stored_content: String,
    pub delta: Option<Delta>,
    pub original_len: usize,
    pub similarity: f64,
}

pub struct FractalEncoder {
    config: EncoderConfig,
}

impl FractalEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Content as it will be stored for the given tier. Only lossless keeps
    /// the exact bytes.
    pub fn storable_content(content: &str, tier: FidelityTier) -> String {
        if tier.is_exact() {
            content.to_string()
        } else {
            normalize_whitespace(content)
        }
    }

    /// Search the hierarchy context for the closest motif within the distance
    /// threshold. Ties go to the lowest handle.
    pub fn find_motif(
        &self,
        arena: &MotifArena,
        content: &str,
        context: &HierarchyContext,
        exclude: Option<FragmentId>,
    ) -> Option<(MotifHandle, f64)> {
        let mut candidates: Vec<MotifHandle> = context
            .fragments
            .iter()
            .filter(|f| Some(**f) != exclude)
            .filter_map(|f| arena.motif_for(*f))
            .collect();
        candidates.sort();
        candidates.dedup();

        let mut best: Option<(MotifHandle, f64)> = None;
        for handle in candidates {
            let Some(node) = arena.get(handle) else {
                continue;
            };
            if node.depth + 1 > self.config.max_chain_depth {
                continue;
            }
            let Ok(candidate) = arena.expand(handle) else {
                continue;
            };
            let sim = similarity(&candidate, content);
            if 1.0 - sim > self.config.max_motif_distance {
                continue;
            }
            match best {
                Some((_, best_sim)) if best_sim >= sim => {}
                _ => best = Some((handle, sim)),
            }
        }
        best
    }

    /// Read-only half of `encode`.
    pub fn prepare(
        &self,
        arena: &MotifArena,
        fragment: &MemoryFragment,
        context: &HierarchyContext,
    ) -> PreparedMotif {
        let stored_content = Self::storable_content(&fragment.content, fragment.header.tier);
        let found = self.find_motif(arena, &stored_content, context, Some(fragment.header.id));

        let (base, delta, similarity) = match found {
            Some((handle, sim)) => match arena.expand(handle) {
                Ok(base_content) => {
                    let delta = Delta::diff(&base_content, &stored_content);
                    // A delta that costs more than the literal is no compression
                    if delta.stored_bytes() < stored_content.len() {
                        (Some(handle), Some(delta), sim)
                    } else {
                        (None, None, 0.0)
                    }
                }
                Err(_) => (None, None, 0.0),
            },
            None => (None, None, 0.0),
        };

        PreparedMotif {
            origin: fragment.header.id,
            base,
            stored_content,
            delta,
            original_len: fragment.content.len(),
            similarity,
        }
    }

    /// Write half of `encode`. Falls back to a literal when the chosen base
    /// was evicted after `prepare` ran.
    pub fn commit(&self, arena: &mut MotifArena, prepared: PreparedMotif) -> EncodedSeed {
        let summary = summarize(&prepared.stored_content);
        let content_len = prepared.stored_content.len();

        let base_alive = prepared
            .base
            .and_then(|b| arena.get(b))
            .is_some_and(|n| !n.is_evicted());

        let (base, body) = match (prepared.base, prepared.delta) {
            (Some(base), Some(delta)) if base_alive => (Some(base), MotifBody::Derived(delta)),
            _ => (None, MotifBody::Literal(prepared.stored_content)),
        };

        let stored_bytes = match &body {
            MotifBody::Literal(text) => text.len(),
            MotifBody::Derived(delta) => delta.stored_bytes(),
            MotifBody::Evicted => 0,
        };

        let motif = arena.push(Some(prepared.origin), base, body, summary, content_len);
        let depth = arena.get(motif).map(|n| n.depth).unwrap_or(0);

        tracing::debug!(
            fragment = %prepared.origin,
            motif = motif.0,
            base = ?base.map(|b| b.0),
            stored_bytes,
            "encoded fragment"
        );

        EncodedSeed {
            motif,
            base,
            stored_bytes,
            original_len: prepared.original_len,
            depth,
        }
    }

    /// Reconstruct content. `fidelity_target` ≥ 1 expands the whole chain;
    /// lower targets stop early and return an approximation.
    pub fn decode_content(
        &self,
        arena: &MotifArena,
        seed: &EncodedSeed,
        fidelity_target: f64,
    ) -> Result<String, ReconstructionError> {
        if fidelity_target >= 1.0 {
            return arena.expand(seed.motif);
        }
        let target = fidelity_target.clamp(0.0, 1.0);
        let levels = (target * (seed.depth + 1) as f64).round() as usize;
        arena.expand_partial(seed.motif, levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::ContentType;

    const A: &str = "The lighthouse keeper logged every passing freighter, \
        noting hull colours and the direction of the wind each evening.";

    fn frag(content: &str, tier: FidelityTier) -> MemoryFragment {
        let mut f = MemoryFragment::new(content, ContentType::Text, vec![], 0);
        f.header.tier = tier;
        f
    }

    fn ctx(fragments: &[FragmentId]) -> HierarchyContext {
        HierarchyContext {
            clusters: vec![],
            fragments: fragments.to_vec(),
        }
    }

    impl FractalEncoder {
        fn encode(
            &self,
            arena: &mut MotifArena,
            fragment: &MemoryFragment,
            context: &HierarchyContext,
        ) -> EncodedSeed {
            let prepared = self.prepare(arena, fragment, context);
            self.commit(arena, prepared)
        }
    }

    fn encoder() -> FractalEncoder {
        FractalEncoder::new(EncoderConfig::default())
    }

    #[test]
    fn test_unique_content_is_literal_leaf() {
        let mut arena = MotifArena::default();
        let f = frag(A, FidelityTier::Lossless);
        let seed = encoder().encode(&mut arena, &f, &ctx(&[]));
        assert_eq!(seed.base, None);
        assert_eq!(seed.depth, 0);
        assert!((seed.compression_ratio() - 1.0).abs() < 1e-12);
        assert_eq!(arena.expand(seed.motif).unwrap(), A);
    }

    #[test]
    fn test_lossless_roundtrip_exact() {
        let mut arena = MotifArena::default();
        let text = "  indented\n\tlines   keep   their spacing  \n";
        let f = frag(text, FidelityTier::Lossless);
        let seed = encoder().encode(&mut arena, &f, &ctx(&[]));
        let decoded = encoder().decode_content(&arena, &seed, 1.0).unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_near_duplicate_becomes_delta() {
        let enc = encoder();
        let mut arena = MotifArena::default();
        let a = frag(A, FidelityTier::Lossless);
        let seed_a = enc.encode(&mut arena, &a, &ctx(&[]));

        let b_text = A.replace("evening", "morning");
        let b = frag(&b_text, FidelityTier::LossySafe);
        let seed_b = enc.encode(&mut arena, &b, &ctx(&[a.header.id]));

        assert_eq!(seed_b.base, Some(seed_a.motif));
        assert_eq!(seed_b.depth, 1);
        assert!(seed_b.compression_ratio() > 4.0, "ratio {}", seed_b.compression_ratio());
        let decoded = enc.decode_content(&arena, &seed_b, 1.0).unwrap();
        assert_eq!(decoded, normalize_whitespace(&b_text));
    }

    #[test]
    fn test_dissimilar_content_not_matched() {
        let enc = encoder();
        let mut arena = MotifArena::default();
        let a = frag(A, FidelityTier::Lossless);
        enc.encode(&mut arena, &a, &ctx(&[]));
        let c = frag("Completely unrelated words about compilers.", FidelityTier::Lossless);
        let seed = enc.encode(&mut arena, &c, &ctx(&[a.header.id]));
        assert_eq!(seed.base, None);
    }

    #[test]
    fn test_low_fidelity_decode_is_approximate() {
        let enc = encoder();
        let mut arena = MotifArena::default();
        let a = frag(A, FidelityTier::Lossless);
        enc.encode(&mut arena, &a, &ctx(&[]));
        let b = frag(&A.replace("evening", "morning"), FidelityTier::Lossless);
        let seed_b = enc.encode(&mut arena, &b, &ctx(&[a.header.id]));

        let summary_only = enc.decode_content(&arena, &seed_b, 0.0).unwrap();
        assert!(summary_only.len() <= A.len());

        // depth 1, target 0.5 → expand one level, base replaced by its summary
        let partial = enc.decode_content(&arena, &seed_b, 0.5).unwrap();
        assert!(partial.contains("morning"), "partial: {partial}");
    }

    #[test]
    fn test_evicted_base_fails_reconstruction() {
        let enc = encoder();
        let mut arena = MotifArena::default();
        let a = frag(A, FidelityTier::Lossless);
        let seed_a = enc.encode(&mut arena, &a, &ctx(&[]));
        let b = frag(&A.replace("evening", "morning"), FidelityTier::Lossless);
        let seed_b = enc.encode(&mut arena, &b, &ctx(&[a.header.id]));

        assert_eq!(arena.dependents(seed_a.motif), 1);
        assert!(arena.evict(seed_a.motif));
        assert!(!arena.evict(seed_a.motif));
        let err = enc.decode_content(&arena, &seed_b, 1.0).unwrap_err();
        assert_eq!(err, ReconstructionError::MotifEvicted { handle: seed_a.motif });
        assert_eq!(arena.nearest_surviving_ancestor(seed_b.motif), None);
    }

    #[test]
    fn test_commit_falls_back_when_base_evicted() {
        let enc = encoder();
        let mut arena = MotifArena::default();
        let a = frag(A, FidelityTier::Lossless);
        let seed_a = enc.encode(&mut arena, &a, &ctx(&[]));
        let b = frag(&A.replace("evening", "morning"), FidelityTier::Lossless);
        let prepared = enc.prepare(&arena, &b, &ctx(&[a.header.id]));
        assert_eq!(prepared.base, Some(seed_a.motif));

        arena.evict(seed_a.motif);
        let seed_b = enc.commit(&mut arena, prepared);
        assert_eq!(seed_b.base, None);
        assert_eq!(arena.expand(seed_b.motif).unwrap(), b.content);
    }

    #[test]
    fn test_chain_depth_capped() {
        let enc = FractalEncoder::new(EncoderConfig {
            max_chain_depth: 1,
            ..EncoderConfig::default()
        });
        let mut arena = MotifArena::default();
        let a = frag(A, FidelityTier::Lossless);
        enc.encode(&mut arena, &a, &ctx(&[]));
        let b = frag(&A.replace("evening", "morning"), FidelityTier::Lossless);
        let seed_b = enc.encode(&mut arena, &b, &ctx(&[a.header.id]));
        assert_eq!(seed_b.depth, 1);

        // Only b is in context; linking to it would make depth 2
        let c = frag(&A.replace("evening", "midnight"), FidelityTier::Lossless);
        let seed_c = enc.encode(&mut arena, &c, &ctx(&[b.header.id]));
        assert_eq!(seed_c.base, None);
    }

    #[test]
    fn test_arena_serde_rebuilds_origin_index() {
        let enc = encoder();
        let mut arena = MotifArena::default();
        let a = frag(A, FidelityTier::Lossless);
        let seed = enc.encode(&mut arena, &a, &ctx(&[]));
        let json = serde_json::to_string(&arena).unwrap();
        let back: MotifArena = serde_json::from_str(&json).unwrap();
        let back = MotifArena::from_nodes(back.nodes().to_vec());
        assert_eq!(back.motif_for(a.header.id), Some(seed.motif));
    }
}
