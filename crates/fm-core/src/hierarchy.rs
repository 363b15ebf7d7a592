//! Concept hierarchy: fragments grouped into depth-0 clusters, clusters
//! promoted into meta-concepts. Held as an arena indexed by `ClusterId`.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::HierarchyConfig;
use crate::embedding::{cosine, weighted_centroid};
use crate::fragment::FragmentId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u32);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConceptCluster {
    pub id: ClusterId,
    pub depth: usize,
    /// For meta-concepts, the union of all descendant members.
    pub members: BTreeSet<FragmentId>,
    pub parent: Option<ClusterId>,
    pub children: Vec<ClusterId>,
    pub centroid: Vec<f32>,
    /// Mean member-to-centroid cosine similarity.
    pub cohesion: f64,
}

impl ConceptCluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Where the encoder looks for motifs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HierarchyContext {
    pub clusters: Vec<ClusterId>,
    pub fragments: Vec<FragmentId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterIndex {
    dims: usize,
    clusters: Vec<ConceptCluster>,
    #[serde(skip)]
    membership: HashMap<FragmentId, ClusterId>,
}

impl ClusterIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            clusters: Vec::new(),
            membership: HashMap::new(),
        }
    }

    pub fn from_clusters(dims: usize, clusters: Vec<ConceptCluster>) -> Self {
        let mut index = Self {
            dims,
            clusters,
            membership: HashMap::new(),
        };
        index.rebuild_membership();
        index
    }

    pub fn rebuild_membership(&mut self) {
        self.membership.clear();
        for c in self.clusters.iter().filter(|c| c.depth == 0) {
            for m in &c.members {
                self.membership.insert(*m, c.id);
            }
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn clusters(&self) -> &[ConceptCluster] {
        &self.clusters
    }

    pub fn get(&self, id: ClusterId) -> Option<&ConceptCluster> {
        self.clusters.get(id.0 as usize)
    }

    pub fn cluster_of(&self, fragment: FragmentId) -> Option<ClusterId> {
        self.membership.get(&fragment).copied()
    }

    pub fn depth0(&self) -> impl Iterator<Item = &ConceptCluster> {
        self.clusters.iter().filter(|c| c.depth == 0)
    }

    pub fn max_depth(&self) -> usize {
        self.clusters.iter().map(|c| c.depth).max().unwrap_or(0)
    }

    pub fn fragment_count(&self) -> usize {
        self.membership.len()
    }

    /// Closest depth-0 cluster by cosine; ties go to the lowest id.
    pub fn nearest(&self, embedding: &[f32]) -> Option<(ClusterId, f64)> {
        let mut best: Option<(ClusterId, f64)> = None;
        for c in self.depth0() {
            let sim = cosine(&c.centroid, embedding);
            match best {
                Some((_, s)) if s >= sim => {}
                _ => best = Some((c.id, sim)),
            }
        }
        best
    }

    /// The `k` best depth-0 clusters for a query, most similar first.
    pub fn probe(&self, embedding: &[f32], k: usize) -> Vec<ClusterId> {
        let mut scored: Vec<(ClusterId, f64)> = self
            .depth0()
            .map(|c| (c.id, cosine(&c.centroid, embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.into_iter().take(k).map(|(id, _)| id).collect()
    }

    /// Ancestors of a cluster, nearest first.
    pub fn ancestors(&self, id: ClusterId) -> Vec<ClusterId> {
        let mut out = Vec::new();
        let mut current = self.get(id).and_then(|c| c.parent);
        while let Some(p) = current {
            out.push(p);
            current = self.get(p).and_then(|c| c.parent);
        }
        out
    }

    /// Nearest depth-0 cluster plus its ancestors, with every member they
    /// contain. Empty when the index has no clusters.
    pub fn context_for(&self, embedding: &[f32]) -> HierarchyContext {
        let Some((nearest, _)) = self.nearest(embedding) else {
            return HierarchyContext::default();
        };
        let mut clusters = vec![nearest];
        clusters.extend(self.ancestors(nearest));

        let mut fragments = BTreeSet::new();
        for id in &clusters {
            if let Some(c) = self.get(*id) {
                fragments.extend(c.members.iter().copied());
            }
        }
        HierarchyContext {
            clusters,
            fragments: fragments.into_iter().collect(),
        }
    }

    /// Place a fragment: join the nearest depth-0 cluster at or above the
    /// threshold, or found a new one. A fragment that is already placed is
    /// moved.
    pub fn assign(
        &mut self,
        fragment: FragmentId,
        embedding: &[f32],
        assign_threshold: f64,
    ) -> ClusterId {
        if self.membership.contains_key(&fragment) {
            self.remove(fragment);
        }

        let target = match self.nearest(embedding) {
            Some((id, sim)) if sim >= assign_threshold => id,
            _ => {
                let id = ClusterId(self.clusters.len() as u32);
                self.clusters.push(ConceptCluster {
                    id,
                    depth: 0,
                    members: BTreeSet::new(),
                    parent: None,
                    children: Vec::new(),
                    centroid: vec![0.0; embedding.len()],
                    cohesion: 1.0,
                });
                id
            }
        };

        let mut current = Some(target);
        while let Some(id) = current {
            let Some(c) = self.clusters.get_mut(id.0 as usize) else {
                break;
            };
            if c.depth == 0 {
                let n = c.members.len() as f32;
                if c.centroid.len() == embedding.len() {
                    for (x, e) in c.centroid.iter_mut().zip(embedding) {
                        *x = (*x * n + e) / (n + 1.0);
                    }
                } else {
                    c.centroid = embedding.to_vec();
                }
            }
            c.members.insert(fragment);
            current = c.parent;
        }
        self.membership.insert(fragment, target);
        target
    }

    /// Drop a fragment from its clusters. Centroids are left as they are
    /// until the next rebuild.
    pub fn remove(&mut self, fragment: FragmentId) -> Option<ClusterId> {
        let id = self.membership.remove(&fragment)?;
        let mut current = Some(id);
        while let Some(cid) = current {
            let Some(c) = self.clusters.get_mut(cid.0 as usize) else {
                break;
            };
            c.members.remove(&fragment);
            current = c.parent;
        }
        Some(id)
    }
}

/// Resumable k-means over a snapshot of fragment embeddings. Each `step` is
/// one assignment/update pass; the result is swapped in by the caller.
#[derive(Clone, Debug)]
pub struct RebuildJob {
    config: HierarchyConfig,
    depth: usize,
    dims: usize,
    points: Vec<(FragmentId, Vec<f32>)>,
    centroids: Vec<Vec<f32>>,
    groups: Vec<Vec<usize>>,
    iteration: usize,
    converged: bool,
}

impl RebuildJob {
    /// Seed from the current depth-0 centroids. Points are sorted by id so
    /// the iteration does not depend on map order.
    pub fn new(
        index: &ClusterIndex,
        mut points: Vec<(FragmentId, Vec<f32>)>,
        config: HierarchyConfig,
        depth: usize,
    ) -> Self {
        points.sort_by(|a, b| a.0.cmp(&b.0));
        let centroids = index.depth0().map(|c| c.centroid.clone()).collect();
        Self {
            config,
            depth,
            dims: index.dims(),
            points,
            centroids,
            groups: Vec::new(),
            iteration: 0,
            converged: false,
        }
    }

    pub fn snapshot_len(&self) -> usize {
        self.points.len()
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn is_done(&self) -> bool {
        self.converged || self.iteration >= self.config.max_iterations
    }

    /// One pass. Returns true once the partition has stopped changing or
    /// the iteration bound is reached.
    pub fn step(&mut self) -> bool {
        if self.is_done() {
            return true;
        }

        let mut grouped: Vec<Vec<usize>> = vec![Vec::new(); self.centroids.len()];
        let mut singletons = Vec::new();
        for (pi, (_, emb)) in self.points.iter().enumerate() {
            let mut best: Option<(usize, f64)> = None;
            for (ci, c) in self.centroids.iter().enumerate() {
                let sim = cosine(c, emb);
                match best {
                    Some((_, s)) if s >= sim => {}
                    _ => best = Some((ci, sim)),
                }
            }
            match best {
                Some((ci, sim)) if sim >= self.config.assign_threshold => grouped[ci].push(pi),
                _ => singletons.push(vec![pi]),
            }
        }

        // Canonical order: by smallest member, which is the smallest id since
        // points are sorted
        let mut groups: Vec<Vec<usize>> = grouped
            .into_iter()
            .filter(|g| !g.is_empty())
            .chain(singletons)
            .collect();
        groups.sort_by_key(|g| g[0]);

        self.centroids = groups
            .iter()
            .map(|g| self.mean_of(g))
            .collect();
        self.converged = groups == self.groups;
        self.groups = groups;
        self.iteration += 1;

        tracing::debug!(
            iteration = self.iteration,
            clusters = self.groups.len(),
            converged = self.converged,
            "rebuild step"
        );
        self.is_done()
    }

    /// Step until done or `cancelled` says stop. Returns false when cancelled.
    pub fn run(&mut self, cancelled: impl Fn() -> bool) -> bool {
        while !self.is_done() {
            if cancelled() {
                return false;
            }
            self.step();
        }
        true
    }

    fn mean_of(&self, group: &[usize]) -> Vec<f32> {
        weighted_centroid(
            group.iter().map(|i| (self.points[*i].1.as_slice(), 1.0)),
            self.dims,
        )
        .unwrap_or_else(|| vec![0.0; self.dims])
    }

    /// Build the new index from the last partition and promote it.
    pub fn finish(mut self) -> ClusterIndex {
        if self.groups.is_empty() && !self.points.is_empty() {
            self.step();
        }

        let mut clusters = Vec::with_capacity(self.groups.len());
        for (i, group) in self.groups.iter().enumerate() {
            let centroid = self.centroids[i].clone();
            let cohesion = group
                .iter()
                .map(|pi| cosine(&self.points[*pi].1, &centroid))
                .sum::<f64>()
                / group.len() as f64;
            clusters.push(ConceptCluster {
                id: ClusterId(i as u32),
                depth: 0,
                members: group.iter().map(|pi| self.points[*pi].0).collect(),
                parent: None,
                children: Vec::new(),
                centroid,
                cohesion,
            });
        }

        promote(&mut clusters, &self.config, self.depth, self.dims);
        ClusterIndex::from_clusters(self.dims, clusters)
    }
}

/// Group cohesive clusters into meta-concepts, level by level, up to
/// `max_depth`.
fn promote(clusters: &mut Vec<ConceptCluster>, config: &HierarchyConfig, max_depth: usize, dims: usize) {
    for level in 0..max_depth {
        let eligible: Vec<usize> = clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.depth == level
                    && c.members.len() >= config.promote_min_size
                    && c.cohesion >= config.promote_min_cohesion
            })
            .map(|(i, _)| i)
            .collect();

        let mut taken = vec![false; eligible.len()];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for a in 0..eligible.len() {
            if taken[a] {
                continue;
            }
            taken[a] = true;
            let mut group = vec![eligible[a]];
            for b in (a + 1)..eligible.len() {
                if taken[b] {
                    continue;
                }
                let sim = cosine(
                    &clusters[eligible[a]].centroid,
                    &clusters[eligible[b]].centroid,
                );
                if sim >= config.meta_threshold {
                    taken[b] = true;
                    group.push(eligible[b]);
                }
            }
            if group.len() > 1 {
                groups.push(group);
            }
        }

        if groups.is_empty() {
            break;
        }

        for group in groups {
            let id = ClusterId(clusters.len() as u32);
            let mut members = BTreeSet::new();
            for i in &group {
                members.extend(clusters[*i].members.iter().copied());
                clusters[*i].parent = Some(id);
            }
            let centroid = weighted_centroid(
                group
                    .iter()
                    .map(|i| (clusters[*i].centroid.as_slice(), clusters[*i].members.len() as f64)),
                dims,
            )
            .unwrap_or_else(|| vec![0.0; dims]);
            let cohesion = group
                .iter()
                .map(|i| cosine(&clusters[*i].centroid, &centroid))
                .sum::<f64>()
                / group.len() as f64;
            let children = group.iter().map(|i| clusters[*i].id).collect();
            clusters.push(ConceptCluster {
                id,
                depth: level + 1,
                members,
                parent: None,
                children,
                centroid,
                cohesion,
            });
        }
    }
}
