//! Clustering of foreground points into objects.
//!
//! Two labelling methods are provided:
//! - DBSCAN, with `kiddo` KD-tree neighborhood queries and union-find cluster
//!   merging
//! - agglomerative (hierarchical) clustering cut at a distance threshold,
//!   with single, complete, average or Ward linkage
//!
//! Labelling may run on the XY projection of the cloud; cluster geometry
//! (centroid, bounding boxes) always uses the full 3-D points.
//!
//! # Example
//!
//! ```no_run
//! use lidar_pipeline::config::{ClusteringConfig, DbscanParams};
//! use lidar_pipeline::processors::clustering::Clusterer;
//!
//! let clusterer = Clusterer::new(ClusteringConfig::Dbscan(DbscanParams::default())).unwrap();
//! let points = vec![[0.0f32, 0.0, 0.0], [0.1, 0.0, 0.0]].into();
//! let clusters = clusterer.cluster(&points);
//! ```

use std::collections::HashMap;

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use log::debug;

use super::geometry::oriented_bounding_box;
use crate::config::{ClusteringConfig, ConfigError, Linkage};
use crate::core::points::{Point, PointArray};

/// Label given to points that belong to no cluster.
pub const NOISE: i32 = -1;

/// Disjoint sets over point indices. Shared by DBSCAN and the single-linkage
/// component pass.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    /// `size` singleton sets.
    #[inline]
    pub fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    /// Find the root of the set containing `x`.
    #[inline]
    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            let gp = self.parent[self.parent[x]];
            self.parent[x] = gp;
            x = gp;
        }
        x
    }

    /// Join the sets of `x` and `y`; `false` if they already shared one.
    #[inline]
    pub fn union(&mut self, x: usize, y: usize) -> bool {
        let root_x = self.find(x);
        let root_y = self.find(y);
        if root_x == root_y {
            return false;
        }
        // Roots only ever move to a higher index.
        let (small, large) = if root_x < root_y {
            (root_x, root_y)
        } else {
            (root_y, root_x)
        };
        self.parent[small] = large;
        true
    }

    /// Sequential labels, numbered by first occurrence of each set.
    pub fn labels(&mut self) -> Vec<i32> {
        let mut root_to_label: HashMap<usize, i32> = HashMap::new();
        (0..self.parent.len())
            .map(|i| {
                let root = self.find(i);
                let next = root_to_label.len() as i32;
                *root_to_label.entry(root).or_insert(next)
            })
            .collect()
    }
}

/// DBSCAN clustering.
///
/// A point's neighborhood holds every point within `eps` of it, itself
/// included. Points with at least `min_samples` neighbors are core points;
/// core points that are neighbors share a cluster. A non-core point joins the
/// cluster of its first core neighbor, or is labelled [`NOISE`].
///
/// Neighborhoods come from one `within` query per point against a kiddo
/// tree. Cluster ids are numbered in order of each cluster's lowest-index
/// core point.
pub fn dbscan(coords: &[Point], eps: f32, min_samples: usize) -> Vec<i32> {
    let n = coords.len();
    if n == 0 {
        return Vec::new();
    }

    let tree: ImmutableKdTree<f32, 3> = ImmutableKdTree::new_from_slice(coords);
    let eps_sq = eps * eps;

    let neighbors: Vec<Vec<usize>> = coords
        .iter()
        .map(|coord| {
            let mut found: Vec<usize> = tree
                .within::<SquaredEuclidean>(coord, eps_sq)
                .iter()
                .map(|nn| nn.item as usize)
                .collect();
            // Index order keeps border assignment independent of tree layout.
            found.sort_unstable();
            found
        })
        .collect();

    let is_core: Vec<bool> = neighbors
        .iter()
        .map(|neigh| neigh.len() >= min_samples)
        .collect();

    let mut uf = UnionFind::new(n);
    for i in 0..n {
        if is_core[i] {
            for &j in &neighbors[i] {
                if is_core[j] {
                    uf.union(i, j);
                }
            }
        }
    }

    // Core points first so border points never open a cluster id.
    let mut cluster_of: HashMap<usize, i32> = HashMap::new();
    let mut labels = vec![NOISE; n];
    for i in (0..n).filter(|&i| is_core[i]) {
        let next = cluster_of.len() as i32;
        labels[i] = *cluster_of.entry(uf.find(i)).or_insert(next);
    }
    for i in (0..n).filter(|&i| !is_core[i]) {
        if let Some(&j) = neighbors[i].iter().find(|&&j| is_core[j]) {
            labels[i] = labels[j];
        }
    }

    labels
}

/// Single-linkage clusters at `threshold`: connected components of the graph
/// joining points closer than `threshold`.
fn single_linkage(coords: &[Point], threshold: f32) -> Vec<i32> {
    let n = coords.len();
    let tree: ImmutableKdTree<f32, 3> = ImmutableKdTree::new_from_slice(coords);
    let t_sq = threshold * threshold;

    let mut uf = UnionFind::new(n);
    for (i, coord) in coords.iter().enumerate() {
        for nn in tree.within::<SquaredEuclidean>(coord, t_sq) {
            if nn.distance < t_sq {
                uf.union(i, nn.item as usize);
            }
        }
    }
    uf.labels()
}

/// Condensed upper-triangular distance matrix.
struct CondensedMatrix {
    n: usize,
    data: Vec<f64>,
}

impl CondensedMatrix {
    fn from_points(coords: &[Point]) -> Self {
        let n = coords.len();
        let mut data = Vec::with_capacity(n * n.saturating_sub(1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                let d: f64 = (0..3)
                    .map(|k| {
                        let diff = coords[i][k] as f64 - coords[j][k] as f64;
                        diff * diff
                    })
                    .sum::<f64>()
                    .sqrt();
                data.push(d);
            }
        }
        Self { n, data }
    }

    #[inline]
    fn index(&self, i: usize, j: usize) -> usize {
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        self.n * i - i * (i + 1) / 2 + (j - i - 1)
    }

    #[inline]
    fn get(&self, i: usize, j: usize) -> f64 {
        self.data[self.index(i, j)]
    }

    #[inline]
    fn set(&mut self, i: usize, j: usize, value: f64) {
        let idx = self.index(i, j);
        self.data[idx] = value;
    }
}

/// Agglomerative clustering by the nearest-neighbor chain algorithm with
/// Lance-Williams distance updates. Returns `(a, b, height)` for each merge;
/// `a` and `b` are representative point indices of the merged clusters.
///
/// Ward linkage runs on squared distances; its heights are reported as
/// distances again.
fn nn_chain(coords: &[Point], linkage: Linkage) -> Vec<(usize, usize, f64)> {
    let n = coords.len();
    let mut dist = CondensedMatrix::from_points(coords);
    if linkage == Linkage::Ward {
        dist.data.iter_mut().for_each(|d| *d *= *d);
    }
    let mut size = vec![1usize; n];
    let mut active = vec![true; n];
    let mut chain: Vec<usize> = Vec::with_capacity(n);
    let mut merges = Vec::with_capacity(n.saturating_sub(1));

    while merges.len() + 1 < n {
        if chain.is_empty() {
            if let Some(first) = active.iter().position(|&a| a) {
                chain.push(first);
            }
        }
        let a = chain[chain.len() - 1];
        let prev = (chain.len() >= 2).then(|| chain[chain.len() - 2]);

        // Nearest active cluster to `a`, preferring the previous chain
        // element on ties so the chain always terminates.
        let mut best = prev;
        let mut best_d = prev.map_or(f64::INFINITY, |p| dist.get(a, p));
        for k in 0..n {
            if k == a || !active[k] {
                continue;
            }
            let d = dist.get(a, k);
            if d < best_d {
                best_d = d;
                best = Some(k);
            }
        }
        let Some(b) = best else { break };

        if Some(b) != prev {
            chain.push(b);
            continue;
        }

        chain.truncate(chain.len() - 2);
        let height = if linkage == Linkage::Ward {
            best_d.sqrt()
        } else {
            best_d
        };
        merges.push((a, b, height));

        // Merged cluster lives on in slot `b`.
        let (size_a, size_b) = (size[a] as f64, size[b] as f64);
        for k in 0..n {
            if k == a || k == b || !active[k] {
                continue;
            }
            let d_ak = dist.get(a, k);
            let d_bk = dist.get(b, k);
            let updated = match linkage {
                Linkage::Single => d_ak.min(d_bk),
                Linkage::Complete => d_ak.max(d_bk),
                Linkage::Average => (size_a * d_ak + size_b * d_bk) / (size_a + size_b),
                Linkage::Ward => {
                    let size_k = size[k] as f64;
                    ((size_a + size_k) * d_ak + (size_b + size_k) * d_bk - size_k * best_d)
                        / (size_a + size_b + size_k)
                }
            };
            dist.set(b, k, updated);
        }
        active[a] = false;
        size[b] += size[a];
    }

    merges
}

/// Hierarchical clustering cut at `threshold`: clusters are joined by every
/// merge strictly below the threshold.
pub fn hierarchical(coords: &[Point], threshold: f32, linkage: Linkage) -> Vec<i32> {
    match coords.len() {
        0 => return Vec::new(),
        1 => return vec![0],
        _ => {}
    }
    if linkage == Linkage::Single {
        return single_linkage(coords, threshold);
    }

    let mut uf = UnionFind::new(coords.len());
    for (a, b, height) in nn_chain(coords, linkage) {
        if height < threshold as f64 {
            uf.union(a, b);
        }
    }
    uf.labels()
}

/// One detected object in a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub points: Vec<Point>,
    pub size: usize,
    /// Mean of the member points
    pub centroid: Point,
    /// Axis-aligned bounds as `(min, max)`
    pub aabb: (Point, Point),
    /// Oriented box: four bottom corners, then the four top corners
    pub oobb: [Point; 8],
    /// Identity assigned by the tracker
    pub track_id: Option<u64>,
}

impl Cluster {
    /// Build a cluster and its geometry from member points.
    ///
    /// Returns `None` for an empty point set.
    pub fn from_points(points: Vec<Point>) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f64;

        let mut sum = [0.0f64; 3];
        let mut min = [f32::INFINITY; 3];
        let mut max = [f32::NEG_INFINITY; 3];
        for p in &points {
            for k in 0..3 {
                sum[k] += p[k] as f64;
                min[k] = min[k].min(p[k]);
                max[k] = max[k].max(p[k]);
            }
        }
        let centroid = [
            (sum[0] / n) as f32,
            (sum[1] / n) as f32,
            (sum[2] / n) as f32,
        ];
        let oobb = oriented_bounding_box(&points)?;

        Some(Self {
            size: points.len(),
            points,
            centroid,
            aabb: (min, max),
            oobb,
            track_id: None,
        })
    }
}

/// Groups labelled points into clusters, dropping noise. Clusters are ordered
/// by label.
pub fn group_by_label(points: &[Point], labels: &[i32]) -> Vec<Cluster> {
    let count = labels.iter().copied().max().map_or(0, |m| (m + 1).max(0) as usize);
    let mut members: Vec<Vec<Point>> = vec![Vec::new(); count];
    for (p, &label) in points.iter().zip(labels) {
        if label >= 0 {
            members[label as usize].push(*p);
        }
    }
    members.into_iter().filter_map(Cluster::from_points).collect()
}

/// Configured clustering stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Clusterer {
    config: ClusteringConfig,
}

impl Clusterer {
    /// Build a clusterer, validating its parameters.
    pub fn new(config: ClusteringConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// Cluster label per point ([`NOISE`] for unclustered points).
    pub fn labels(&self, points: &PointArray) -> Vec<i32> {
        let is_xy = match &self.config {
            ClusteringConfig::Naive(p) => p.is_xy,
            ClusteringConfig::Dbscan(p) => p.is_xy,
        };
        let projected;
        let coords: &[Point] = if is_xy {
            projected = points.xy_projection();
            &projected
        } else {
            points.as_slice()
        };

        match &self.config {
            ClusteringConfig::Naive(p) => hierarchical(coords, p.search_radius, p.linkage),
            ClusteringConfig::Dbscan(p) => dbscan(coords, p.search_radius, p.min_samples),
        }
    }

    /// Cluster a point cloud into objects.
    pub fn cluster(&self, points: &PointArray) -> Vec<Cluster> {
        if points.is_empty() {
            return Vec::new();
        }
        let labels = self.labels(points);
        let clusters = group_by_label(points.as_slice(), &labels);
        debug!(
            "{} points -> {} clusters ({} noise)",
            points.len(),
            clusters.len(),
            labels.iter().filter(|&&l| l == NOISE).count()
        );
        clusters
    }
}
