//! DBSCAN over a precomputed distance matrix.
//!
//! # The Algorithm (Ester et al., 1996)
//!
//! - **Core point**: has at least `min_samples` points, itself included, within distance
//!   `eps` (inclusive).
//! - **Border point**: within `eps` of a core point but not core itself.
//! - **Noise point**: neither; labeled [`NOISE`].
//!
//! Points are visited in index order. Each unvisited core point starts a new cluster, which is
//! expanded through the eps-neighborhoods of its core members. A border point reachable from
//! several clusters keeps the first one that reaches it. Cluster ids are therefore `0..m` in
//! order of each cluster's first core point, which makes the output deterministic.
//!
//! ## Complexity
//!
//! - **Time**: O(n²) with the full matrix.
//! - **Space**: O(n) besides the matrix.

use ndarray::ArrayView2;

use crate::error::ThreadSafeStdError;

/// Label of points that belong to no cluster.
pub const NOISE: i64 = -1;

// Never assigned yet. Visited points that are not density-reachable carry NOISE and may be
// promoted to border points later.
const UNCLASSIFIED: i64 = -2;

/// Capability to density-cluster points given their pairwise distances.
pub trait DensityClusteringProvider: Sync {
    /// Returns one label per row of `distances`: [`NOISE`] or a cluster id in `0..m`, where `m`
    /// is the number of clusters found.
    fn cluster(
        &self,
        distances: ArrayView2<f64>,
        eps: f64,
        min_samples: usize,
    ) -> Result<Vec<i64>, ThreadSafeStdError>;
}

/// DBSCAN reading neighborhoods straight from a square distance matrix.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrecomputedDbscan;

impl PrecomputedDbscan {
    /// Same as `PrecomputedDbscan::default()`.
    pub fn new() -> Self {
        Self
    }

    /// All points within `eps` of `point`, excluding `point` itself.
    fn region_query(distances: ArrayView2<f64>, point: usize, eps: f64) -> Vec<usize> {
        distances
            .row(point)
            .iter()
            .enumerate()
            .filter(|&(other, &dist)| other != point && dist <= eps)
            .map(|(other, _)| other)
            .collect()
    }

    /// Expand cluster from a core point.
    #[allow(clippy::too_many_arguments)]
    fn expand_cluster(
        distances: ArrayView2<f64>,
        eps: f64,
        min_samples: usize,
        point: usize,
        neighbors: Vec<usize>,
        labels: &mut [i64],
        visited: &mut [bool],
        cluster_id: i64,
    ) {
        labels[point] = cluster_id;

        // Iterative expansion, no recursion.
        let mut to_process = neighbors;

        while let Some(neighbor) = to_process.pop() {
            // Label before the `visited` check so earlier noise can become a border point.
            if labels[neighbor] == UNCLASSIFIED || labels[neighbor] == NOISE {
                labels[neighbor] = cluster_id;
            }

            if visited[neighbor] {
                continue;
            }
            visited[neighbor] = true;

            let neighbor_neighbors = Self::region_query(distances, neighbor, eps);

            // min_samples counts the point itself
            if neighbor_neighbors.len() + 1 >= min_samples {
                to_process.extend(neighbor_neighbors.into_iter().filter(|&nn| !visited[nn]));
            }
        }
    }
}

impl DensityClusteringProvider for PrecomputedDbscan {
    fn cluster(
        &self,
        distances: ArrayView2<f64>,
        eps: f64,
        min_samples: usize,
    ) -> Result<Vec<i64>, ThreadSafeStdError> {
        let (n, n_cols) = distances.dim();
        if n != n_cols {
            return Err(format!("distance matrix must be square, got {} x {}", n, n_cols).into());
        }
        if !(eps > 0.0) {
            return Err(format!("eps must be positive, got {}", eps).into());
        }
        if min_samples == 0 {
            return Err("min_samples must be at least 1".into());
        }

        let mut labels = vec![UNCLASSIFIED; n];
        let mut visited = vec![false; n];
        let mut cluster_id: i64 = 0;

        for point in 0..n {
            if visited[point] {
                continue;
            }
            visited[point] = true;

            let neighbors = Self::region_query(distances, point, eps);

            if neighbors.len() + 1 < min_samples {
                // Not enough neighbors: noise for now, may become a border point later.
                labels[point] = NOISE;
                continue;
            }

            Self::expand_cluster(
                distances,
                eps,
                min_samples,
                point,
                neighbors,
                &mut labels,
                &mut visited,
                cluster_id,
            );
            cluster_id += 1;
        }

        Ok(labels)
    }
}
