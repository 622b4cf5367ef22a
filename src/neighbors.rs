//! k-nearest-neighbor search feeding the local correlation analysis.
//!
//! The search is reached through [`NeighborhoodProvider`]. Two implementations ship with the
//! crate, exhaustive search and a KD-tree, and [`NeighborSearch`] picks one of them once from a
//! [`CopacConfig`].
//!
//! Every provider follows the same contract: the neighbors of a point never include the point
//! itself and rows are ordered nearest first. Candidates at equal distance are ordered by index,
//! so the result is independent of thread scheduling. The KD-tree only orders the candidates it
//! returns; on exact ties at the k-th distance it may keep a different index than brute force.

use std::cmp::Ordering;

use kdtree::KdTree;
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{CopacConfig, NeighborAlgorithm};
use crate::error::{CopacError, Result, ThreadSafeStdError};

/// Below this many points `NeighborAlgorithm::Auto` uses exhaustive search.
const BRUTE_FORCE_N_SAMPLES_LIMIT: usize = 250;

/// Distance used for the k-nearest-neighbor search.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Metric {
    /// L2 distance.
    Euclidean,
    /// L1 distance.
    Manhattan,
    /// L-infinity distance.
    Chebyshev,
    /// Lp distance with `p >= 1`.
    Minkowski {
        /// Power of the Minkowski metric.
        p: f64,
    },
    /// `1 - cos(a, b)`. A zero vector is at distance 1 from everything.
    Cosine,
    /// The input matrix already holds pairwise distances.
    Precomputed,
}

impl Metric {
    pub(crate) fn validate(&self) -> Result<()> {
        if let Metric::Minkowski { p } = *self {
            if !p.is_finite() || p < 1.0 {
                return Err(CopacError::invalid_parameter(
                    "p",
                    format!("Minkowski power must be finite and at least 1, got {}", p),
                ));
            }
        }
        Ok(())
    }

    /// Whether a KD-tree can prune correctly under this metric.
    ///
    /// Pruning compares against the distance to a bounding box, which lower-bounds the true
    /// distance only for metrics that are monotone in each coordinate difference.
    pub fn supports_tree(&self) -> bool {
        matches!(
            self,
            Metric::Euclidean | Metric::Manhattan | Metric::Chebyshev | Metric::Minkowski { .. }
        )
    }

    /// Distance between two points, or `None` for [`Metric::Precomputed`], which has no
    /// coordinate form.
    pub fn distance(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> Option<f64> {
        let diffs = a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs());
        let value = match *self {
            Metric::Euclidean => diffs.map(|d| d * d).sum::<f64>().sqrt(),
            Metric::Manhattan => diffs.sum(),
            Metric::Chebyshev => diffs.fold(0.0, f64::max),
            Metric::Minkowski { p } => diffs.map(|d| d.powf(p)).sum::<f64>().powf(p.recip()),
            Metric::Cosine => {
                let norm_a = a.dot(&a).sqrt();
                let norm_b = b.dot(&b).sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    1.0
                } else {
                    (1.0 - a.dot(&b) / (norm_a * norm_b)).clamp(0.0, 2.0)
                }
            }
            Metric::Precomputed => return None,
        };
        Some(value)
    }
}

/// Capability to answer k-nearest-neighbor queries over a whole matrix.
pub trait NeighborhoodProvider: Sync {
    /// Returns an `(n_samples, k)` matrix whose row `i` holds the indices of the `k` nearest
    /// neighbors of point `i`, excluding `i` itself, nearest first.
    fn query(&self, data: ArrayView2<f64>, k: usize) -> std::result::Result<Array2<usize>, ThreadSafeStdError>;
}

/// Orders `(distance, index)` candidates by distance, then index.
fn candidate_order(a: &(f64, usize), b: &(f64, usize)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

/// Keeps the `k` nearest candidates other than `query`, nearest first.
fn select_neighbors(
    query: usize,
    mut candidates: Vec<(f64, usize)>,
    k: usize,
) -> std::result::Result<Vec<usize>, ThreadSafeStdError> {
    candidates.retain(|&(_, idx)| idx != query);
    if candidates.len() < k {
        return Err(format!(
            "point {} has only {} candidate neighbors, {} requested",
            query,
            candidates.len(),
            k
        )
        .into());
    }
    if k == 0 {
        return Ok(Vec::new());
    }
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k - 1, candidate_order);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(candidate_order);
    Ok(candidates.into_iter().map(|(_, idx)| idx).collect())
}

fn rows_to_matrix(
    rows: Vec<Vec<usize>>,
    k: usize,
) -> std::result::Result<Array2<usize>, ThreadSafeStdError> {
    let n_samples = rows.len();
    let flat: Vec<usize> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((n_samples, k), flat)?)
}

/// Exhaustive neighbor search, `O(n^2 d)`. Supports every [`Metric`].
#[derive(Clone, Copy, Debug)]
pub struct BruteForceNeighbors {
    metric: Metric,
}

impl BruteForceNeighbors {
    /// Exhaustive search under `metric`.
    pub fn new(metric: Metric) -> Self {
        Self { metric }
    }
}

impl NeighborhoodProvider for BruteForceNeighbors {
    fn query(&self, data: ArrayView2<f64>, k: usize) -> std::result::Result<Array2<usize>, ThreadSafeStdError> {
        let n_samples = data.nrows();
        if self.metric == Metric::Precomputed && data.ncols() != n_samples {
            return Err(format!(
                "precomputed distances must be square, got {} x {}",
                n_samples,
                data.ncols()
            )
            .into());
        }

        let rows: Vec<std::result::Result<Vec<usize>, ThreadSafeStdError>> = (0..n_samples)
            .into_par_iter()
            .map(|query| {
                let candidates: Vec<(f64, usize)> = match self.metric {
                    Metric::Precomputed => data.row(query).iter().copied().zip(0..n_samples).collect(),
                    metric => {
                        let point = data.row(query);
                        (0..n_samples)
                            .map(|other| {
                                let dist = metric.distance(point, data.row(other)).unwrap_or(f64::INFINITY);
                                (dist, other)
                            })
                            .collect()
                    }
                };
                select_neighbors(query, candidates, k)
            })
            .collect();

        let rows = rows.into_iter().collect::<std::result::Result<Vec<_>, _>>()?;
        rows_to_matrix(rows, k)
    }
}

/// KD-tree neighbor search over the Minkowski family of metrics.
#[derive(Clone, Copy, Debug)]
pub struct KdTreeNeighbors {
    metric: Metric,
    leaf_size: usize,
}

impl KdTreeNeighbors {
    /// Fails with [`CopacError::NeighborhoodFailure`] when the metric cannot be used for tree
    /// pruning.
    pub fn new(metric: Metric, leaf_size: usize) -> Result<Self> {
        if !metric.supports_tree() {
            return Err(CopacError::NeighborhoodFailure(
                format!("KD-tree search does not support the {:?} metric", metric).into(),
            ));
        }
        Ok(Self {
            metric,
            leaf_size: leaf_size.max(1),
        })
    }
}

impl NeighborhoodProvider for KdTreeNeighbors {
    fn query(&self, data: ArrayView2<f64>, k: usize) -> std::result::Result<Array2<usize>, ThreadSafeStdError> {
        let n_samples = data.nrows();
        let points: Vec<Vec<f64>> = data.outer_iter().map(|row| row.to_vec()).collect();

        let mut tree: KdTree<f64, usize, Vec<f64>> = KdTree::with_capacity(data.ncols(), self.leaf_size);
        for (idx, point) in points.iter().enumerate() {
            tree.add(point.clone(), idx)
                .map_err(|e| format!("failed to index point {}: {:?}", idx, e))?;
        }

        let metric = self.metric;
        let distance = move |a: &[f64], b: &[f64]| {
            metric
                .distance(ArrayView1::from(a), ArrayView1::from(b))
                .unwrap_or(f64::INFINITY)
        };
        // One extra candidate so the query point itself can be dropped.
        let num_candidates = (k + 1).min(n_samples);

        let rows: Vec<std::result::Result<Vec<usize>, ThreadSafeStdError>> = points
            .par_iter()
            .enumerate()
            .map(|(query, point)| {
                let found = tree
                    .nearest(point, num_candidates, &distance)
                    .map_err(|e| format!("KD-tree query for point {} failed: {:?}", query, e))?;
                let candidates = found.into_iter().map(|(dist, &idx)| (dist, idx)).collect();
                select_neighbors(query, candidates, k)
            })
            .collect();

        let rows = rows.into_iter().collect::<std::result::Result<Vec<_>, _>>()?;
        rows_to_matrix(rows, k)
    }
}

/// Neighbor search backend selected once from the configuration.
#[derive(Clone, Copy, Debug)]
pub enum NeighborSearch {
    BruteForce(BruteForceNeighbors),
    KdTree(KdTreeNeighbors),
}

impl NeighborSearch {
    /// Resolves [`NeighborAlgorithm::Auto`] against the metric and the input size.
    pub fn from_config(config: &CopacConfig, n_samples: usize) -> Result<Self> {
        let search = match config.algorithm {
            NeighborAlgorithm::BruteForce => {
                NeighborSearch::BruteForce(BruteForceNeighbors::new(config.metric))
            }
            NeighborAlgorithm::KdTree => {
                NeighborSearch::KdTree(KdTreeNeighbors::new(config.metric, config.leaf_size)?)
            }
            NeighborAlgorithm::Auto => {
                if config.metric.supports_tree() && n_samples > BRUTE_FORCE_N_SAMPLES_LIMIT {
                    NeighborSearch::KdTree(KdTreeNeighbors::new(config.metric, config.leaf_size)?)
                } else {
                    NeighborSearch::BruteForce(BruteForceNeighbors::new(config.metric))
                }
            }
        };
        debug!("Selected {:?} for {} points.", search, n_samples);
        Ok(search)
    }
}

impl NeighborhoodProvider for NeighborSearch {
    fn query(&self, data: ArrayView2<f64>, k: usize) -> std::result::Result<Array2<usize>, ThreadSafeStdError> {
        match self {
            NeighborSearch::BruteForce(search) => search.query(data, k),
            NeighborSearch::KdTree(search) => search.query(data, k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use ndarray::array;

    fn line_points(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { 0.0 })
    }

    #[test]
    fn test_metric_distances() {
        let a = array![0.0, 0.0];
        let b = array![3.0, 4.0];
        assert_approx_eq!(f64, Metric::Euclidean.distance(a.view(), b.view()).unwrap(), 5.0, epsilon = 1e-12);
        assert_approx_eq!(f64, Metric::Manhattan.distance(a.view(), b.view()).unwrap(), 7.0, epsilon = 1e-12);
        assert_approx_eq!(f64, Metric::Chebyshev.distance(a.view(), b.view()).unwrap(), 4.0, epsilon = 1e-12);
        assert_approx_eq!(
            f64,
            Metric::Minkowski { p: 2.0 }.distance(a.view(), b.view()).unwrap(),
            5.0,
            epsilon = 1e-12
        );
        assert_approx_eq!(f64, Metric::Cosine.distance(a.view(), b.view()).unwrap(), 1.0, epsilon = 1e-12);
        let c = array![6.0, 8.0];
        assert_approx_eq!(f64, Metric::Cosine.distance(b.view(), c.view()).unwrap(), 0.0, epsilon = 1e-12);
        assert!(Metric::Precomputed.distance(a.view(), b.view()).is_none());
    }

    #[test]
    fn test_brute_force_excludes_self_and_orders_by_distance() {
        let data = line_points(6);
        let neighbors = BruteForceNeighbors::new(Metric::Euclidean).query(data.view(), 2).unwrap();
        assert_eq!(neighbors.dim(), (6, 2));
        assert_eq!(neighbors.row(0).to_vec(), vec![1, 2]);
        // Ties at distance 1 resolve to the lower index first.
        assert_eq!(neighbors.row(3).to_vec(), vec![2, 4]);
        for (i, row) in neighbors.outer_iter().enumerate() {
            assert!(!row.iter().any(|&j| j == i), "point {} listed as its own neighbor", i);
        }
    }

    #[test]
    fn test_duplicate_points_still_exclude_self() {
        let data = Array2::<f64>::zeros((4, 3));
        let neighbors = BruteForceNeighbors::new(Metric::Euclidean).query(data.view(), 3).unwrap();
        assert_eq!(neighbors.row(0).to_vec(), vec![1, 2, 3]);
        assert_eq!(neighbors.row(2).to_vec(), vec![0, 1, 3]);
    }

    #[test]
    fn test_precomputed_reads_matrix_rows() {
        let distances = array![
            [0.0, 5.0, 1.0, 2.0],
            [5.0, 0.0, 3.0, 4.0],
            [1.0, 3.0, 0.0, 9.0],
            [2.0, 4.0, 9.0, 0.0],
        ];
        let neighbors = BruteForceNeighbors::new(Metric::Precomputed).query(distances.view(), 2).unwrap();
        assert_eq!(neighbors.row(0).to_vec(), vec![2, 3]);
        assert_eq!(neighbors.row(1).to_vec(), vec![2, 3]);
        assert_eq!(neighbors.row(2).to_vec(), vec![0, 1]);
    }

    #[test]
    fn test_kdtree_matches_brute_force_on_distinct_distances() {
        // Irregular spacing so no two candidates tie.
        let data = Array2::from_shape_fn((40, 3), |(i, j)| {
            let x = i as f64;
            match j {
                0 => x * 1.01,
                1 => (x * x * 0.013).sin(),
                _ => (x * 0.7).cos() * 0.5,
            }
        });
        let brute = BruteForceNeighbors::new(Metric::Euclidean).query(data.view(), 5).unwrap();
        let tree = KdTreeNeighbors::new(Metric::Euclidean, 4)
            .unwrap()
            .query(data.view(), 5)
            .unwrap();
        assert_eq!(brute, tree);
    }

    #[test]
    fn test_kdtree_rejects_unsupported_metrics() {
        assert!(matches!(
            KdTreeNeighbors::new(Metric::Cosine, 30),
            Err(CopacError::NeighborhoodFailure(_))
        ));
        assert!(matches!(
            KdTreeNeighbors::new(Metric::Precomputed, 30),
            Err(CopacError::NeighborhoodFailure(_))
        ));
    }

    #[test]
    fn test_auto_selection() {
        let config = CopacConfig::default();
        assert!(matches!(
            NeighborSearch::from_config(&config, 100).unwrap(),
            NeighborSearch::BruteForce(_)
        ));
        assert!(matches!(
            NeighborSearch::from_config(&config, 1000).unwrap(),
            NeighborSearch::KdTree(_)
        ));
        let cosine = CopacConfig { metric: Metric::Cosine, ..Default::default() };
        assert!(matches!(
            NeighborSearch::from_config(&cosine, 1000).unwrap(),
            NeighborSearch::BruteForce(_)
        ));
        let forced = CopacConfig { metric: Metric::Cosine, algorithm: NeighborAlgorithm::KdTree, ..Default::default() };
        assert!(NeighborSearch::from_config(&forced, 10).is_err());
    }

    #[test]
    fn test_too_few_points_is_an_error() {
        let data = line_points(3);
        assert!(BruteForceNeighbors::new(Metric::Euclidean).query(data.view(), 3).is_err());
    }
}
