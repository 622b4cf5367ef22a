use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::error::{CopacError, Result};
use crate::neighbors::Metric;

/// Strategy for the k-nearest-neighbor search that feeds the local correlation analysis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborAlgorithm {
    /// Brute force for small inputs or metrics a KD-tree cannot prune with, KD-tree otherwise.
    #[default]
    Auto,
    /// Exhaustive pairwise search. Works with every metric.
    BruteForce,
    /// KD-tree search. Only valid for the Minkowski family of metrics.
    KdTree,
}

/// Configuration of a COPAC run.
///
/// Field names follow the COPAC paper: `k` is the neighborhood size used for the local
/// correlation analysis, `mu` and `eps` are the density parameters of the per-partition
/// clustering, `alpha` is the fraction of local variance the correlated directions must explain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CopacConfig {
    /// Size of the local neighborhood (the query point itself is not counted).
    /// The paper suggests `k >= 3 * n_features`.
    pub k: usize,
    /// Minimum number of points in the eps-neighborhood of a core point, itself included.
    /// Must satisfy `1 <= mu <= k`.
    pub mu: usize,
    /// Radius of the density neighborhood under the correlation distance.
    pub eps: f64,
    /// Threshold of explained variance in `]0, 1[`. Robust in the range 0.8 to 0.9.
    pub alpha: f64,
    /// Metric used to find the k nearest neighbors.
    pub metric: Metric,
    /// Nearest-neighbor search strategy.
    pub algorithm: NeighborAlgorithm,
    /// Bucket size of the KD-tree leaves.
    pub leaf_size: usize,
    /// Number of worker threads. `None` runs on the global rayon pool.
    pub num_threads: Option<usize>,
}

impl Default for CopacConfig {
    fn default() -> Self {
        CopacConfig {
            k: 10,
            mu: 5,
            eps: 0.5,
            alpha: 0.85,
            metric: Metric::Euclidean,
            algorithm: NeighborAlgorithm::Auto,
            leaf_size: 30,
            num_threads: None,
        }
    }
}

impl CopacConfig {
    /// Checks every parameter range. Called before any computation starts.
    pub fn validate(&self) -> Result<()> {
        if self.k < 1 {
            return Err(CopacError::invalid_parameter("k", "must be at least 1"));
        }
        if self.mu < 1 {
            return Err(CopacError::invalid_parameter("mu", "must be at least 1"));
        }
        if self.mu > self.k {
            return Err(CopacError::invalid_parameter(
                "mu",
                format!("must not exceed k (mu = {}, k = {})", self.mu, self.k),
            ));
        }
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(CopacError::invalid_parameter(
                "eps",
                format!("must be positive and finite, got {}", self.eps),
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(CopacError::invalid_parameter(
                "alpha",
                format!("must lie strictly between 0 and 1, got {}", self.alpha),
            ));
        }
        if self.leaf_size < 1 {
            return Err(CopacError::invalid_parameter("leaf_size", "must be at least 1"));
        }
        if self.num_threads == Some(0) {
            return Err(CopacError::invalid_parameter(
                "num_threads",
                "must be at least 1 when set",
            ));
        }
        self.metric.validate()
    }

    /// Checks the input matrix against this configuration.
    pub fn validate_input(&self, data: ArrayView2<f64>) -> Result<()> {
        let (n_samples, n_features) = data.dim();
        if n_samples == 0 || n_features == 0 {
            return Err(CopacError::InputShape(format!(
                "input must be non-empty, got {} x {}",
                n_samples, n_features
            )));
        }
        if self.metric == Metric::Precomputed && n_samples != n_features {
            return Err(CopacError::InputShape(format!(
                "a precomputed distance matrix must be square, got {} x {}",
                n_samples, n_features
            )));
        }
        if n_samples <= self.k {
            return Err(CopacError::InputShape(format!(
                "need more than k = {} points to find k neighbors of each point, got {}",
                self.k, n_samples
            )));
        }
        if let Some(((row, col), _)) = data.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(CopacError::NonFiniteInput { row, col });
        }
        Ok(())
    }
}
