//! Local correlation analysis: per point, a PCA of its k-nearest-neighbor set.
//!
//! For a point P with neighborhood N(P), the eigenvectors of the population covariance of N(P)
//! split the space into a *correlated* part, the fewest leading directions explaining at least
//! `alpha` of the local variance, and a *noise* part, everything else. The number of leading
//! directions is the local correlation dimension `λ_P`. The projector onto the noise part,
//! `M̂_P`, defines P's view of the correlation distance (see [`crate::correlation_distance`]).

use log::{debug, trace};
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{CopacError, Result, ThreadSafeStdError};
use crate::linalg_backends::{BackendEigh, EighOutput};

/// Bound, relative to the squared norm of the neighborhood mean, under which the total variance
/// counts as zero. Identical points leave at most a few ulps of centering error, squared.
const DEGENERATE_VARIANCE_RTOL: f64 = 1e-24;

/// Result of the local correlation analysis of one point.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalCorrelation {
    /// `λ_P`, in `[1, n_features]`.
    pub correlation_dimension: usize,
    /// `M̂_P`: symmetric PSD projector onto the noise subspace, `(n_features, n_features)`.
    pub projection: Array2<f64>,
}

impl LocalCorrelation {
    /// Policy for neighborhoods without variance: the point is treated as maximally correlated
    /// (`λ = 1`) and measures distances with the full Euclidean form (`M̂ = I`).
    pub fn degenerate(n_features: usize) -> Self {
        LocalCorrelation {
            correlation_dimension: 1,
            projection: Array2::eye(n_features),
        }
    }
}

/// Number of leading eigenvalues whose cumulative share of the total reaches `alpha`.
///
/// `sorted_eigenvalues` must be nonnegative and sorted in descending order. The search is
/// left-biased: a share exactly equal to `alpha` counts as reached. Returns 1 when the total is
/// zero and never more than `sorted_eigenvalues.len()`.
pub fn correlation_dimension(sorted_eigenvalues: &[f64], alpha: f64) -> usize {
    let cumulative: Vec<f64> = sorted_eigenvalues
        .iter()
        .scan(0.0, |running, &value| {
            *running += value;
            Some(*running)
        })
        .collect();
    let total = match cumulative.last() {
        Some(&total) if total.is_finite() && total > 0.0 => total,
        _ => return 1,
    };
    let position = cumulative
        .iter()
        .position(|&partial| partial / total >= alpha)
        .unwrap_or(cumulative.len() - 1);
    (position + 1).clamp(1, sorted_eigenvalues.len())
}

/// Analyzes one neighborhood, given as an `(n_neighbors, n_features)` matrix of coordinates.
pub fn analyze_neighborhood<B: BackendEigh<f64>>(
    backend: &B,
    neighborhood: ArrayView2<f64>,
    alpha: f64,
) -> std::result::Result<LocalCorrelation, ThreadSafeStdError> {
    let (n_neighbors, n_features) = neighborhood.dim();
    if n_neighbors == 0 || n_features == 0 {
        return Err(format!("empty neighborhood ({} x {})", n_neighbors, n_features).into());
    }

    let mean = neighborhood
        .mean_axis(Axis(0))
        .ok_or("Failed to compute mean of the neighborhood.")?;
    let centered = &neighborhood - &mean;
    let mut covariance = centered.t().dot(&centered);
    covariance /= n_neighbors as f64;

    let total_variance = covariance.diag().sum();
    if !total_variance.is_finite()
        || total_variance <= DEGENERATE_VARIANCE_RTOL * mean.dot(&mean)
    {
        debug!("Neighborhood of {} points has no variance; using the Euclidean form.", n_neighbors);
        return Ok(LocalCorrelation::degenerate(n_features));
    }

    let EighOutput { eigenvalues, eigenvectors } = backend.eigh_upper(&covariance)?;

    // Descending; the stable sort keeps equal eigenvalues in backend order.
    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));
    let sorted_eigenvalues: Vec<f64> = order.iter().map(|&i| eigenvalues[i].max(0.0)).collect();

    let dimension = correlation_dimension(&sorted_eigenvalues, alpha);

    let projection = if dimension >= n_features {
        Array2::zeros((n_features, n_features))
    } else {
        let noise_basis = eigenvectors.select(Axis(1), &order[dimension..]);
        noise_basis.dot(&noise_basis.t())
    };

    Ok(LocalCorrelation {
        correlation_dimension: dimension,
        projection,
    })
}

/// Runs [`analyze_neighborhood`] for every point in parallel.
///
/// Row `i` of `neighbors` lists the indices (into `data`) of point `i`'s neighbors. The output
/// is index-aligned with `data`.
pub fn analyze_all<B: BackendEigh<f64> + Sync>(
    backend: &B,
    data: ArrayView2<f64>,
    neighbors: ArrayView2<usize>,
    alpha: f64,
) -> Result<Vec<LocalCorrelation>> {
    (0..data.nrows())
        .into_par_iter()
        .map(|point| {
            let neighbor_ids: Vec<usize> = neighbors.row(point).to_vec();
            let neighborhood = data.select(Axis(0), &neighbor_ids);
            let local = analyze_neighborhood(backend, neighborhood.view(), alpha)
                .map_err(|source| CopacError::Decomposition { point, source })?;
            trace!(
                "Point {}: correlation dimension {} from {} neighbors.",
                point,
                local.correlation_dimension,
                neighbor_ids.len()
            );
            Ok(local)
        })
        .collect()
}
