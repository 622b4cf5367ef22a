//! Correlation distance within one partition.
//!
//! The directional form `cdist(P, Q) = (Q - P)ᵀ M̂_P (Q - P)` is the squared deviation of Q from
//! the affine subspace through P spanned by P's correlated directions. It is not symmetric,
//! since `M̂_P` and `M̂_Q` differ. The symmetric distance takes the larger of both directions:
//!
//! ```text
//! dist(P, Q) = sqrt(max(cdist(P, Q), cdist(Q, P)))
//! ```
//!
//! so two points are close only if each lies near the other's local subspace.
//!
//! # Memory
//!
//! A partition of `n_D` points needs a dense `n_D x n_D` matrix. A single partition can hold
//! every point, so memory is `O(n^2)` in the worst case; this is the scalability ceiling of the
//! whole pipeline.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::local_dim::LocalCorrelation;

/// Directional correlation distance `(q - p)ᵀ M̂_p (q - p)`, before the square root.
pub fn directional_distance(p: ArrayView1<f64>, q: ArrayView1<f64>, projection_p: ArrayView2<f64>) -> f64 {
    quadratic_form(&(&q - &p), projection_p)
}

#[inline]
fn quadratic_form(diff: &Array1<f64>, projection: ArrayView2<f64>) -> f64 {
    diff.dot(&projection.dot(diff))
}

/// Symmetric correlation distance matrix of the points `members` (indices into `data` and
/// `locals`).
///
/// The result is exactly symmetric with a zero diagonal. Each unordered pair is evaluated once;
/// rounding that would push the larger directional value below zero is clamped, so every entry
/// is finite and nonnegative for finite input.
pub fn partition_distance_matrix(
    data: ArrayView2<f64>,
    locals: &[LocalCorrelation],
    members: &[usize],
) -> Array2<f64> {
    let n_members = members.len();

    let upper_rows: Vec<Vec<f64>> = (0..n_members)
        .into_par_iter()
        .map(|i| {
            let p = members[i];
            let x_p = data.row(p);
            let projection_p = locals[p].projection.view();
            members[i + 1..]
                .iter()
                .map(|&q| {
                    let diff = &data.row(q) - &x_p;
                    let forward = quadratic_form(&diff, projection_p);
                    let backward = quadratic_form(&diff, locals[q].projection.view());
                    forward.max(backward).max(0.0).sqrt()
                })
                .collect()
        })
        .collect();

    let mut distances = Array2::<f64>::zeros((n_members, n_members));
    for (i, row) in upper_rows.into_iter().enumerate() {
        for (offset, value) in row.into_iter().enumerate() {
            let j = i + 1 + offset;
            distances[[i, j]] = value;
            distances[[j, i]] = value;
        }
    }
    distances
}
