// src/linalg_backends.rs

use ndarray::{Array1, Array2};
use std::marker::PhantomData;

use crate::error::ThreadSafeStdError;

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues in ascending order.
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<F>,
}

/// Symmetric eigendecomposition (LAPACK's DSYEVD family).
/// Implementers read only the upper triangle of `matrix`.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, ThreadSafeStdError>;
}

// --- ndarray-linalg (LAPACK) backend ---
use ndarray_linalg::{Eigh as NdLinalgEigh, UPLO};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

impl BackendEigh<f64> for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, ThreadSafeStdError> {
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(|e| Box::new(e) as ThreadSafeStdError)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

// --- faer backend ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{BackendEigh, EighOutput};
    use crate::error::ThreadSafeStdError;
    use ndarray::{Array1, Array2};

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    impl BackendEigh<f64> for FaerLinAlgBackend {
        fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, ThreadSafeStdError> {
            let (nrows, ncols) = matrix.dim();
            if nrows != ncols {
                return Err(format!("Matrix must be square for eigendecomposition, got {}x{}.", nrows, ncols).into());
            }
            if matrix.is_empty() {
                return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
            }
            // Copying also makes the layout irrelevant.
            let faer_mat = faer::Mat::<f64>::from_fn(nrows, ncols, |i, j| matrix[[i, j]]);
            let eig = faer_mat
                .self_adjoint_eigen(faer::Side::Upper)
                .map_err(|e| format!("faer eigendecomposition failed: {:?}", e))?;
            let values = eig.S().column_vector();
            let vectors = eig.U();
            Ok(EighOutput {
                eigenvalues: Array1::from_shape_fn(nrows, |i| values[i]),
                eigenvectors: Array2::from_shape_fn((nrows, ncols), |(i, j)| vectors[(i, j)]),
            })
        }
    }
}

/// Dispatches to the linear algebra backend selected by cargo features.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    /// Backend chosen by the enabled cargo features.
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

impl BackendEigh<f64> for LinAlgBackendProvider<f64> {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, ThreadSafeStdError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.eigh_upper(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.eigh_upper(matrix)
        }
    }
}
