use thiserror::Error;

/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
///
/// Collaborators (neighbor search, density clustering, linear algebra backends)
/// report failures with this type; the orchestrator wraps them into [`CopacError`].
pub type ThreadSafeStdError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the COPAC pipeline.
#[derive(Debug, Error)]
pub enum CopacError {
    /// A configuration value is out of its valid range.
    #[error("invalid parameter {name}: {message}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Human-readable explanation.
        message: String,
    },

    /// The input matrix has a shape the computation cannot work with.
    #[error("invalid input shape: {0}")]
    InputShape(String),

    /// The input matrix contains NaN or an infinite value.
    #[error("non-finite input value at row {row}, column {col}")]
    NonFiniteInput {
        /// Row of the first offending value.
        row: usize,
        /// Column of the first offending value.
        col: usize,
    },

    /// The neighborhood provider could not answer the k-nearest-neighbor query.
    #[error("nearest-neighbor search failed: {0}")]
    NeighborhoodFailure(#[source] ThreadSafeStdError),

    /// Eigendecomposition of a local covariance matrix failed.
    #[error("eigendecomposition of the local covariance of point {point} failed: {source}")]
    Decomposition {
        /// Index of the point whose neighborhood was being analyzed.
        point: usize,
        /// Backend error.
        #[source]
        source: ThreadSafeStdError,
    },

    /// The density clustering provider failed for one partition.
    #[error("density clustering of the partition with correlation dimension {correlation_dimension} failed: {source}")]
    ClusteringProviderFailure {
        /// Correlation dimension shared by the partition's points.
        correlation_dimension: usize,
        /// Provider error.
        #[source]
        source: ThreadSafeStdError,
    },

    /// The dedicated worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),

    /// An internal consistency check failed. This indicates a defect, not bad input.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl CopacError {
    pub(crate) fn invalid_parameter(name: &'static str, message: impl Into<String>) -> Self {
        CopacError::InvalidParameter {
            name,
            message: message.into(),
        }
    }
}

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, CopacError>;
