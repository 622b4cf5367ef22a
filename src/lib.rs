// Correlation clustering (COPAC)

#![doc = include_str!("../README.md")]

pub mod config;
pub mod copac;
pub mod correlation_distance;
pub mod dbscan;
pub mod error;
pub mod linalg_backends;
pub mod local_dim;
pub mod neighbors;
pub mod partition;


pub use crate::config::{CopacConfig, NeighborAlgorithm};
pub use crate::copac::{copac, Copac, CopacOutput};
pub use crate::dbscan::{DensityClusteringProvider, PrecomputedDbscan, NOISE};
pub use crate::error::{CopacError, Result, ThreadSafeStdError};
pub use crate::local_dim::LocalCorrelation;
pub use crate::neighbors::{BruteForceNeighbors, KdTreeNeighbors, Metric, NeighborSearch, NeighborhoodProvider};
pub use crate::partition::Partition;
