//! COPAC orchestration: local analysis, partitioning, per-partition clustering and the merge
//! of per-partition labels into one global labeling.
//!
//! Phases:
//! 1. k-nearest neighbors and local correlation analysis, parallel over points.
//! 2. Per partition (ascending correlation dimension): correlation distance matrix and density
//!    clustering, parallel over partitions.
//! 3. Merge, a sequential fold over the partitions in ascending dimension order that threads the
//!    global cluster-id offset. Running phase 2 concurrently does not change the numbering.

use std::time::Instant;

use log::{debug, error, info, warn};
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use sysinfo::System;

use crate::config::CopacConfig;
use crate::correlation_distance::partition_distance_matrix;
use crate::dbscan::{DensityClusteringProvider, PrecomputedDbscan, NOISE};
use crate::error::{CopacError, Result};
use crate::linalg_backends::LinAlgBackendProvider;
use crate::local_dim::{analyze_all, LocalCorrelation};
use crate::neighbors::{NeighborSearch, NeighborhoodProvider};
use crate::partition::{partition_by_dimension, Partition};

/// Result of a COPAC run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopacOutput {
    /// One label per input point: [`NOISE`] or a cluster id in `0..num_clusters`, unique across
    /// the whole dataset.
    pub labels: Vec<i64>,
    /// Local correlation dimension of each point.
    pub correlation_dimensions: Vec<usize>,
    /// Number of clusters found over all partitions.
    pub num_clusters: usize,
}

impl CopacOutput {
    /// Number of points labeled as noise.
    pub fn num_noise(&self) -> usize {
        self.labels.iter().filter(|&&label| label == NOISE).count()
    }
}

/// A partition whose correlation distance matrix has been computed.
#[derive(Debug)]
pub(crate) struct PartitionDistances {
    pub(crate) partition: Partition,
    pub(crate) distances: Array2<f64>,
}

impl PartitionDistances {
    pub(crate) fn compute(partition: Partition, data: ArrayView2<f64>, locals: &[LocalCorrelation]) -> Self {
        let distances = partition_distance_matrix(data, locals, &partition.members);
        PartitionDistances { partition, distances }
    }

    /// Runs the density clustering and checks the provider's labels. Consumes the distance
    /// matrix.
    pub(crate) fn cluster<C: DensityClusteringProvider>(
        self,
        clusterer: &C,
        eps: f64,
        min_samples: usize,
    ) -> Result<ClusteredPartition> {
        let correlation_dimension = self.partition.correlation_dimension;
        let provider_failure = |message: String| CopacError::ClusteringProviderFailure {
            correlation_dimension,
            source: message.into(),
        };

        let local_labels = clusterer
            .cluster(self.distances.view(), eps, min_samples)
            .map_err(|source| CopacError::ClusteringProviderFailure {
                correlation_dimension,
                source,
            })?;

        if local_labels.len() != self.partition.len() {
            return Err(provider_failure(format!(
                "returned {} labels for {} points",
                local_labels.len(),
                self.partition.len()
            )));
        }

        let mut seen: Vec<bool> = Vec::new();
        for &label in &local_labels {
            if label == NOISE {
                continue;
            }
            // An id of at least the label count can never be part of a contiguous range.
            if label < 0 || label >= local_labels.len() as i64 {
                return Err(provider_failure(format!("returned invalid label {}", label)));
            }
            let label = label as usize;
            if label >= seen.len() {
                seen.resize(label + 1, false);
            }
            seen[label] = true;
        }
        // Ids must be 0..m so that the merge offset can advance by the cluster count.
        if let Some(missing) = seen.iter().position(|&used| !used) {
            return Err(provider_failure(format!(
                "cluster ids are not contiguous: {} is unused but {} is",
                missing,
                seen.len() - 1
            )));
        }

        debug!(
            "Partition with correlation dimension {}: {} points, {} clusters, {} noise.",
            correlation_dimension,
            self.partition.len(),
            seen.len(),
            local_labels.iter().filter(|&&l| l == NOISE).count()
        );

        Ok(ClusteredPartition {
            partition: self.partition,
            local_labels,
            num_clusters: seen.len(),
        })
    }
}

/// A partition with validated local labels, ready to merge.
#[derive(Clone, Debug)]
pub(crate) struct ClusteredPartition {
    pub(crate) partition: Partition,
    pub(crate) local_labels: Vec<i64>,
    pub(crate) num_clusters: usize,
}

/// Writes one partition's labels into the global vector, shifted by `offset`, and returns the
/// offset for the next partition.
///
/// `owners[id]` records which partition (by correlation dimension) produced global id `id`.
pub(crate) fn merge_partition(
    assigned: &mut [Option<i64>],
    owners: &mut Vec<Option<usize>>,
    clustered: &ClusteredPartition,
    offset: usize,
) -> Result<usize> {
    let dimension = clustered.partition.correlation_dimension;
    let next_offset = offset + clustered.num_clusters;
    if owners.len() < next_offset {
        owners.resize(next_offset, None);
    }

    for (&point, &local) in clustered.partition.members.iter().zip(&clustered.local_labels) {
        let slot = assigned.get_mut(point).ok_or_else(|| {
            CopacError::InvariantViolation(format!("partition member {} is out of range", point))
        })?;
        if let Some(previous) = *slot {
            return Err(CopacError::InvariantViolation(format!(
                "point {} labeled twice (already {})",
                point, previous
            )));
        }

        let global = if local == NOISE {
            NOISE
        } else {
            let global = offset + local as usize;
            match owners.get(global).copied().flatten() {
                Some(owner) if owner != dimension => {
                    return Err(CopacError::InvariantViolation(format!(
                        "global cluster id {} produced by partitions {} and {}",
                        global, owner, dimension
                    )));
                }
                _ => {}
            }
            if global >= next_offset {
                return Err(CopacError::InvariantViolation(format!(
                    "global cluster id {} beyond the range of partition {}",
                    global, dimension
                )));
            }
            owners[global] = Some(dimension);
            global as i64
        };
        *slot = Some(global);
    }

    Ok(next_offset)
}

/// Sequential merge of all partitions in the given (canonical) order.
///
/// Returns the label vector and the total number of clusters. Fails if any point is left
/// unlabeled or any id is claimed by two partitions.
pub(crate) fn merge_partitions(n_samples: usize, clustered: &[ClusteredPartition]) -> Result<(Vec<i64>, usize)> {
    let mut assigned: Vec<Option<i64>> = vec![None; n_samples];
    let mut owners: Vec<Option<usize>> = Vec::new();

    let num_clusters = clustered.iter().try_fold(0usize, |offset, partition| {
        merge_partition(&mut assigned, &mut owners, partition, offset)
    })?;

    if let Some(unused) = owners.iter().position(|owner| owner.is_none()) {
        return Err(CopacError::InvariantViolation(format!(
            "global cluster id {} was reserved but never assigned",
            unused
        )));
    }

    let mut labels = Vec::with_capacity(n_samples);
    for (point, label) in assigned.into_iter().enumerate() {
        match label {
            Some(label) => labels.push(label),
            None => {
                return Err(CopacError::InvariantViolation(format!(
                    "point {} received no label",
                    point
                )))
            }
        }
    }
    Ok((labels, num_clusters))
}

fn check_neighbor_matrix(neighbors: &Array2<usize>, n_samples: usize, k: usize) -> Result<()> {
    if neighbors.dim() != (n_samples, k) {
        return Err(CopacError::NeighborhoodFailure(
            format!(
                "expected a {} x {} neighbor matrix, got {:?}",
                n_samples,
                k,
                neighbors.dim()
            )
            .into(),
        ));
    }
    for (point, row) in neighbors.outer_iter().enumerate() {
        if let Some(&bad) = row.iter().find(|&&idx| idx >= n_samples || idx == point) {
            return Err(CopacError::NeighborhoodFailure(
                format!("invalid neighbor {} for point {}", bad, point).into(),
            ));
        }
    }
    Ok(())
}

fn log_memory_ceiling(partitions: &[Partition]) {
    let required_bytes: u64 = partitions
        .iter()
        .map(|p| (p.len() as u64).pow(2) * std::mem::size_of::<f64>() as u64)
        .sum();
    let mut system = System::new();
    system.refresh_memory();
    let available_bytes = system.available_memory();
    if available_bytes > 0 && required_bytes > available_bytes {
        warn!(
            "Correlation distance matrices need up to {} bytes but only {} bytes are available. \
             Memory grows with the square of the largest partition.",
            required_bytes, available_bytes
        );
    } else {
        debug!(
            "Correlation distance matrices need up to {} bytes ({} bytes available).",
            required_bytes, available_bytes
        );
    }
}

/// COPAC clusterer.
///
/// # Examples
///
/// ```
/// use copac::{Copac, CopacConfig};
/// use ndarray::Array2;
///
/// // Twenty identical points share one zero-variance neighborhood.
/// let data = Array2::<f64>::from_elem((20, 3), 1.5);
/// let config = CopacConfig { k: 5, mu: 3, ..Default::default() };
/// let output = Copac::new(config).fit(data.view()).unwrap();
/// assert!(output.labels.iter().all(|&label| label == 0));
/// assert_eq!(output.num_clusters, 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Copac {
    config: CopacConfig,
}

impl Copac {
    /// Creates a clusterer; the configuration is checked when fitting.
    pub fn new(config: CopacConfig) -> Self {
        Self { config }
    }

    /// The configuration this clusterer runs with.
    pub fn config(&self) -> &CopacConfig {
        &self.config
    }

    /// Clusters `data` (or a square distance matrix under `Metric::Precomputed`) with the
    /// neighbor search selected by the configuration and DBSCAN.
    pub fn fit(&self, data: ArrayView2<f64>) -> Result<CopacOutput> {
        // The input itself is checked once, in `fit_with`.
        self.config.validate()?;
        let search = NeighborSearch::from_config(&self.config, data.nrows())?;
        self.fit_with(data, &search, &PrecomputedDbscan)
    }

    /// Like [`Copac::fit`], returning only the labels.
    pub fn fit_predict(&self, data: ArrayView2<f64>) -> Result<Vec<i64>> {
        Ok(self.fit(data)?.labels)
    }

    /// Runs the pipeline with caller-supplied collaborators.
    pub fn fit_with<N, C>(&self, data: ArrayView2<f64>, neighbors: &N, clusterer: &C) -> Result<CopacOutput>
    where
        N: NeighborhoodProvider,
        C: DensityClusteringProvider,
    {
        self.config.validate()?;
        self.config.validate_input(data)?;

        match self.config.num_threads {
            Some(num_threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build()
                    .map_err(|e| CopacError::ThreadPool(e.to_string()))?;
                pool.install(|| self.run(data, neighbors, clusterer))
            }
            None => self.run(data, neighbors, clusterer),
        }
    }

    fn run<N, C>(&self, data: ArrayView2<f64>, neighbors: &N, clusterer: &C) -> Result<CopacOutput>
    where
        N: NeighborhoodProvider,
        C: DensityClusteringProvider,
    {
        let config = &self.config;
        let (n_samples, n_features) = data.dim();
        info!(
            "Starting COPAC. Points={}, Features={}, k={}, mu={}, eps={}, alpha={}, Threads={}",
            n_samples,
            n_features,
            config.k,
            config.mu,
            config.eps,
            config.alpha,
            rayon::current_num_threads()
        );
        let overall_start_time = Instant::now();

        let neighbors_start_time = Instant::now();
        let knn = neighbors
            .query(data, config.k)
            .map_err(CopacError::NeighborhoodFailure)?;
        check_neighbor_matrix(&knn, n_samples, config.k)?;
        info!("Found {} nearest neighbors per point in {:?}", config.k, neighbors_start_time.elapsed());

        let analysis_start_time = Instant::now();
        let backend = LinAlgBackendProvider::<f64>::new();
        let locals = analyze_all(&backend, data, knn.view(), config.alpha)?;
        drop(knn);
        let correlation_dimensions: Vec<usize> = locals.iter().map(|l| l.correlation_dimension).collect();
        info!("Computed local correlation dimensions in {:?}", analysis_start_time.elapsed());

        let partitions = partition_by_dimension(&correlation_dimensions, n_features)?;
        for partition in &partitions {
            debug!(
                "Correlation dimension {}: {} points.",
                partition.correlation_dimension,
                partition.len()
            );
        }
        log_memory_ceiling(&partitions);

        let clustering_start_time = Instant::now();
        let clustered: Vec<ClusteredPartition> = partitions
            .into_par_iter()
            .map(|partition| {
                PartitionDistances::compute(partition, data, &locals).cluster(clusterer, config.eps, config.mu)
            })
            .collect::<Result<Vec<_>>>()?;
        info!(
            "Clustered {} partitions in {:?}",
            clustered.len(),
            clustering_start_time.elapsed()
        );

        let (labels, num_clusters) = merge_partitions(n_samples, &clustered).map_err(|e| {
            error!("Merging partition labels failed: {}", e);
            e
        })?;

        let output = CopacOutput {
            labels,
            correlation_dimensions,
            num_clusters,
        };
        info!(
            "COPAC completed in {:?}. Found {} clusters, {} noise points.",
            overall_start_time.elapsed(),
            output.num_clusters,
            output.num_noise()
        );
        Ok(output)
    }
}

/// Clusters `data` with `config` and returns one label per point ([`NOISE`] for noise).
pub fn copac(data: ArrayView2<f64>, config: &CopacConfig) -> Result<Vec<i64>> {
    Copac::new(config.clone()).fit_predict(data)
}
