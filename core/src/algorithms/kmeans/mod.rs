//! K-means clustering as an iterative refinement.
//!
//! Every round broadcasts the current centroids; each partition assigns its
//! rows to the nearest centroid and accumulates per-cluster counts and sums;
//! finalize divides to get the next centroids. A cluster that receives no
//! rows keeps its previous centroid.

mod seeding;

pub use seeding::InitStrategy;

use serde::{Deserialize, Serialize};

use crate::aggregator::DistributedAggregator;
use crate::broadcast::Broadcast;
use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::traits::{Aggregation, PartialResult, Refinement};

pub(crate) fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// `k` centroids of dimension `dim`, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Centroids {
    pub k: usize,
    pub dim: usize,
    pub values: Vec<f64>,
    /// Sum of squared distances of all rows to the centroids they were
    /// assigned to in the round that produced these; `None` for seeds
    pub objective: Option<f64>,
}

impl Centroids {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> AggResult<Self> {
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        if rows.is_empty() || dim == 0 {
            return Err(AggregationError::invalid_parameter(
                "centroids need at least one non-empty row",
            ));
        }
        if rows.iter().any(|r| r.len() != dim) {
            return Err(AggregationError::invalid_parameter(
                "centroid rows differ in length",
            ));
        }
        Ok(Self {
            k: rows.len(),
            dim,
            values: rows.concat(),
            objective: None,
        })
    }

    pub fn centroid(&self, i: usize) -> &[f64] {
        &self.values[i * self.dim..(i + 1) * self.dim]
    }

    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.values.chunks(self.dim).map(<[f64]>::to_vec).collect()
    }

    /// Index of and squared distance to the nearest centroid; ties go to the
    /// lower index.
    pub fn nearest(&self, point: &[f64]) -> (usize, f64) {
        let mut best = (0, f64::INFINITY);
        for i in 0..self.k {
            let d = squared_distance(point, self.centroid(i));
            if d < best.1 {
                best = (i, d);
            }
        }
        best
    }

    /// Cluster of every row of a partition.
    pub fn assign(&self, partition: &DataPartition) -> AggResult<Vec<usize>> {
        partition.ensure_features(self.dim)?;
        let mut out = Vec::with_capacity(partition.num_rows());
        partition.for_each_row(|_, row| out.push(self.nearest(row).0));
        Ok(out)
    }

    /// Largest Euclidean distance any centroid moved.
    pub fn max_shift(&self, other: &Centroids) -> f64 {
        if self.k != other.k || self.dim != other.dim {
            return f64::INFINITY;
        }
        (0..self.k)
            .map(|i| squared_distance(self.centroid(i), other.centroid(i)).sqrt())
            .fold(0.0, f64::max)
    }
}

/// K-means configuration.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub k: usize,
    pub init: InitStrategy,
    pub seed: u64,
}

impl KMeans {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            init: InitStrategy::default(),
            seed: 0,
        }
    }

    pub fn with_init(mut self, init: InitStrategy) -> Self {
        self.init = init;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Refinement for KMeans {
    type Artifact = Centroids;
    type Round = KMeansRound;

    fn name(&self) -> &str {
        "kmeans"
    }

    fn seed(
        &self,
        aggregator: &DistributedAggregator,
        partitions: &[DataPartition],
    ) -> AggResult<Centroids> {
        if self.k == 0 {
            return Err(AggregationError::invalid_parameter("k must be at least 1"));
        }
        seeding::seed_centroids(self, aggregator, partitions)
    }

    fn round(&self, centroids: Broadcast<Centroids>) -> KMeansRound {
        KMeansRound { centroids }
    }

    fn shift(&self, previous: &Centroids, next: &Centroids) -> f64 {
        previous.max_shift(next)
    }
}

/// One Lloyd step against broadcast centroids.
#[derive(Debug, Clone)]
pub struct KMeansRound {
    centroids: Broadcast<Centroids>,
}

impl KMeansRound {
    pub fn new(centroids: Broadcast<Centroids>) -> Self {
        Self { centroids }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSums {
    pub dim: usize,
    pub counts: Vec<u64>,
    /// Row-major `k x dim`
    pub sums: Vec<f64>,
    pub objective: f64,
}

impl PartialResult for ClusterSums {
    fn row_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    fn num_features(&self) -> usize {
        self.dim
    }
}

impl Aggregation for KMeansRound {
    type Partial = ClusterSums;
    type Output = Centroids;

    fn name(&self) -> &str {
        "kmeans_round"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<ClusterSums> {
        let centroids = self.centroids.value();
        partition.ensure_non_empty()?;
        partition.ensure_features(centroids.dim)?;

        let dim = centroids.dim;
        let mut counts = vec![0u64; centroids.k];
        let mut sums = vec![0.0; centroids.k * dim];
        let mut objective = 0.0;
        partition.for_each_row(|_, row| {
            let (cluster, d) = centroids.nearest(row);
            counts[cluster] += 1;
            objective += d;
            for (s, x) in sums[cluster * dim..(cluster + 1) * dim].iter_mut().zip(row) {
                *s += x;
            }
        });
        Ok(ClusterSums {
            dim,
            counts,
            sums,
            objective,
        })
    }

    fn merge(&self, left: ClusterSums, right: ClusterSums) -> AggResult<ClusterSums> {
        if left.dim != right.dim || left.sums.len() != right.sums.len() {
            return Err(AggregationError::feature_mismatch(left.dim, right.dim));
        }
        if left.counts.len() != right.counts.len() {
            return Err(AggregationError::invalid_parameter(format!(
                "cannot merge sums over {} and {} clusters",
                left.counts.len(),
                right.counts.len()
            )));
        }
        let mut merged = left;
        for (a, b) in merged.counts.iter_mut().zip(&right.counts) {
            *a += b;
        }
        for (a, b) in merged.sums.iter_mut().zip(&right.sums) {
            *a += b;
        }
        merged.objective += right.objective;
        Ok(merged)
    }

    fn finalize(&self, merged: ClusterSums) -> AggResult<Centroids> {
        let previous = self.centroids.value();
        let dim = merged.dim;
        if dim != previous.dim {
            return Err(AggregationError::feature_mismatch(previous.dim, dim));
        }
        if merged.counts.len() != previous.k || merged.sums.len() != previous.k * dim {
            return Err(AggregationError::invalid_parameter(format!(
                "cluster sums cover {} clusters, the broadcast centroids {}",
                merged.counts.len(),
                previous.k
            )));
        }
        let mut values = Vec::with_capacity(previous.k * dim);
        for (cluster, &count) in merged.counts.iter().enumerate() {
            if count == 0 {
                values.extend_from_slice(previous.centroid(cluster));
            } else {
                let n = count as f64;
                let sums = &merged.sums[cluster * dim..(cluster + 1) * dim];
                values.extend(sums.iter().map(|s| s / n));
            }
        }
        Ok(Centroids {
            k: previous.k,
            dim,
            values,
            objective: Some(merged.objective),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(rows: Vec<Vec<f64>>) -> KMeansRound {
        KMeansRound::new(Broadcast::new(Centroids::from_rows(rows).unwrap(), 1))
    }

    #[test]
    fn test_lloyd_step() {
        let data = DataPartition::from_rows(
            0,
            vec![vec![0.0, 0.0], vec![0.0, 2.0], vec![10.0, 0.0], vec![10.0, 2.0]],
        )
        .unwrap();
        let step = round(vec![vec![1.0, 1.0], vec![9.0, 1.0]]);
        let next = step.finalize(step.local_compute(&data).unwrap()).unwrap();

        assert_eq!(next.rows(), vec![vec![0.0, 1.0], vec![10.0, 1.0]]);
        assert_eq!(next.objective, Some(4.0 * 2.0));
    }

    #[test]
    fn test_empty_cluster_keeps_previous_centroid() {
        let data = DataPartition::from_rows(0, vec![vec![0.0], vec![1.0]]).unwrap();
        let step = round(vec![vec![0.5], vec![100.0]]);
        let next = step.finalize(step.local_compute(&data).unwrap()).unwrap();
        assert_eq!(next.rows(), vec![vec![0.5], vec![100.0]]);
    }

    #[test]
    fn test_wrong_dimension_is_data_shape() {
        let data = DataPartition::from_rows(6, vec![vec![0.0, 1.0, 2.0]]).unwrap();
        let err = round(vec![vec![0.0, 0.0]]).local_compute(&data).unwrap_err();
        assert_eq!(err.partition(), Some(6));
    }

    #[test]
    fn test_assign_and_shift() {
        let a = Centroids::from_rows(vec![vec![0.0, 0.0], vec![5.0, 5.0]]).unwrap();
        let b = Centroids::from_rows(vec![vec![3.0, 4.0], vec![5.0, 5.0]]).unwrap();
        assert_eq!(a.max_shift(&b), 5.0);

        let data = DataPartition::from_rows(0, vec![vec![1.0, 1.0], vec![4.0, 4.0]]).unwrap();
        assert_eq!(a.assign(&data).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_sums_from_another_round_are_rejected() {
        let data = DataPartition::from_rows(0, vec![vec![0.0, 0.0], vec![4.0, 4.0]]).unwrap();
        let two = round(vec![vec![0.0, 0.0], vec![4.0, 4.0]]);
        let three = round(vec![vec![0.0, 0.0], vec![2.0, 2.0], vec![4.0, 4.0]]);
        let sums = two.local_compute(&data).unwrap();

        let err = three.finalize(sums.clone()).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidParameter(_)));

        let line = DataPartition::from_rows(1, vec![vec![1.0]]).unwrap();
        let narrow = round(vec![vec![0.0], vec![4.0]]).local_compute(&line).unwrap();
        let err = two.merge(sums, narrow).unwrap_err();
        assert!(matches!(
            err,
            AggregationError::DimensionMismatch {
                left_features: 2,
                right_features: 1,
                ..
            }
        ));
    }
}
