//! Principal component analysis on merged covariance statistics.
//!
//! The local and merge steps are those of [`Covariance`](super::Covariance);
//! finalize eigendecomposes the covariance or correlation matrix.

use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::algorithms::covariance::{
    self, CovariancePartial, compute_partial, correlation_matrix, merge_partials,
};
use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::traits::Aggregation;

/// Matrix the components are extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcaMethod {
    /// Correlation matrix; features are standardized first
    #[default]
    Correlation,
    Covariance,
}

#[derive(Debug, Clone, Default)]
pub struct Pca {
    pub method: PcaMethod,
    /// Number of components kept; all when `None`
    pub n_components: Option<usize>,
}

impl Pca {
    pub fn new(method: PcaMethod) -> Self {
        Self {
            method,
            n_components: None,
        }
    }

    pub fn with_components(mut self, n: usize) -> Self {
        self.n_components = Some(n);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaResult {
    pub method: PcaMethod,
    /// Descending
    pub eigenvalues: Vec<f64>,
    /// One component per row, each of unit length
    pub eigenvectors: DMatrix<f64>,
    pub explained_variance_ratio: Vec<f64>,
    pub means: Vec<f64>,
    /// Per-feature standard deviations used to standardize (all 1 for the
    /// covariance method)
    pub scales: Vec<f64>,
}

impl PcaResult {
    /// Project one row onto the kept components.
    pub fn project(&self, row: &[f64]) -> Vec<f64> {
        (0..self.eigenvectors.nrows())
            .map(|c| {
                row.iter()
                    .enumerate()
                    .map(|(j, x)| (x - self.means[j]) / self.scales[j] * self.eigenvectors[(c, j)])
                    .sum()
            })
            .collect()
    }

    /// Project every row of a partition.
    pub fn transform(&self, partition: &DataPartition) -> AggResult<Vec<Vec<f64>>> {
        partition.ensure_features(self.means.len())?;
        let mut out = Vec::with_capacity(partition.num_rows());
        partition.for_each_row(|_, row| out.push(self.project(row)));
        Ok(out)
    }
}

impl Aggregation for Pca {
    type Partial = CovariancePartial;
    type Output = PcaResult;

    fn name(&self) -> &str {
        "pca"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<CovariancePartial> {
        compute_partial(partition)
    }

    fn merge(
        &self,
        left: CovariancePartial,
        right: CovariancePartial,
    ) -> AggResult<CovariancePartial> {
        merge_partials(left, right)
    }

    fn finalize(&self, merged: CovariancePartial) -> AggResult<PcaResult> {
        let p = merged.sums.len();
        let kept = self.n_components.unwrap_or(p);
        if kept == 0 || kept > p {
            return Err(AggregationError::invalid_parameter(format!(
                "n_components must be in 1..={}, got {}",
                p, kept
            )));
        }

        let cov = covariance::covariance_matrix(&merged)?;
        let (matrix, scales) = match self.method {
            PcaMethod::Covariance => (cov, vec![1.0; p]),
            PcaMethod::Correlation => {
                let scales = (0..p)
                    .map(|i| {
                        let sd = cov[(i, i)].sqrt();
                        if sd > 0.0 { sd } else { 1.0 }
                    })
                    .collect();
                (correlation_matrix(&cov), scales)
            }
        };

        let eigen = SymmetricEigen::new(matrix);
        let eigenvalues = eigen.eigenvalues;
        let eigenvectors = eigen.eigenvectors;

        let mut order: Vec<usize> = (0..p).collect();
        order.sort_by(|&a, &b| {
            eigenvalues[b]
                .partial_cmp(&eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let total: f64 = eigenvalues.iter().sum();
        let mut components = DMatrix::zeros(kept, p);
        let mut values = Vec::with_capacity(kept);
        for (c, &idx) in order.iter().take(kept).enumerate() {
            values.push(eigenvalues[idx]);
            // Sign convention: largest-magnitude loading is positive
            let column = eigenvectors.column(idx);
            let pivot = column.iter().fold(0.0_f64, |acc, &v| {
                if v.abs() > acc.abs() { v } else { acc }
            });
            let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
            for j in 0..p {
                components[(c, j)] = sign * column[j];
            }
        }
        let explained_variance_ratio = values
            .iter()
            .map(|v| if total > 0.0 { v / total } else { 0.0 })
            .collect();

        Ok(PcaResult {
            method: self.method,
            eigenvalues: values,
            eigenvectors: components,
            explained_variance_ratio,
            means: merged.mean,
            scales,
        })
    }
}
