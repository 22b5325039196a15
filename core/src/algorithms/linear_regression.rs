//! Least squares linear regression via the normal equations.
//!
//! Each partition contributes `X^T X` and `X^T y`; these add under merge and
//! finalize solves `(X^T X + lambda I) b = X^T y` by Cholesky factorization.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::traits::{Aggregation, PartialResult};

/// Relative size below which a Cholesky pivot counts as zero.
const PIVOT_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct LinearRegression {
    pub fit_intercept: bool,
    /// L2 penalty; the intercept is never penalized
    pub ridge: f64,
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self {
            fit_intercept: true,
            ridge: 0.0,
        }
    }
}

impl LinearRegression {
    pub fn ridge(lambda: f64) -> Self {
        Self {
            fit_intercept: true,
            ridge: lambda,
        }
    }

    pub fn without_intercept(mut self) -> Self {
        self.fit_intercept = false;
        self
    }

    fn width(&self, features: usize) -> usize {
        features + usize::from(self.fit_intercept)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalEquations {
    pub count: u64,
    pub features: usize,
    /// Row-major `d x d`, `d = features + intercept`
    pub xtx: Vec<f64>,
    pub xty: Vec<f64>,
}

impl PartialResult for NormalEquations {
    fn row_count(&self) -> u64 {
        self.count
    }

    fn num_features(&self) -> usize {
        self.features
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearModel {
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(row)
                .map(|(b, x)| b * x)
                .sum::<f64>()
    }

    pub fn predict_partition(&self, partition: &DataPartition) -> AggResult<Vec<f64>> {
        partition.ensure_features(self.coefficients.len())?;
        let mut out = Vec::with_capacity(partition.num_rows());
        partition.for_each_row(|_, row| out.push(self.predict(row)));
        Ok(out)
    }
}

impl Aggregation for LinearRegression {
    type Partial = NormalEquations;
    type Output = LinearModel;

    fn name(&self) -> &str {
        "linear_regression"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<NormalEquations> {
        partition.ensure_non_empty()?;
        let labels = partition.require_labels()?;
        let features = partition.num_cols();
        let d = self.width(features);
        let offset = usize::from(self.fit_intercept);

        let mut xtx = vec![0.0; d * d];
        let mut xty = vec![0.0; d];
        let mut x = vec![1.0; d];
        partition.for_each_row(|i, row| {
            x[offset..].copy_from_slice(row);
            let y = labels[i];
            for a in 0..d {
                xty[a] += x[a] * y;
                for b in 0..d {
                    xtx[a * d + b] += x[a] * x[b];
                }
            }
        });

        Ok(NormalEquations {
            count: partition.num_rows() as u64,
            features,
            xtx,
            xty,
        })
    }

    fn merge(&self, left: NormalEquations, right: NormalEquations) -> AggResult<NormalEquations> {
        if left.features != right.features || left.xtx.len() != right.xtx.len() {
            return Err(AggregationError::feature_mismatch(
                left.features,
                right.features,
            ));
        }
        let mut merged = left;
        merged.count += right.count;
        for (a, b) in merged.xtx.iter_mut().zip(&right.xtx) {
            *a += b;
        }
        for (a, b) in merged.xty.iter_mut().zip(&right.xty) {
            *a += b;
        }
        Ok(merged)
    }

    fn finalize(&self, merged: NormalEquations) -> AggResult<LinearModel> {
        if !self.ridge.is_finite() || self.ridge < 0.0 {
            return Err(AggregationError::invalid_parameter(format!(
                "ridge penalty must be non-negative, got {}",
                self.ridge
            )));
        }
        let d = self.width(merged.features);
        let offset = usize::from(self.fit_intercept);

        let mut a = DMatrix::from_row_slice(d, d, &merged.xtx);
        for i in offset..d {
            a[(i, i)] += self.ridge;
        }
        let b = DVector::from_vec(merged.xty);

        let singular = || {
            AggregationError::numerical(format!(
                "normal equations over {} rows are singular",
                merged.count
            ))
        };
        let scale = a.diagonal().amax();
        let cholesky = a.cholesky().ok_or_else(singular)?;
        let l = cholesky.l();
        if (0..d).any(|i| l[(i, i)] * l[(i, i)] <= PIVOT_TOLERANCE * scale) {
            return Err(singular());
        }
        let solution = cholesky.solve(&b);

        let intercept = if self.fit_intercept { solution[0] } else { 0.0 };
        Ok(LinearModel {
            intercept,
            coefficients: solution.iter().skip(offset).copied().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(index: usize, xs: &[(f64, f64)]) -> DataPartition {
        let rows = xs.iter().map(|&(a, b)| vec![a, b]).collect();
        let labels = xs.iter().map(|&(a, b)| 1.0 + 2.0 * a - 3.0 * b).collect();
        DataPartition::from_rows(index, rows)
            .unwrap()
            .with_labels(labels)
            .unwrap()
    }

    #[test]
    fn test_recovers_exact_plane() {
        let lr = LinearRegression::default();
        let a = lr
            .local_compute(&partition(0, &[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]))
            .unwrap();
        let b = lr
            .local_compute(&partition(1, &[(2.0, 1.0), (3.0, 5.0)]))
            .unwrap();
        let model = lr.finalize(lr.merge(a, b).unwrap()).unwrap();

        assert!((model.intercept - 1.0).abs() < 1e-9);
        assert!((model.coefficients[0] - 2.0).abs() < 1e-9);
        assert!((model.coefficients[1] + 3.0).abs() < 1e-9);
        assert!((model.predict(&[1.0, 1.0]) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_singular_system() {
        // Second column duplicates the first
        let p = DataPartition::from_rows(0, vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]])
            .unwrap()
            .with_labels(vec![1.0, 2.0, 3.0])
            .unwrap();
        let lr = LinearRegression::default();
        let err = lr.finalize(lr.local_compute(&p).unwrap()).unwrap_err();
        assert!(matches!(err, AggregationError::Numerical(_)));

        // A ridge penalty makes it solvable
        let ridge = LinearRegression::ridge(0.1);
        assert!(ridge.finalize(ridge.local_compute(&p).unwrap()).is_ok());
    }

    #[test]
    fn test_labels_required() {
        let p = DataPartition::from_rows(2, vec![vec![1.0]]).unwrap();
        let err = LinearRegression::default().local_compute(&p).unwrap_err();
        assert_eq!(err.partition(), Some(2));
    }

    #[test]
    fn test_merge_rejects_different_widths() {
        let lr = LinearRegression::default();
        let narrow = DataPartition::from_rows(1, vec![vec![1.0], vec![2.0]])
            .unwrap()
            .with_labels(vec![1.0, 2.0])
            .unwrap();
        let err = lr
            .merge(
                lr.local_compute(&partition(0, &[(0.0, 0.0), (1.0, 2.0)]))
                    .unwrap(),
                lr.local_compute(&narrow).unwrap(),
            )
            .unwrap_err();
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
