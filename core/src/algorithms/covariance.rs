//! Covariance and correlation matrices.

use nalgebra::{DMatrix, DVector};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::traits::{Aggregation, PartialResult};

/// Selects one matrix out of a [`CovarianceResult`].
///
/// Every variant has its own integer value, so a numeric lookup never
/// confuses the covariance with the correlation matrix.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[num_enum(error_type(name = AggregationError, constructor = ResultId::invalid))]
#[repr(u8)]
pub enum ResultId {
    Covariance = 0,
    Correlation = 1,
    Mean = 2,
}

impl ResultId {
    fn invalid(value: u8) -> AggregationError {
        AggregationError::invalid_parameter(format!("invalid covariance result id: {value}"))
    }
}

/// Covariance over all columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct Covariance;

/// Count, column sums, running mean and centered cross-products.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariancePartial {
    pub count: u64,
    pub sums: Vec<f64>,
    pub mean: Vec<f64>,
    /// Row-major `p x p` sum of `(x - mean)(x - mean)^T`
    pub crossproduct: Vec<f64>,
}

impl PartialResult for CovariancePartial {
    fn row_count(&self) -> u64 {
        self.count
    }

    fn num_features(&self) -> usize {
        self.sums.len()
    }
}

pub(crate) fn compute_partial(partition: &DataPartition) -> AggResult<CovariancePartial> {
    partition.ensure_non_empty()?;
    let p = partition.num_cols();
    let mut partial = CovariancePartial {
        count: 0,
        sums: vec![0.0; p],
        mean: vec![0.0; p],
        crossproduct: vec![0.0; p * p],
    };
    let mut before = vec![0.0; p];
    partition.for_each_row(|_, row| {
        partial.count += 1;
        let n = partial.count as f64;
        for j in 0..p {
            before[j] = row[j] - partial.mean[j];
            partial.sums[j] += row[j];
            partial.mean[j] += before[j] / n;
        }
        for i in 0..p {
            for j in 0..p {
                partial.crossproduct[i * p + j] += before[i] * (row[j] - partial.mean[j]);
            }
        }
    });
    Ok(partial)
}

pub(crate) fn merge_partials(
    left: CovariancePartial,
    right: CovariancePartial,
) -> AggResult<CovariancePartial> {
    if left.sums.len() != right.sums.len() {
        return Err(AggregationError::feature_mismatch(
            left.sums.len(),
            right.sums.len(),
        ));
    }
    if left.count == 0 {
        return Ok(right);
    }
    if right.count == 0 {
        return Ok(left);
    }

    let p = left.sums.len();
    let na = left.count as f64;
    let nb = right.count as f64;
    let n = na + nb;
    let delta: Vec<f64> = (0..p).map(|j| right.mean[j] - left.mean[j]).collect();

    let mut merged = left;
    for i in 0..p {
        for j in 0..p {
            merged.crossproduct[i * p + j] +=
                right.crossproduct[i * p + j] + delta[i] * delta[j] * na * nb / n;
        }
    }
    for j in 0..p {
        merged.sums[j] += right.sums[j];
        merged.mean[j] += delta[j] * nb / n;
    }
    merged.count += right.count;
    Ok(merged)
}

/// Sample covariance matrix (divides by `count - 1`).
pub(crate) fn covariance_matrix(partial: &CovariancePartial) -> AggResult<DMatrix<f64>> {
    if partial.count < 2 {
        return Err(AggregationError::numerical(format!(
            "covariance needs at least 2 rows, got {}",
            partial.count
        )));
    }
    let p = partial.sums.len();
    let scale = 1.0 / (partial.count as f64 - 1.0);
    Ok(DMatrix::from_row_slice(p, p, &partial.crossproduct) * scale)
}

/// Correlation from covariance. Columns with zero variance correlate 1 with
/// themselves and 0 with everything else.
pub(crate) fn correlation_matrix(covariance: &DMatrix<f64>) -> DMatrix<f64> {
    let p = covariance.nrows();
    let sd: Vec<f64> = (0..p).map(|i| covariance[(i, i)].sqrt()).collect();
    DMatrix::from_fn(p, p, |i, j| {
        if i == j {
            1.0
        } else if sd[i] > 0.0 && sd[j] > 0.0 {
            covariance[(i, j)] / (sd[i] * sd[j])
        } else {
            0.0
        }
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceResult {
    pub count: u64,
    pub covariance: DMatrix<f64>,
    pub correlation: DMatrix<f64>,
    pub mean: DVector<f64>,
}

impl CovarianceResult {
    /// The selected result; `Mean` comes back as a `1 x p` matrix.
    pub fn get(&self, id: ResultId) -> DMatrix<f64> {
        match id {
            ResultId::Covariance => self.covariance.clone(),
            ResultId::Correlation => self.correlation.clone(),
            ResultId::Mean => DMatrix::from_row_slice(1, self.mean.len(), self.mean.as_slice()),
        }
    }

    /// Lookup by the integer value of a [`ResultId`].
    pub fn get_by_value(&self, value: u8) -> AggResult<DMatrix<f64>> {
        Ok(self.get(ResultId::try_from(value)?))
    }
}

impl Aggregation for Covariance {
    type Partial = CovariancePartial;
    type Output = CovarianceResult;

    fn name(&self) -> &str {
        "covariance"
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

    fn finalize(&self, merged: CovariancePartial) -> AggResult<CovarianceResult> {
        let covariance = covariance_matrix(&merged)?;
        let correlation = correlation_matrix(&covariance);
        Ok(CovarianceResult {
            count: merged.count,
            covariance,
            correlation,
            mean: DVector::from_vec(merged.mean),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Vec<f64>> {
        vec![
            vec![1.0, 2.0, 5.0],
            vec![2.0, 4.0, 3.0],
            vec![3.0, 6.0, 4.0],
            vec![4.0, 8.0, 1.0],
        ]
    }

    #[test]
    fn test_merged_equals_direct() {
        let whole = DataPartition::from_rows(0, rows()).unwrap();
        let a = DataPartition::from_rows(0, rows()[..1].to_vec()).unwrap();
        let b = DataPartition::from_rows(1, rows()[1..].to_vec()).unwrap();

        let direct = Covariance
            .finalize(Covariance.local_compute(&whole).unwrap())
            .unwrap();
        let merged = Covariance
            .merge(
                Covariance.local_compute(&a).unwrap(),
                Covariance.local_compute(&b).unwrap(),
            )
            .unwrap();
        let merged = Covariance.finalize(merged).unwrap();

        assert!((direct.covariance.clone() - merged.covariance.clone()).amax() < 1e-12);
        // x and 2x: variance 5/3 and 20/3, covariance 10/3
        assert!((merged.covariance[(0, 0)] - 5.0 / 3.0).abs() < 1e-12);
        assert!((merged.covariance[(0, 1)] - 10.0 / 3.0).abs() < 1e-12);
        assert!((merged.correlation[(0, 1)] - 1.0).abs() < 1e-12);
        assert_eq!(merged.mean[1], 5.0);
    }

    #[test]
    fn test_result_ids_are_distinct() {
        let partition = DataPartition::from_rows(0, rows()).unwrap();
        let result = Covariance
            .finalize(Covariance.local_compute(&partition).unwrap())
            .unwrap();

        assert_eq!(u8::from(ResultId::Covariance), 0);
        assert_eq!(u8::from(ResultId::Correlation), 1);
        assert_eq!(result.get_by_value(1).unwrap(), result.correlation);
        assert_eq!(result.get_by_value(0).unwrap(), result.covariance);
        assert_eq!(result.get(ResultId::Mean).ncols(), 3);
        assert!(matches!(
            result.get_by_value(9),
            Err(AggregationError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_single_row_is_numerical_error() {
        let partition = DataPartition::from_rows(0, vec![vec![1.0, 2.0]]).unwrap();
        let err = Covariance
            .finalize(Covariance.local_compute(&partition).unwrap())
            .unwrap_err();
        assert!(matches!(err, AggregationError::Numerical(_)));
    }

    #[test]
    fn test_merge_rejects_different_widths() {
        let wide = DataPartition::from_rows(0, rows()).unwrap();
        let narrow = DataPartition::from_rows(1, vec![vec![1.0, 2.0], vec![3.0, 5.0]]).unwrap();
        let err = Covariance
            .merge(
                Covariance.local_compute(&wide).unwrap(),
                Covariance.local_compute(&narrow).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            AggregationError::DimensionMismatch {
                left_features: 3,
                right_features: 2,
                ..
            }
        ));
    }
}
