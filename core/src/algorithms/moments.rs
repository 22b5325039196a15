//! Low-order moments per column.
//!
//! Partials keep the running mean and centered sum of squares per column and
//! are combined with the pairwise update of Chan, Golub and LeVeque, which
//! stays accurate when the partitions have very different means.

use serde::{Deserialize, Serialize};

use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::traits::{Aggregation, PartialResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct LowOrderMoments;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentsPartial {
    pub count: u64,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub sum: Vec<f64>,
    pub sum_squares: Vec<f64>,
    pub mean: Vec<f64>,
    /// Sum of squared deviations from `mean`
    pub m2: Vec<f64>,
}

impl MomentsPartial {
    fn empty(features: usize) -> Self {
        Self {
            count: 0,
            min: vec![f64::INFINITY; features],
            max: vec![f64::NEG_INFINITY; features],
            sum: vec![0.0; features],
            sum_squares: vec![0.0; features],
            mean: vec![0.0; features],
            m2: vec![0.0; features],
        }
    }

    fn push(&mut self, row: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for (j, &x) in row.iter().enumerate() {
            self.min[j] = self.min[j].min(x);
            self.max[j] = self.max[j].max(x);
            self.sum[j] += x;
            self.sum_squares[j] += x * x;
            let delta = x - self.mean[j];
            self.mean[j] += delta / n;
            self.m2[j] += delta * (x - self.mean[j]);
        }
    }
}

impl PartialResult for MomentsPartial {
    fn row_count(&self) -> u64 {
        self.count
    }

    fn num_features(&self) -> usize {
        self.sum.len()
    }
}

/// Per-column results; every vector has one entry per feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub count: u64,
    pub minimum: Vec<f64>,
    pub maximum: Vec<f64>,
    pub sum: Vec<f64>,
    pub sum_squares: Vec<f64>,
    pub sum_squares_centered: Vec<f64>,
    pub mean: Vec<f64>,
    pub second_order_raw_moment: Vec<f64>,
    /// Sample variance (divides by `count - 1`)
    pub variance: Vec<f64>,
    pub standard_deviation: Vec<f64>,
    /// Coefficient of variation, `standard_deviation / mean`
    pub variation: Vec<f64>,
}

impl Aggregation for LowOrderMoments {
    type Partial = MomentsPartial;
    type Output = Moments;

    fn name(&self) -> &str {
        "low_order_moments"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<MomentsPartial> {
        partition.ensure_non_empty()?;
        let mut partial = MomentsPartial::empty(partition.num_cols());
        partition.for_each_row(|_, row| partial.push(row));
        Ok(partial)
    }

    fn merge(&self, left: MomentsPartial, right: MomentsPartial) -> AggResult<MomentsPartial> {
        if left.sum.len() != right.sum.len() {
            return Err(AggregationError::feature_mismatch(
                left.sum.len(),
                right.sum.len(),
            ));
        }
        if left.count == 0 {
            return Ok(right);
        }
        if right.count == 0 {
            return Ok(left);
        }

        let na = left.count as f64;
        let nb = right.count as f64;
        let n = na + nb;
        let mut merged = left;
        for j in 0..merged.sum.len() {
            let delta = right.mean[j] - merged.mean[j];
            merged.min[j] = merged.min[j].min(right.min[j]);
            merged.max[j] = merged.max[j].max(right.max[j]);
            merged.sum[j] += right.sum[j];
            merged.sum_squares[j] += right.sum_squares[j];
            merged.mean[j] += delta * nb / n;
            merged.m2[j] += right.m2[j] + delta * delta * na * nb / n;
        }
        merged.count += right.count;
        Ok(merged)
    }

    fn finalize(&self, merged: MomentsPartial) -> AggResult<Moments> {
        let n = merged.count as f64;
        let second_order_raw_moment = merged.sum_squares.iter().map(|s| s / n).collect();
        let variance: Vec<f64> = merged
            .m2
            .iter()
            .map(|m2| if merged.count > 1 { m2 / (n - 1.0) } else { 0.0 })
            .collect();
        let standard_deviation: Vec<f64> = variance.iter().map(|v| v.sqrt()).collect();
        let variation = standard_deviation
            .iter()
            .zip(&merged.mean)
            .map(|(sd, mean)| sd / mean)
            .collect();

        Ok(Moments {
            count: merged.count,
            minimum: merged.min,
            maximum: merged.max,
            sum: merged.sum,
            sum_squares: merged.sum_squares,
            sum_squares_centered: merged.m2,
            mean: merged.mean,
            second_order_raw_moment,
            variance,
            standard_deviation,
            variation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_chan_merge_matches_single_pass() {
        let rows = vec![vec![1.0], vec![2.0], vec![4.0], vec![7.0], vec![100.0]];
        let whole = DataPartition::from_rows(0, rows.clone()).unwrap();
        let left = DataPartition::from_rows(0, rows[..2].to_vec()).unwrap();
        let right = DataPartition::from_rows(1, rows[2..].to_vec()).unwrap();

        let direct = LowOrderMoments
            .finalize(LowOrderMoments.local_compute(&whole).unwrap())
            .unwrap();
        let merged = LowOrderMoments
            .merge(
                LowOrderMoments.local_compute(&left).unwrap(),
                LowOrderMoments.local_compute(&right).unwrap(),
            )
            .unwrap();
        let merged = LowOrderMoments.finalize(merged).unwrap();

        assert_eq!(merged.count, 5);
        assert_eq!(merged.minimum, vec![1.0]);
        assert_eq!(merged.maximum, vec![100.0]);
        assert!(close(merged.mean[0], 22.8));
        assert!(close(merged.variance[0], direct.variance[0]));
        assert!(close(merged.sum_squares_centered[0], direct.sum_squares_centered[0]));
    }

    #[test]
    fn test_known_values() {
        let rows = vec![vec![2.0, 1.0], vec![4.0, 1.0], vec![6.0, 1.0]];
        let p = DataPartition::from_rows(0, rows).unwrap();
        let m = LowOrderMoments
            .finalize(LowOrderMoments.local_compute(&p).unwrap())
            .unwrap();

        assert_eq!(m.sum, vec![12.0, 3.0]);
        assert_eq!(m.sum_squares, vec![56.0, 3.0]);
        assert!(close(m.mean[0], 4.0));
        assert!(close(m.sum_squares_centered[0], 8.0));
        assert!(close(m.variance[0], 4.0));
        assert!(close(m.standard_deviation[0], 2.0));
        assert!(close(m.variation[0], 0.5));
        assert!(close(m.second_order_raw_moment[0], 56.0 / 3.0));
        assert_eq!(m.variance[1], 0.0);
    }

    #[test]
    fn test_merge_rejects_different_widths() {
        let three = DataPartition::from_rows(0, vec![vec![1.0, 2.0, 3.0]]).unwrap();
        let two = DataPartition::from_rows(1, vec![vec![1.0, 2.0]]).unwrap();
        let err = LowOrderMoments
            .merge(
                LowOrderMoments.local_compute(&three).unwrap(),
                LowOrderMoments.local_compute(&two).unwrap(),
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
