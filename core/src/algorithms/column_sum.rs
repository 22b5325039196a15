//! Column sums and row count.

use serde::{Deserialize, Serialize};

use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::traits::{Aggregation, PartialResult};

/// Sums every column and counts rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnSum;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSumPartial {
    pub count: u64,
    pub sums: Vec<f64>,
}

impl PartialResult for ColumnSumPartial {
    fn row_count(&self) -> u64 {
        self.count
    }

    fn num_features(&self) -> usize {
        self.sums.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnTotals {
    pub count: u64,
    pub column_sums: Vec<f64>,
}

impl Aggregation for ColumnSum {
    type Partial = ColumnSumPartial;
    type Output = ColumnTotals;

    fn name(&self) -> &str {
        "column_sum"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<ColumnSumPartial> {
        partition.ensure_non_empty()?;
        let mut sums = vec![0.0; partition.num_cols()];
        partition.for_each_row(|_, row| {
            for (sum, value) in sums.iter_mut().zip(row) {
                *sum += value;
            }
        });
        Ok(ColumnSumPartial {
            count: partition.num_rows() as u64,
            sums,
        })
    }

    fn merge(
        &self,
        left: ColumnSumPartial,
        right: ColumnSumPartial,
    ) -> AggResult<ColumnSumPartial> {
        if left.sums.len() != right.sums.len() {
            return Err(AggregationError::feature_mismatch(
                left.sums.len(),
                right.sums.len(),
            ));
        }
        let mut sums = left.sums;
        for (sum, value) in sums.iter_mut().zip(&right.sums) {
            *sum += value;
        }
        Ok(ColumnSumPartial {
            count: left.count + right.count,
            sums,
        })
    }

    fn finalize(&self, merged: ColumnSumPartial) -> AggResult<ColumnTotals> {
        Ok(ColumnTotals {
            count: merged.count,
            column_sums: merged.sums,
        })
    }
}
