//! Properties every aggregation pass must satisfy, independent of the algorithm.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use sumstat_core::algorithms::{ColumnSum, Covariance, LowOrderMoments, MomentsPartial};
use sumstat_core::{
    Aggregation, AggregationError, CompressionAlgorithm, DataPartition, FnAggregation,
    PartialResult, ReduceStrategy, TransportMode,
};

#[test]
fn test_four_partition_column_sum_for_every_strategy() {
    for strategy in [ReduceStrategy::Tree, ReduceStrategy::Linear] {
        let aggregator = create_test_aggregator(strategy);
        let (totals, report) = aggregator
            .run_with_report(&ColumnSum, &create_four_partitions())
            .unwrap();

        assert_eq!(totals.count, 8);
        assert_eq!(totals.column_sums, vec![92.0, 100.0, 108.0]);
        assert_eq!(report.merge_calls, 3);
        assert_eq!(report.total_rows, 8);
        assert_eq!(report.strategy, strategy);
    }

    let tree = create_test_aggregator(ReduceStrategy::Tree)
        .run_with_report(&ColumnSum, &create_four_partitions())
        .unwrap()
        .1;
    let linear = create_test_aggregator(ReduceStrategy::Linear)
        .run_with_report(&ColumnSum, &create_four_partitions())
        .unwrap()
        .1;
    assert_eq!(tree.merge_depth, 2);
    assert_eq!(linear.merge_depth, 3);
}

#[test]
fn test_column_sum_ignores_partition_order_and_grouping() {
    let aggregator = create_test_aggregator(ReduceStrategy::Tree);
    let mut partitions = create_four_partitions();
    partitions.reverse();
    let reversed = aggregator.run(&ColumnSum, &partitions).unwrap();
    assert_eq!(reversed.column_sums, vec![92.0, 100.0, 108.0]);

    // Hand-built uneven tree: ((p0 + (p1 + p2)) + p3)
    let p = create_four_partitions();
    let local: Vec<_> = p.iter().map(|x| ColumnSum.local_compute(x).unwrap()).collect();
    let inner = ColumnSum.merge(local[1].clone(), local[2].clone()).unwrap();
    let left = ColumnSum.merge(local[0].clone(), inner).unwrap();
    let all = ColumnSum.merge(left, local[3].clone()).unwrap();
    let totals = ColumnSum.finalize(all).unwrap();
    assert_eq!(totals.count, 8);
    assert_eq!(totals.column_sums, vec![92.0, 100.0, 108.0]);
}

#[test]
fn test_moments_merge_is_associative() {
    let partitions = partition(create_mixed_rows(), 3);
    let local: Vec<MomentsPartial> = partitions
        .iter()
        .map(|p| LowOrderMoments.local_compute(p).unwrap())
        .collect();

    let left_first = LowOrderMoments
        .merge(
            LowOrderMoments
                .merge(local[0].clone(), local[1].clone())
                .unwrap(),
            local[2].clone(),
        )
        .unwrap();
    let right_first = LowOrderMoments
        .merge(
            local[0].clone(),
            LowOrderMoments
                .merge(local[1].clone(), local[2].clone())
                .unwrap(),
        )
        .unwrap();
    let single = LowOrderMoments
        .local_compute(&partition(create_mixed_rows(), 1)[0])
        .unwrap();

    assert_eq!(left_first.count, right_first.count);
    assert_close(&left_first.mean, &right_first.mean, 1e-12);
    assert_close(&left_first.m2, &right_first.m2, 1e-12);
    assert_close(&left_first.m2, &single.m2, 1e-12);
    assert_eq!(left_first.min, single.min);
    assert_eq!(left_first.max, single.max);
}

#[test]
fn test_row_counts_add_under_merge() {
    let partitions = partition(create_mixed_rows(), 4);
    let local: Vec<_> = partitions
        .iter()
        .map(|p| Covariance.local_compute(p).unwrap())
        .collect();
    let expected: u64 = local.iter().map(PartialResult::row_count).sum();

    let merged = local
        .into_iter()
        .reduce(|a, b| Covariance.merge(a, b).unwrap())
        .unwrap();
    assert_eq!(merged.row_count(), expected);
    assert_eq!(expected, 30);
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Rows(u64, usize);

impl PartialResult for Rows {
    fn row_count(&self) -> u64 {
        self.0
    }

    fn num_features(&self) -> usize {
        self.1
    }
}

fn counting(merges: Arc<AtomicUsize>, finalizes: Arc<AtomicUsize>) -> FnAggregation<Rows, u64> {
    FnAggregation::new(
        "counting",
        |p: &DataPartition| Ok(Rows(p.num_rows() as u64, p.num_cols())),
        move |a: Rows, b: Rows| {
            merges.fetch_add(1, Ordering::SeqCst);
            Ok(Rows(a.0 + b.0, a.1))
        },
        move |r: Rows| {
            finalizes.fetch_add(1, Ordering::SeqCst);
            Ok(r.0)
        },
    )
}

#[test]
fn test_single_partition_identity() {
    let merges = Arc::new(AtomicUsize::new(0));
    let finalizes = Arc::new(AtomicUsize::new(0));
    let aggregation = counting(merges.clone(), finalizes.clone());
    let partitions = &create_four_partitions()[..1];

    let rows = create_test_aggregator(ReduceStrategy::Tree)
        .run(&aggregation, partitions)
        .unwrap();
    assert_eq!(rows, 2);
    assert_eq!(merges.load(Ordering::SeqCst), 0);
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);

    let direct = ColumnSum
        .finalize(ColumnSum.local_compute(&partitions[0]).unwrap())
        .unwrap();
    let aggregated = create_test_aggregator(ReduceStrategy::Linear)
        .run(&ColumnSum, partitions)
        .unwrap();
    assert_eq!(direct, aggregated);
}

#[test]
fn test_empty_input_never_finalizes() {
    let merges = Arc::new(AtomicUsize::new(0));
    let finalizes = Arc::new(AtomicUsize::new(0));
    let aggregation = counting(merges, finalizes.clone());

    let err = create_test_aggregator(ReduceStrategy::Tree)
        .run(&aggregation, &[])
        .unwrap_err();
    assert!(matches!(err, AggregationError::EmptyInput));
    assert_eq!(finalizes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_dimension_mismatch_produces_no_result() {
    let finalizes = Arc::new(AtomicUsize::new(0));
    let aggregation = counting(Arc::new(AtomicUsize::new(0)), finalizes.clone());
    let mut partitions = create_four_partitions();
    partitions[1] = DataPartition::from_rows(1, vec![vec![1.0, 2.0]]).unwrap();

    for strategy in [ReduceStrategy::Tree, ReduceStrategy::Linear] {
        let err = create_test_aggregator(strategy)
            .run(&aggregation, &partitions)
            .unwrap_err();
        match err {
            AggregationError::DimensionMismatch {
                left,
                right,
                left_features,
                right_features,
            } => {
                assert_eq!(left, vec![0]);
                assert_eq!(right, vec![1]);
                assert_eq!((left_features, right_features), (3, 2));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(finalizes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_malformed_partition_is_reported() {
    let mut partitions = create_four_partitions();
    partitions[2] = DataPartition::from_rows(2, vec![]).unwrap();
    let err = create_test_aggregator(ReduceStrategy::Tree)
        .run(&ColumnSum, &partitions)
        .unwrap_err();
    assert_eq!(err.partition(), Some(2));
}

#[test]
fn test_serialized_transport_matches_in_process() {
    let partitions = partition(create_mixed_rows(), 5);
    let in_process = create_test_aggregator(ReduceStrategy::Tree);
    let expected = in_process.run(&Covariance, &partitions).unwrap();

    for compression in [
        None,
        Some(CompressionAlgorithm::Zstd),
        Some(CompressionAlgorithm::Lz4),
        Some(CompressionAlgorithm::Snappy),
    ] {
        let serialized = in_process.with_transport(TransportMode::Serialized {
            compression,
            level: None,
        });
        let (result, report) = serialized
            .run_with_report(&Covariance, &partitions)
            .unwrap();
        assert_eq!(result, expected);
        assert!(report.transferred_bytes > 0);
    }
}

#[test]
fn test_report_serializes() {
    let (_, report) = create_test_aggregator(ReduceStrategy::Tree)
        .run_with_report(&ColumnSum, &create_four_partitions())
        .unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["partitions"], 4);
    assert_eq!(json["strategy"], "tree");
}
