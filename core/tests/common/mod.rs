//! Common test utilities and helpers for integration tests

use std::sync::Arc;

use sumstat_core::{
    AggregationConfig, DataPartition, DistributedAggregator, ReduceStrategy, split_rows,
};

/// Create an aggregator with a small pool and the given merge strategy
pub fn create_test_aggregator(strategy: ReduceStrategy) -> DistributedAggregator {
    DistributedAggregator::new(AggregationConfig {
        parallelism: 3,
        reduce_strategy: strategy,
        thread_name_prefix: "sumstat-test".to_string(),
        ..Default::default()
    })
    .expect("thread pool")
}

#[allow(dead_code)]
pub fn create_shared_aggregator(strategy: ReduceStrategy) -> Arc<DistributedAggregator> {
    Arc::new(create_test_aggregator(strategy))
}

/// Four partitions of two rows by three columns holding 1..=24
#[allow(dead_code)]
pub fn create_four_partitions() -> Vec<DataPartition> {
    (0..4)
        .map(|p| {
            let start = (p * 6) as f64;
            DataPartition::from_rows(
                p,
                vec![
                    vec![start + 1.0, start + 2.0, start + 3.0],
                    vec![start + 4.0, start + 5.0, start + 6.0],
                ],
            )
            .expect("valid rows")
        })
        .collect()
}

/// Eight rows in two well separated groups
#[allow(dead_code)]
pub fn create_two_cluster_rows() -> Vec<Vec<f64>> {
    vec![
        vec![1.0, 1.0],
        vec![1.5, 2.0],
        vec![9.0, 8.0],
        vec![3.0, 4.0],
        vec![8.5, 9.5],
        vec![10.0, 9.0],
        vec![2.0, 1.5],
        vec![9.5, 10.5],
    ]
}

/// A skewed dataset with a few large outliers
#[allow(dead_code)]
pub fn create_mixed_rows() -> Vec<Vec<f64>> {
    (0..30)
        .map(|i| {
            let x = i as f64;
            vec![x * 0.5, (x * 1.3).sin() * 10.0, if i % 7 == 0 { 1000.0 + x } else { x * x }]
        })
        .collect()
}

#[allow(dead_code)]
pub fn partition(rows: Vec<Vec<f64>>, n: usize) -> Vec<DataPartition> {
    split_rows(rows, n).expect("split")
}

#[allow(dead_code)]
pub fn assert_close(a: &[f64], b: &[f64], tolerance: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch: {:?} vs {:?}", a, b);
    for (x, y) in a.iter().zip(b) {
        assert!(
            (x - y).abs() <= tolerance * (1.0 + x.abs().max(y.abs())),
            "{:?} differs from {:?}",
            a,
            b
        );
    }
}
