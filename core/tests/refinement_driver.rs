//! Iterative refinement driver tests using k-means as the refinement.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use sumstat_core::algorithms::{Centroids, InitStrategy, KMeans, KMeansRound};
use sumstat_core::{
    AggResult, AggregationError, Broadcast, ComputeContext, DataPartition, DistributedAggregator,
    DriverState, IterativeRefinementDriver, ReduceStrategy, Refinement, RefinementConfig,
    SumstatConfig, Termination,
};
use tokio_util::sync::CancellationToken;

fn driver(config: RefinementConfig) -> IterativeRefinementDriver {
    IterativeRefinementDriver::new(create_shared_aggregator(ReduceStrategy::Tree), config)
}

#[test]
fn test_two_round_kmeans_is_partition_count_independent() {
    for init in [InitStrategy::FirstRows, InitStrategy::Random] {
        let kmeans = KMeans::new(2).with_init(init).with_seed(11);
        let outcomes: Vec<_> = [1, 2, 4]
            .into_iter()
            .map(|n| {
                driver(RefinementConfig::fixed_rounds(2))
                    .run(&kmeans, &partition(create_two_cluster_rows(), n))
                    .unwrap()
            })
            .collect();

        for outcome in &outcomes {
            assert_eq!(outcome.rounds_completed, 2);
            assert_eq!(outcome.termination, Termination::FixedRounds);
            assert_eq!(outcome.artifact, outcomes[0].artifact, "{:?}", init);
            assert_eq!(outcome.shifts, outcomes[0].shifts);
        }
    }
}

#[test]
fn test_first_rows_kmeans_trajectory() {
    // Seeds (1, 1) and (1.5, 2): the first round pulls seven rows into the
    // second cluster, the second round separates the two groups.
    let outcome = driver(RefinementConfig::fixed_rounds(2))
        .run(&KMeans::new(2), &partition(create_two_cluster_rows(), 2))
        .unwrap();

    let centroids = outcome.artifact.rows();
    assert_close(&centroids[0], &[1.875, 2.125], 1e-12);
    assert_close(&centroids[1], &[9.25, 9.25], 1e-12);
    assert!(outcome.artifact.objective.is_some());
}

#[test]
fn test_converges_before_budget() {
    let mut driver = driver(RefinementConfig::until_converged(50, 1e-9));
    let outcome = driver
        .run(&KMeans::new(2), &partition(create_two_cluster_rows(), 4))
        .unwrap();

    assert_eq!(outcome.termination, Termination::Converged);
    assert!(outcome.rounds_completed < 50);
    assert!(outcome.last_shift().unwrap() <= 1e-9);
    assert_eq!(driver.state(), DriverState::Converged);

    let assignments = outcome
        .artifact
        .assign(&partition(create_two_cluster_rows(), 1)[0])
        .unwrap();
    assert_eq!(assignments, vec![0, 0, 1, 0, 1, 1, 0, 1]);
}

#[test]
fn test_budget_exhaustion_is_a_convergence_failure() {
    let mut driver = driver(RefinementConfig::until_converged(1, 0.0));
    let outcome = driver
        .run(&KMeans::new(2), &partition(create_two_cluster_rows(), 2))
        .unwrap();
    assert_eq!(outcome.termination, Termination::BudgetExhausted);
    assert_eq!(driver.state(), DriverState::BudgetExhausted);

    match outcome.require_converged() {
        Err(AggregationError::ConvergenceFailure {
            rounds, last_shift, ..
        }) => {
            assert_eq!(rounds, 1);
            assert!(last_shift.unwrap() > 0.0);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_seeding_failure_aborts_before_first_round() {
    let mut driver = driver(RefinementConfig::fixed_rounds(3));
    let err = driver
        .run(&KMeans::new(20), &partition(create_two_cluster_rows(), 2))
        .unwrap_err();
    assert!(matches!(err, AggregationError::InvalidParameter(_)));
    assert_eq!(driver.state(), DriverState::Failed);
}

#[test]
fn test_mixed_dimensions_abort_the_run() {
    let partitions = vec![
        DataPartition::from_rows(0, vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap(),
        DataPartition::from_rows(1, vec![vec![1.0, 2.0, 3.0]]).unwrap(),
    ];
    let mut driver = driver(RefinementConfig::fixed_rounds(3));
    let err = driver.run(&KMeans::new(1), &partitions).unwrap_err();
    assert!(matches!(err, AggregationError::DimensionMismatch { .. }));
    assert_eq!(driver.state(), DriverState::Failed);
}

/// K-means that cancels its own run once `after` rounds have finished.
#[derive(Debug)]
struct CancelAfter {
    inner: KMeans,
    after: usize,
    rounds: AtomicUsize,
    token: CancellationToken,
}

impl Refinement for CancelAfter {
    type Artifact = Centroids;
    type Round = KMeansRound;

    fn name(&self) -> &str {
        "cancel-after"
    }

    fn seed(
        &self,
        aggregator: &DistributedAggregator,
        partitions: &[DataPartition],
    ) -> AggResult<Centroids> {
        self.inner.seed(aggregator, partitions)
    }

    fn round(&self, artifact: Broadcast<Centroids>) -> KMeansRound {
        self.inner.round(artifact)
    }

    fn shift(&self, previous: &Centroids, next: &Centroids) -> f64 {
        if self.rounds.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        self.inner.shift(previous, next)
    }
}

#[test]
fn test_cancellation_between_rounds_keeps_latest_artifact() {
    let token = CancellationToken::new();
    let mut driver = driver(RefinementConfig::fixed_rounds(10)).with_cancellation(token.clone());
    let refinement = CancelAfter {
        inner: KMeans::new(2),
        after: 2,
        rounds: AtomicUsize::new(0),
        token,
    };
    let partitions = partition(create_two_cluster_rows(), 2);
    let outcome = driver.run(&refinement, &partitions).unwrap();

    assert_eq!(outcome.termination, Termination::Cancelled);
    assert_eq!(outcome.rounds_completed, 2);
    assert_eq!(driver.state(), DriverState::Cancelled);

    let two_rounds = self::driver(RefinementConfig::fixed_rounds(2))
        .run(&KMeans::new(2), &partitions)
        .unwrap();
    assert_eq!(outcome.artifact, two_rounds.artifact);
    assert!(matches!(
        outcome.require_converged(),
        Err(AggregationError::ConvergenceFailure { rounds: 2, .. })
    ));
}

#[tokio::test]
async fn test_spawned_run_cancelled_from_async_code() {
    let driver = driver(RefinementConfig::fixed_rounds(5));
    let token = driver.cancellation_token();
    token.cancel();

    let outcome = driver
        .spawn(KMeans::new(2), partition(create_two_cluster_rows(), 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.termination, Termination::Cancelled);
    assert_eq!(outcome.rounds_completed, 0);
    assert_eq!(outcome.artifact.rows(), vec![vec![1.0, 1.0], vec![1.5, 2.0]]);
}

#[tokio::test]
async fn test_spawned_run_completes() {
    let driver = driver(RefinementConfig::until_converged(20, 1e-9));
    let outcome = driver
        .spawn(
            KMeans::new(2).with_init(InitStrategy::KMeansPlusPlus).with_seed(3),
            partition(create_two_cluster_rows(), 4),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.termination, Termination::Converged);
}

#[test]
fn test_context_uses_configured_refinement() {
    let config = SumstatConfig::from_json_str(
        r#"{
            "aggregation": { "parallelism": 2, "reduce_strategy": "linear" },
            "refinement": { "max_rounds": 3 }
        }"#,
    )
    .unwrap();
    let ctx = ComputeContext::new("kmeans-test", config).unwrap();
    let partitions = ctx.partition_rows(create_two_cluster_rows(), 4).unwrap();
    let outcome = ctx.refine(&KMeans::new(2), &partitions).unwrap();

    assert_eq!(outcome.rounds_completed, 3);
    assert_eq!(outcome.termination, Termination::FixedRounds);
    assert_eq!(ctx.aggregator().config().reduce_strategy, ReduceStrategy::Linear);
}

#[test]
fn test_shared_aggregator_runs_sequential_drivers() {
    let aggregator: Arc<DistributedAggregator> = create_shared_aggregator(ReduceStrategy::Linear);
    let partitions = partition(create_two_cluster_rows(), 4);
    let first =
        IterativeRefinementDriver::new(aggregator.clone(), RefinementConfig::fixed_rounds(3))
            .run(&KMeans::new(2), &partitions)
            .unwrap();
    let second = IterativeRefinementDriver::new(aggregator, RefinementConfig::fixed_rounds(3))
        .run(&KMeans::new(2), &partitions)
        .unwrap();
    assert_eq!(first.artifact, second.artifact);
}
