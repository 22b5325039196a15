//! K-means driven round by round
//!
//! Seeds with k-means|| and iterates until the centroids stop moving,
//! running the driver on the blocking pool from async code. A second run
//! is cancelled from a timer task to show the latest-artifact behaviour.

use std::time::Duration;

use sumstat_core::algorithms::{InitStrategy, KMeans};
use sumstat_core::{ComputeContext, RefinementConfig, SumstatConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn blobs() -> Vec<Vec<f64>> {
    let centers = [[0.0, 0.0], [10.0, 10.0], [0.0, 10.0]];
    (0..300)
        .map(|i| {
            let c = centers[i % 3];
            let jitter = ((i * 7919) % 100) as f64 / 50.0 - 1.0;
            let wobble = ((i * 104729) % 100) as f64 / 50.0 - 1.0;
            vec![c[0] + jitter, c[1] + wobble]
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = SumstatConfig {
        refinement: RefinementConfig::until_converged(50, 1e-6),
        ..SumstatConfig::default()
    };
    let ctx = ComputeContext::new("kmeans-rounds", config)?;
    let partitions = ctx.partition_rows(blobs(), 6)?;

    let kmeans = KMeans::new(3)
        .with_init(InitStrategy::parallel_for(3))
        .with_seed(42);
    let outcome = ctx.driver().spawn(kmeans.clone(), partitions.clone()).await??;
    info!(
        rounds = outcome.rounds_completed,
        termination = ?outcome.termination,
        "first run finished"
    );
    for (i, centroid) in outcome.artifact.rows().iter().enumerate() {
        println!("centroid {}: {:?}", i, centroid);
    }
    println!("objective: {:?}", outcome.artifact.objective);

    let driver = ctx.driver();
    let token = driver.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        token.cancel();
    });
    let cancelled = driver.spawn(kmeans, partitions).await??;
    println!(
        "second run: {:?} after {} rounds",
        cancelled.termination, cancelled.rounds_completed
    );
    Ok(())
}
