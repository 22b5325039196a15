//! Column statistics over in-memory partitions
//!
//! Runs column sums, low order moments and covariance over the same four
//! partitions, once merged as a tree and once serialized with zstd framing.
//!
//! Run with `RUST_LOG=sumstat_core=debug` to see the per-pass logs.

use sumstat_core::algorithms::{ColumnSum, Covariance, LowOrderMoments, ResultId};
use sumstat_core::{
    CompressionAlgorithm, ComputeContext, ReduceStrategy, SumstatConfig, TransportMode,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== sumstat: column statistics ===\n");

    let config = SumstatConfig::default().with_env_overrides()?;
    let ctx = ComputeContext::new("column-stats", config)?;
    let rows: Vec<Vec<f64>> = (0..8)
        .map(|r| (1..=3).map(|c| (r * 3 + c) as f64).collect())
        .collect();
    let partitions = ctx.partition_rows(rows, 4)?;
    println!("Created {} partitions", partitions.len());

    let (totals, report) = ctx
        .aggregator()
        .run_with_report(&ColumnSum, &partitions)?;
    println!("\n1. Column sums:");
    println!("   count = {}, sums = {:?}", totals.count, totals.column_sums);
    println!(
        "   {} merges, depth {}, {:?} strategy",
        report.merge_calls, report.merge_depth, report.strategy
    );

    let linear = ctx.aggregator().with_strategy(ReduceStrategy::Linear);
    let (_, report) = linear.run_with_report(&ColumnSum, &partitions)?;
    println!("   linear fold depth {}", report.merge_depth);

    println!("\n2. Low order moments:");
    let moments = ctx.aggregate(&LowOrderMoments, &partitions)?;
    println!("   mean     = {:?}", moments.mean);
    println!("   variance = {:?}", moments.variance);
    println!("   min/max  = {:?} / {:?}", moments.minimum, moments.maximum);

    println!("\n3. Covariance with zstd framed partials:");
    let serialized = ctx.aggregator().with_transport(TransportMode::Serialized {
        compression: Some(CompressionAlgorithm::Zstd),
        level: Some(9),
    });
    let (result, report) = serialized.run_with_report(&Covariance, &partitions)?;
    println!("   covariance:{}", result.get(ResultId::Covariance));
    println!("   correlation:{}", result.get(ResultId::Correlation));
    println!("   {} bytes on the wire", report.transferred_bytes);

    println!("\n=== done ===");
    Ok(())
}
