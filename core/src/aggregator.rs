//! Distributed aggregation
//!
//! [`DistributedAggregator`] drives one pass of the protocol over a set of
//! partitions: local compute on every partition in parallel, a merge phase
//! shaped by [`ReduceStrategy`], and a single finalize on the merged partial.
//!
//! The phases are exposed separately ([`DistributedAggregator::local_phase`],
//! [`DistributedAggregator::merge_phase`]) so that the refinement driver can
//! observe each one; [`DistributedAggregator::run`] chains all three.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sumstat_common::{AggregationConfig, ReduceStrategy, TransportMode};
use tracing::{debug, info};

use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::scheduler::LocalScheduler;
use crate::traits::{Aggregation, PartialResult};

/// A partial result together with the partitions folded into it.
#[derive(Debug, Clone)]
pub struct TaggedPartial<P> {
    partitions: Vec<usize>,
    partial: P,
}

impl<P: PartialResult> TaggedPartial<P> {
    pub fn new(partition: usize, partial: P) -> Self {
        Self {
            partitions: vec![partition],
            partial,
        }
    }

    /// Indices of the partitions merged into this partial, ascending.
    pub fn partitions(&self) -> &[usize] {
        &self.partitions
    }

    pub fn partial(&self) -> &P {
        &self.partial
    }

    pub fn into_partial(self) -> P {
        self.partial
    }
}

/// Output of the local phase: one partial per partition, in input order.
#[derive(Debug, Clone)]
pub struct PartialSet<P> {
    partials: Vec<TaggedPartial<P>>,
    transferred_bytes: usize,
}

impl<P: PartialResult> PartialSet<P> {
    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    pub fn partials(&self) -> &[TaggedPartial<P>] {
        &self.partials
    }

    /// Sum of the row counts of all partials.
    pub fn total_rows(&self) -> u64 {
        self.partials.iter().map(|p| p.partial.row_count()).sum()
    }

    /// Encoded bytes moved to the merge side; zero for in-process transport.
    pub fn transferred_bytes(&self) -> usize {
        self.transferred_bytes
    }
}

/// Statistics of one aggregation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub partitions: usize,
    pub total_rows: u64,
    pub merge_calls: usize,
    /// Length of the longest chain of dependent merges
    pub merge_depth: usize,
    pub strategy: ReduceStrategy,
    pub transferred_bytes: usize,
    pub elapsed_micros: u64,
}

/// Outcome of the merge phase.
#[derive(Debug, Clone)]
pub struct MergeOutcome<P> {
    pub merged: TaggedPartial<P>,
    pub merge_calls: usize,
    pub merge_depth: usize,
}

enum Shipped<P> {
    Value(P),
    Encoded(Vec<u8>),
}

/// Runs partial-result aggregations over partitions.
#[derive(Debug, Clone)]
pub struct DistributedAggregator {
    config: AggregationConfig,
    scheduler: Arc<LocalScheduler>,
}

impl DistributedAggregator {
    /// Create an aggregator with its own worker pool.
    pub fn new(config: AggregationConfig) -> AggResult<Self> {
        if config.parallelism == 0 {
            return Err(AggregationError::invalid_parameter(
                "parallelism must be at least 1",
            ));
        }
        let scheduler = LocalScheduler::new(config.parallelism, &config.thread_name_prefix)?;
        Ok(Self::with_scheduler(config, Arc::new(scheduler)))
    }

    /// Create an aggregator sharing an existing worker pool.
    pub fn with_scheduler(config: AggregationConfig, scheduler: Arc<LocalScheduler>) -> Self {
        Self { config, scheduler }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<LocalScheduler> {
        &self.scheduler
    }

    /// Copy of this aggregator using a different merge strategy.
    pub fn with_strategy(&self, strategy: ReduceStrategy) -> Self {
        let mut config = self.config.clone();
        config.reduce_strategy = strategy;
        Self::with_scheduler(config, self.scheduler.clone())
    }

    /// Copy of this aggregator using a different partial-result transport.
    pub fn with_transport(&self, transport: TransportMode) -> Self {
        let mut config = self.config.clone();
        config.transport = transport;
        Self::with_scheduler(config, self.scheduler.clone())
    }

    /// Run local compute, merge and finalize and return the final result.
    pub fn run<A: Aggregation>(
        &self,
        algorithm: &A,
        partitions: &[DataPartition],
    ) -> AggResult<A::Output> {
        self.run_with_report(algorithm, partitions)
            .map(|(output, _)| output)
    }

    /// Like [`run`](Self::run), also returning pass statistics.
    pub fn run_with_report<A: Aggregation>(
        &self,
        algorithm: &A,
        partitions: &[DataPartition],
    ) -> AggResult<(A::Output, AggregationReport)> {
        let (merged, report) = self.merge_all(algorithm, partitions)?;
        let output = algorithm.finalize(merged)?;
        info!(
            algorithm = algorithm.name(),
            partitions = report.partitions,
            rows = report.total_rows,
            merge_calls = report.merge_calls,
            merge_depth = report.merge_depth,
            elapsed_us = report.elapsed_micros,
            "aggregation finished"
        );
        Ok((output, report))
    }

    /// Run local compute and merge, stopping before finalize.
    pub fn merge_all<A: Aggregation>(
        &self,
        algorithm: &A,
        partitions: &[DataPartition],
    ) -> AggResult<(A::Partial, AggregationReport)> {
        let started = Instant::now();
        let set = self.local_phase(algorithm, partitions)?;
        let total_rows = set.total_rows();
        let transferred_bytes = set.transferred_bytes();
        let outcome = self.merge_phase(algorithm, set)?;

        let report = AggregationReport {
            partitions: partitions.len(),
            total_rows,
            merge_calls: outcome.merge_calls,
            merge_depth: outcome.merge_depth,
            strategy: self.config.reduce_strategy,
            transferred_bytes,
            elapsed_micros: started.elapsed().as_micros() as u64,
        };
        Ok((outcome.merged.into_partial(), report))
    }

    /// Compute one partial per partition in parallel.
    ///
    /// Fails with `EmptyInput` when there are no partitions. When several
    /// partitions fail, the error of the first one in input order is returned.
    pub fn local_phase<A: Aggregation>(
        &self,
        algorithm: &A,
        partitions: &[DataPartition],
    ) -> AggResult<PartialSet<A::Partial>> {
        if partitions.is_empty() {
            return Err(AggregationError::EmptyInput);
        }
        debug!(
            algorithm = algorithm.name(),
            partitions = partitions.len(),
            "local phase started"
        );

        let codec = self.config.transport.codec()?;
        let shipped = self
            .scheduler
            .execute_all(partitions.iter().collect::<Vec<_>>(), |partition: &DataPartition| {
                let partial = algorithm.local_compute(partition)?;
                let shipped = match &codec {
                    Some(codec) => Shipped::Encoded(codec.encode(&partial)?),
                    None => Shipped::Value(partial),
                };
                Ok((partition.index(), shipped))
            })?;

        let mut transferred_bytes = 0;
        let partials = shipped
            .into_iter()
            .map(|(index, shipped)| {
                let partial = match shipped {
                    Shipped::Value(partial) => partial,
                    Shipped::Encoded(frame) => {
                        transferred_bytes += frame.len();
                        sumstat_common::decode_frame(&frame)?
                    }
                };
                Ok(TaggedPartial::new(index, partial))
            })
            .collect::<AggResult<Vec<_>>>()?;

        Ok(PartialSet {
            partials,
            transferred_bytes,
        })
    }

    /// Merge all partials into one, following the configured strategy.
    ///
    /// With a single partial no merge is performed.
    pub fn merge_phase<A: Aggregation>(
        &self,
        algorithm: &A,
        set: PartialSet<A::Partial>,
    ) -> AggResult<MergeOutcome<A::Partial>> {
        let calls = AtomicUsize::new(0);
        let mut level = set.partials;
        if level.is_empty() {
            return Err(AggregationError::EmptyInput);
        }

        let mut depth = 0;
        match self.config.reduce_strategy {
            ReduceStrategy::Linear => {
                let mut rest = level.into_iter();
                let mut acc = rest.next().ok_or(AggregationError::EmptyInput)?;
                for next in rest {
                    acc = checked_merge(algorithm, acc, next, &calls)?;
                    depth += 1;
                }
                level = vec![acc];
            }
            ReduceStrategy::Tree => {
                while level.len() > 1 {
                    let mut pairs = Vec::with_capacity(level.len() / 2 + 1);
                    let mut items = level.into_iter();
                    while let Some(left) = items.next() {
                        pairs.push((left, items.next()));
                    }
                    level = self.scheduler.execute_all(pairs, |(left, right)| match right {
                        Some(right) => checked_merge(algorithm, left, right, &calls),
                        None => Ok(left),
                    })?;
                    depth += 1;
                    debug!(
                        algorithm = algorithm.name(),
                        depth,
                        remaining = level.len(),
                        "merge level done"
                    );
                }
            }
        }

        let merged = level.pop().ok_or(AggregationError::EmptyInput)?;
        Ok(MergeOutcome {
            merged,
            merge_calls: calls.load(Ordering::SeqCst),
            merge_depth: depth,
        })
    }
}

fn checked_merge<A: Aggregation>(
    algorithm: &A,
    left: TaggedPartial<A::Partial>,
    right: TaggedPartial<A::Partial>,
    calls: &AtomicUsize,
) -> AggResult<TaggedPartial<A::Partial>> {
    let left_features = left.partial.num_features();
    let right_features = right.partial.num_features();
    if left_features != right_features {
        return Err(AggregationError::DimensionMismatch {
            left: left.partitions,
            right: right.partitions,
            left_features,
            right_features,
        });
    }

    calls.fetch_add(1, Ordering::SeqCst);
    let partial = algorithm.merge(left.partial, right.partial)?;
    let mut partitions = left.partitions;
    partitions.extend(right.partitions);
    partitions.sort_unstable();
    Ok(TaggedPartial {
        partitions,
        partial,
    })
}
