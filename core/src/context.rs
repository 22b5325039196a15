//! ComputeContext - entry point for running aggregations
//!
//! Owns the configuration and the worker pool shared by every aggregation
//! and refinement run started from it. Dropping the context releases the
//! pool once the last aggregator built from it is gone.

use std::sync::Arc;

use sumstat_common::SumstatConfig;
use tracing::{debug, info};

use crate::aggregator::DistributedAggregator;
use crate::driver::{IterativeRefinementDriver, RefinementOutcome};
use crate::error::AggResult;
use crate::partition::{self, DataPartition};
use crate::scheduler::LocalScheduler;
use crate::traits::{Aggregation, Refinement};

/// ComputeContext manages aggregation runs over in-memory partitions
#[derive(Debug)]
pub struct ComputeContext {
    app_name: String,
    config: SumstatConfig,
    aggregator: Arc<DistributedAggregator>,
}

impl ComputeContext {
    /// Create a new ComputeContext with the given application name and configuration
    pub fn new(app_name: impl Into<String>, config: SumstatConfig) -> AggResult<Self> {
        config.validate()?;
        let app_name = app_name.into();
        let scheduler = Arc::new(LocalScheduler::new(
            config.aggregation.parallelism,
            &config.aggregation.thread_name_prefix,
        )?);
        let aggregator = Arc::new(DistributedAggregator::with_scheduler(
            config.aggregation.clone(),
            scheduler,
        ));
        info!(
            app = %app_name,
            parallelism = config.aggregation.parallelism,
            strategy = ?config.aggregation.reduce_strategy,
            "compute context started"
        );
        Ok(Self {
            app_name,
            config,
            aggregator,
        })
    }

    /// Create a context from defaults overridden by `SUMSTAT_*` environment variables
    pub fn from_env(app_name: impl Into<String>) -> AggResult<Self> {
        let config = SumstatConfig::default().with_env_overrides()?;
        Self::new(app_name, config)
    }

    /// Get the application name
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn config(&self) -> &SumstatConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &Arc<DistributedAggregator> {
        &self.aggregator
    }

    /// Split rows into `num_partitions` balanced, contiguous partitions
    pub fn partition_rows(
        &self,
        rows: Vec<Vec<f64>>,
        num_partitions: usize,
    ) -> AggResult<Vec<DataPartition>> {
        partition::split_rows(rows, num_partitions)
    }

    /// Run one aggregation pass
    pub fn aggregate<A: Aggregation>(
        &self,
        algorithm: &A,
        partitions: &[DataPartition],
    ) -> AggResult<A::Output> {
        self.aggregator.run(algorithm, partitions)
    }

    /// A refinement driver using this context's aggregator and refinement settings
    pub fn driver(&self) -> IterativeRefinementDriver {
        IterativeRefinementDriver::new(self.aggregator.clone(), self.config.refinement.clone())
    }

    /// Run a refinement to completion with this context's settings
    pub fn refine<R: Refinement>(
        &self,
        refinement: &R,
        partitions: &[DataPartition],
    ) -> AggResult<RefinementOutcome<R::Artifact>> {
        self.driver().run(refinement, partitions)
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        debug!(app = %self.app_name, "compute context closed");
    }
}
