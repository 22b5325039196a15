//! Local Task Scheduler
//!
//! Runs per-partition work and per-level merges on a dedicated Rayon thread
//! pool. Errors are reported for the lowest failing task index so that a run
//! over the same input always blames the same partition.

use std::fmt::Debug;

use rayon::prelude::*;
use sumstat_common::AggregationConfig;
use tracing::debug;

use crate::error::{AggResult, AggregationError};

/// LocalScheduler manages parallel execution of tasks using Rayon
pub struct LocalScheduler {
    pool: rayon::ThreadPool,
    num_threads: usize,
}

impl Debug for LocalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

impl LocalScheduler {
    /// Create a new LocalScheduler with the specified number of threads
    pub fn new(num_threads: usize, thread_name_prefix: &str) -> AggResult<Self> {
        let prefix = thread_name_prefix.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()
            .map_err(|e| AggregationError::Worker(format!("failed to build thread pool: {}", e)))?;
        debug!(num_threads, "local scheduler started");
        Ok(Self { pool, num_threads })
    }

    /// Create a new LocalScheduler with one thread per CPU core
    pub fn with_default_threads() -> AggResult<Self> {
        let defaults = AggregationConfig::default();
        Self::new(defaults.parallelism, &defaults.thread_name_prefix)
    }

    /// Get the number of threads
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Run `task` on every item in parallel and return the outputs in item order.
    ///
    /// Every task runs to completion before this returns; if any failed, the
    /// error of the lowest-indexed failing task is returned.
    pub fn execute_all<T, R, F>(&self, items: Vec<T>, task: F) -> AggResult<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> AggResult<R> + Send + Sync,
    {
        let results: Vec<AggResult<R>> = self
            .pool
            .install(|| items.into_par_iter().map(&task).collect());
        results.into_iter().collect()
    }
}
