//! Iterative refinement driver
//!
//! Runs a [`Refinement`] as a sequence of aggregation rounds. Each round
//! broadcasts the current artifact, runs local compute on every partition,
//! merges, and finalizes into the next artifact. The loop stops after a fixed
//! number of rounds, on convergence, on an exhausted budget, or when the
//! cancellation token fires.
//!
//! Cancellation is only observed between rounds; a round that has started
//! always completes, so the returned artifact is never a half-merged one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sumstat_common::{Diagnose, RefinementConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::DistributedAggregator;
use crate::broadcast::BroadcastManager;
use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::traits::{Aggregation, Refinement};

/// Lifecycle of a refinement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    Idle,
    Initializing,
    RoundLocalCompute { round: usize },
    RoundMerge { round: usize },
    RoundFinalize { round: usize },
    Converged,
    BudgetExhausted,
    Cancelled,
    Failed,
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverState::Converged
                | DriverState::BudgetExhausted
                | DriverState::Cancelled
                | DriverState::Failed
        )
    }
}

/// Why a refinement run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Ran the configured number of rounds with no tolerance set
    FixedRounds,
    /// Shift dropped to or below the tolerance
    Converged,
    /// Hit `max_rounds` without reaching the tolerance
    BudgetExhausted,
    /// Stopped by the cancellation token
    Cancelled,
}

/// Result of a refinement run.
#[derive(Debug, Clone)]
pub struct RefinementOutcome<T> {
    /// Latest artifact, or the seed when no round completed. A cancelled or
    /// budget-exhausted run of a refinement that scores its artifacts
    /// (see [`Refinement::quality`]) carries the best-scoring one instead.
    pub artifact: T,
    pub rounds_completed: usize,
    pub termination: Termination,
    /// Shift measured after each completed round
    pub shifts: Vec<f64>,
}

impl<T> RefinementOutcome<T> {
    pub fn last_shift(&self) -> Option<f64> {
        self.shifts.last().copied()
    }

    /// The artifact, or `ConvergenceFailure` unless the run converged or ran
    /// its fixed number of rounds.
    pub fn require_converged(self) -> AggResult<T> {
        match self.termination {
            Termination::Converged | Termination::FixedRounds => Ok(self.artifact),
            Termination::BudgetExhausted => Err(AggregationError::ConvergenceFailure {
                rounds: self.rounds_completed,
                last_shift: self.last_shift(),
                reason: "round budget exhausted".to_string(),
            }),
            Termination::Cancelled => Err(AggregationError::ConvergenceFailure {
                rounds: self.rounds_completed,
                last_shift: self.last_shift(),
                reason: "cancelled".to_string(),
            }),
        }
    }
}

/// Drives a [`Refinement`] round by round over a fixed set of partitions.
#[derive(Debug)]
pub struct IterativeRefinementDriver {
    aggregator: Arc<DistributedAggregator>,
    config: RefinementConfig,
    cancel: CancellationToken,
    state: DriverState,
}

impl IterativeRefinementDriver {
    pub fn new(aggregator: Arc<DistributedAggregator>, config: RefinementConfig) -> Self {
        Self {
            aggregator,
            config,
            cancel: CancellationToken::new(),
            state: DriverState::Idle,
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this run at the next round boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    fn transition(&mut self, next: DriverState) {
        debug!(from = ?self.state, to = ?next, "driver state change");
        self.state = next;
    }

    /// Seed, then run rounds until a stop condition holds.
    ///
    /// Errors from seeding or from any round move the driver to `Failed` and
    /// are returned as is.
    pub fn run<R: Refinement>(
        &mut self,
        refinement: &R,
        partitions: &[DataPartition],
    ) -> AggResult<RefinementOutcome<R::Artifact>> {
        match self.run_inner(refinement, partitions) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(
                    refinement = refinement.name(),
                    severity = ?e.severity(),
                    category = ?e.category(),
                    error = %e,
                    "refinement failed"
                );
                self.transition(DriverState::Failed);
                Err(e)
            }
        }
    }

    fn run_inner<R: Refinement>(
        &mut self,
        refinement: &R,
        partitions: &[DataPartition],
    ) -> AggResult<RefinementOutcome<R::Artifact>> {
        self.config.validate()?;
        if partitions.is_empty() {
            return Err(AggregationError::EmptyInput);
        }

        self.transition(DriverState::Initializing);
        let mut artifact = refinement.seed(&self.aggregator, partitions)?;
        info!(
            refinement = refinement.name(),
            partitions = partitions.len(),
            max_rounds = self.config.max_rounds,
            tolerance = ?self.config.tolerance,
            "refinement seeded"
        );

        let mut best = None;
        keep_best(refinement, &mut best, &artifact);
        let mut broadcasts = BroadcastManager::new();
        let mut shifts = Vec::new();
        let mut rounds_completed = 0;

        let termination = loop {
            if self.cancel.is_cancelled() {
                self.transition(DriverState::Cancelled);
                break Termination::Cancelled;
            }

            let round = rounds_completed + 1;
            let broadcast = broadcasts.publish(artifact.clone());
            let aggregation = refinement.round(broadcast);

            self.transition(DriverState::RoundLocalCompute { round });
            let set = self.aggregator.local_phase(&aggregation, partitions)?;

            self.transition(DriverState::RoundMerge { round });
            let merged = self.aggregator.merge_phase(&aggregation, set)?;

            self.transition(DriverState::RoundFinalize { round });
            let next = aggregation.finalize(merged.merged.into_partial())?;

            let shift = refinement.shift(&artifact, &next);
            keep_best(refinement, &mut best, &next);
            artifact = next;
            shifts.push(shift);
            rounds_completed = round;
            info!(refinement = refinement.name(), round, shift, "round complete");

            if let Some(tolerance) = self.config.tolerance {
                if shift <= tolerance {
                    self.transition(DriverState::Converged);
                    break Termination::Converged;
                }
            }
            if rounds_completed >= self.config.max_rounds {
                match self.config.tolerance {
                    Some(_) => {
                        self.transition(DriverState::BudgetExhausted);
                        break Termination::BudgetExhausted;
                    }
                    None => {
                        self.transition(DriverState::Converged);
                        break Termination::FixedRounds;
                    }
                }
            }
        };
        broadcasts.clear();

        if let (Termination::Cancelled | Termination::BudgetExhausted, Some((score, kept))) =
            (termination, best)
        {
            debug!(refinement = refinement.name(), score, "returning best artifact");
            artifact = kept;
        }

        info!(
            refinement = refinement.name(),
            rounds = rounds_completed,
            termination = ?termination,
            "refinement finished"
        );
        Ok(RefinementOutcome {
            artifact,
            rounds_completed,
            termination,
            shifts,
        })
    }

    /// Run on Tokio's blocking pool.
    ///
    /// Must be called from within a Tokio runtime. Keep a
    /// [`cancellation_token`](Self::cancellation_token) before calling this
    /// to stop the run from async code.
    pub fn spawn<R>(
        mut self,
        refinement: R,
        partitions: Vec<DataPartition>,
    ) -> JoinHandle<AggResult<RefinementOutcome<R::Artifact>>>
    where
        R: Refinement + 'static,
    {
        tokio::task::spawn_blocking(move || self.run(&refinement, &partitions))
    }
}

fn keep_best<R: Refinement>(
    refinement: &R,
    best: &mut Option<(f64, R::Artifact)>,
    candidate: &R::Artifact,
) {
    let Some(score) = refinement.quality(candidate).filter(|s| !s.is_nan()) else {
        return;
    };
    if best.as_ref().is_none_or(|(kept, _)| score < *kept) {
        *best = Some((score, candidate.clone()));
    }
}
