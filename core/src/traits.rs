//! Core traits of the aggregation protocol
//!
//! An algorithm plugs into the protocol by implementing [`Aggregation`]:
//! a local step run once per partition, an associative merge of two partial
//! results, and a finalize step run once on the fully merged partial.
//! Algorithms that need several rounds implement [`Refinement`] on top.

use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::aggregator::DistributedAggregator;
use crate::broadcast::Broadcast;
use crate::error::AggResult;
use crate::partition::DataPartition;

/// A value that can cross worker boundaries.
pub trait Data: Send + Sync + Clone + Debug + Serialize + DeserializeOwned + 'static {}
impl<T> Data for T where T: Send + Sync + Clone + Debug + Serialize + DeserializeOwned + 'static {}

/// Sufficient statistics produced by a local step.
///
/// Implementations must merge associatively, and merging a partial over
/// `n1` rows with one over `n2` rows must be equivalent to computing the
/// partial over all `n1 + n2` rows at once.
pub trait PartialResult: Data {
    /// Number of input rows folded into this partial.
    fn row_count(&self) -> u64;

    /// Feature dimensionality; partials are only mergeable when these match.
    fn num_features(&self) -> usize;
}

/// The three steps of a partial-result aggregation.
pub trait Aggregation: Send + Sync + Debug {
    type Partial: PartialResult;
    type Output: Send + 'static;

    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Compute the partial result for one partition.
    fn local_compute(&self, partition: &DataPartition) -> AggResult<Self::Partial>;

    /// Combine two partials of the same feature dimensionality.
    fn merge(&self, left: Self::Partial, right: Self::Partial) -> AggResult<Self::Partial>;

    /// Turn the fully merged partial into the externally visible result.
    fn finalize(&self, merged: Self::Partial) -> AggResult<Self::Output>;
}

impl<A: Aggregation + ?Sized> Aggregation for &A {
    type Partial = A::Partial;
    type Output = A::Output;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<Self::Partial> {
        (**self).local_compute(partition)
    }

    fn merge(&self, left: Self::Partial, right: Self::Partial) -> AggResult<Self::Partial> {
        (**self).merge(left, right)
    }

    fn finalize(&self, merged: Self::Partial) -> AggResult<Self::Output> {
        (**self).finalize(merged)
    }
}

/// An algorithm whose answer needs several aggregation rounds.
///
/// Each round's local step reads the broadcast artifact of the previous
/// round and the round's finalize produces the next artifact.
pub trait Refinement: Send + Sync + Debug {
    type Artifact: Data;
    type Round: Aggregation<Output = Self::Artifact>;

    fn name(&self) -> &str;

    /// Produce the initial artifact. May run aggregation passes of its own.
    fn seed(
        &self,
        aggregator: &DistributedAggregator,
        partitions: &[DataPartition],
    ) -> AggResult<Self::Artifact>;

    /// Aggregation for one round, reading `artifact`.
    fn round(&self, artifact: Broadcast<Self::Artifact>) -> Self::Round;

    /// Distance between two successive artifacts, compared against the
    /// convergence tolerance.
    fn shift(&self, previous: &Self::Artifact, next: &Self::Artifact) -> f64;

    /// Score of an artifact, lower is better.
    ///
    /// When this returns a score, a run that is cancelled or runs out of
    /// rounds hands back the best-scoring artifact seen, seed included.
    /// Without one it hands back the latest.
    fn quality(&self, _artifact: &Self::Artifact) -> Option<f64> {
        None
    }
}

type LocalFn<P> = Arc<dyn Fn(&DataPartition) -> AggResult<P> + Send + Sync>;
type MergeFn<P> = Arc<dyn Fn(P, P) -> AggResult<P> + Send + Sync>;
type FinalizeFn<P, O> = Arc<dyn Fn(P) -> AggResult<O> + Send + Sync>;

/// An [`Aggregation`] assembled from closures.
pub struct FnAggregation<P, O> {
    name: String,
    local: LocalFn<P>,
    merge: MergeFn<P>,
    finalize: FinalizeFn<P, O>,
}

impl<P, O> FnAggregation<P, O>
where
    P: PartialResult,
    O: Send + 'static,
{
    pub fn new<L, M, F>(name: impl Into<String>, local: L, merge: M, finalize: F) -> Self
    where
        L: Fn(&DataPartition) -> AggResult<P> + Send + Sync + 'static,
        M: Fn(P, P) -> AggResult<P> + Send + Sync + 'static,
        F: Fn(P) -> AggResult<O> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            local: Arc::new(local),
            merge: Arc::new(merge),
            finalize: Arc::new(finalize),
        }
    }
}

impl<P, O> Debug for FnAggregation<P, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAggregation")
            .field("name", &self.name)
            .field("local", &"<function>")
            .field("merge", &"<function>")
            .field("finalize", &"<function>")
            .finish()
    }
}

impl<P, O> Aggregation for FnAggregation<P, O>
where
    P: PartialResult,
    O: Send + 'static,
{
    type Partial = P;
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<P> {
        (self.local)(partition)
    }

    fn merge(&self, left: P, right: P) -> AggResult<P> {
        (self.merge)(left, right)
    }

    fn finalize(&self, merged: P) -> AggResult<O> {
        (self.finalize)(merged)
    }
}
