//! Sumstat Core - distributed partial-result aggregation
//!
//! Algorithms are expressed as three steps: a local step run independently on
//! every data partition, an associative merge of partial results, and a
//! finalize step that turns the merged partial into the answer. The
//! [`DistributedAggregator`] runs one such pass; the
//! [`IterativeRefinementDriver`] chains passes into rounds for algorithms like
//! k-means that refine a broadcast artifact until it stops moving.

pub mod aggregator;
pub mod algorithms;
pub mod broadcast;
pub mod context;
pub mod driver;
pub mod error;
pub mod partition;
pub mod scheduler;
pub mod traits;

pub use aggregator::{AggregationReport, DistributedAggregator, PartialSet, TaggedPartial};
pub use broadcast::{Broadcast, BroadcastId, BroadcastManager, SerializableBroadcast};
pub use context::ComputeContext;
pub use driver::{DriverState, IterativeRefinementDriver, RefinementOutcome, Termination};
pub use error::{AggResult, AggregationError};
pub use partition::{CsvOptions, DataPartition, NumericTable, split_labeled_rows, split_rows};
pub use scheduler::LocalScheduler;
pub use traits::{Aggregation, Data, FnAggregation, PartialResult, Refinement};

pub use sumstat_common::{
    AggregationConfig, CompressionAlgorithm, ReduceStrategy, RefinementConfig, SumstatConfig,
    TransportCodec, TransportMode,
};
