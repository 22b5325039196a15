//! Error types for aggregation and refinement.

use sumstat_common::{CommonError, Diagnose, ErrorCategory, ErrorSeverity};
use thiserror::Error;

/// Errors raised by local compute, merge, finalize and the orchestration
/// around them.
///
/// Any error out of a local step or a merge aborts the whole aggregation;
/// no partial result is ever handed back alongside one of these.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("Malformed partition {partition}: {reason}")]
    DataShape { partition: usize, reason: String },

    #[error(
        "Cannot merge partitions {left:?} ({left_features} features) with partitions {right:?} ({right_features} features)"
    )]
    DimensionMismatch {
        left: Vec<usize>,
        right: Vec<usize>,
        left_features: usize,
        right_features: usize,
    },

    #[error("No partitions supplied")]
    EmptyInput,

    #[error("Not converged after {rounds} rounds (last shift {last_shift:?}): {reason}")]
    ConvergenceFailure {
        rounds: usize,
        last_shift: Option<f64>,
        reason: String,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Numerical failure: {0}")]
    Numerical(String),

    #[error("Transport codec error: {0}")]
    Codec(#[source] CommonError),

    #[error("Configuration error: {0}")]
    Config(#[source] CommonError),

    #[error("IO error: {0}")]
    Io(#[source] CommonError),

    #[error("Worker failure: {0}")]
    Worker(String),
}

/// Result type for aggregation operations
pub type AggResult<T> = Result<T, AggregationError>;

impl AggregationError {
    /// Malformed-partition error.
    pub fn data_shape(partition: usize, reason: impl Into<String>) -> Self {
        Self::DataShape {
            partition,
            reason: reason.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    pub fn numerical(message: impl Into<String>) -> Self {
        Self::Numerical(message.into())
    }

    /// Width mismatch found inside a merge, where the partitions behind each
    /// side are not known. The aggregator reports the partitions itself
    /// before it ever calls a merge.
    pub fn feature_mismatch(left_features: usize, right_features: usize) -> Self {
        Self::DimensionMismatch {
            left: Vec::new(),
            right: Vec::new(),
            left_features,
            right_features,
        }
    }

    /// Partition index the error points at, when there is exactly one.
    pub fn partition(&self) -> Option<usize> {
        match self {
            Self::DataShape { partition, .. } => Some(*partition),
            _ => None,
        }
    }
}

impl From<CommonError> for AggregationError {
    fn from(error: CommonError) -> Self {
        match error {
            CommonError::ConfigurationError { .. } => Self::Config(error),
            CommonError::IoError { .. } => Self::Io(error),
            other => Self::Codec(other),
        }
    }
}

impl Diagnose for AggregationError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Codec(e) | Self::Config(e) | Self::Io(e) => e.severity(),
            Self::DataShape { .. }
            | Self::DimensionMismatch { .. }
            | Self::EmptyInput
            | Self::InvalidParameter(_) => ErrorSeverity::High,
            Self::ConvergenceFailure { .. } | Self::Numerical(_) => ErrorSeverity::Medium,
            Self::Worker(_) => ErrorSeverity::Critical,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Codec(e) | Self::Config(e) | Self::Io(e) => e.category(),
            Self::DataShape { .. } | Self::DimensionMismatch { .. } | Self::EmptyInput => {
                ErrorCategory::DataProcessing
            }
            Self::InvalidParameter(_) => ErrorCategory::Configuration,
            Self::ConvergenceFailure { .. } | Self::Numerical(_) => ErrorCategory::Computation,
            Self::Worker(_) => ErrorCategory::Infrastructure,
        }
    }
}
