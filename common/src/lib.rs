//! Shared infrastructure for the sumstat workspace.
//!
//! This crate holds the pieces that are independent of any aggregation
//! algorithm: the infrastructure error type, payload compression, the
//! transport codec used to ship partial results, and configuration loading.

pub mod codec;
pub mod compression;
pub mod config;
pub mod error;

pub use codec::{TransportCodec, decode_frame};
pub use compression::{CompressionAlgorithm, Compressor, compressor_for};
pub use config::{
    AggregationConfig, ReduceStrategy, RefinementConfig, SumstatConfig, TransportMode,
};
pub use error::{CommonError, Diagnose, ErrorCategory, ErrorSeverity, Result};
