//! Error handling for the sumstat-common crate.

use thiserror::Error;

/// Infrastructure error shared by the transport codec, compression and
/// configuration layers.
///
/// Every variant carries a human readable message and an optional source so
/// that the underlying library error survives the conversion.
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Serialization failed: {message}")]
    SerializationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Deserialization failed: {message}")]
    DeserializationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Invalid configuration: {message}")]
    ConfigurationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("IO operation failed: {message}")]
    IoError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Compression failed: {message}")]
    CompressionError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Decompression failed: {message}")]
    DecompressionError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

/// Error severity levels for categorizing errors.
///
/// Every error aborts the run it occurs in; severity only ranks how far
/// the cause reaches beyond that run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Only the payload at hand is affected
    Low,
    /// The run's inputs or numerics are at fault
    Medium,
    /// Every run with the same inputs or settings will fail
    High,
    /// The worker pool itself is unusable
    Critical,
}

/// Error category for grouping related error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// File system and environment errors
    Infrastructure,
    /// Encoding, decoding and compression errors
    DataProcessing,
    /// Configuration and setup errors
    Configuration,
    /// Finalize-time numerical failures and non-convergence
    Computation,
}

/// Diagnostics exposed by infrastructure and aggregation errors.
pub trait Diagnose {
    /// Get the error severity level.
    fn severity(&self) -> ErrorSeverity;

    /// Get the error category.
    fn category(&self) -> ErrorCategory;
}

impl CommonError {
    /// Create a serialization error with a custom message.
    pub fn serialization_error<S: Into<String>>(message: S) -> Self {
        Self::SerializationError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error with a custom message and source error.
    pub fn serialization_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a deserialization error with a custom message.
    pub fn deserialization_error<S: Into<String>>(message: S) -> Self {
        Self::DeserializationError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a deserialization error with a custom message and source error.
    pub fn deserialization_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::DeserializationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a configuration error with a custom message.
    pub fn configuration_error<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with a custom message and source error.
    pub fn configuration_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create an IO error with a custom message.
    pub fn io_error<S: Into<String>>(message: S) -> Self {
        Self::IoError {
            message: message.into(),
            source: None,
        }
    }

    /// Create an IO error with a custom message and source error.
    pub fn io_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::IoError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a compression error with a custom message and source error.
    pub fn compression_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::CompressionError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a decompression error with a custom message.
    pub fn decompression_error<S: Into<String>>(message: S) -> Self {
        Self::DecompressionError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a decompression error with a custom message and source error.
    pub fn decompression_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::DecompressionError {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl Diagnose for CommonError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            CommonError::SerializationError { .. } => ErrorSeverity::Medium,
            CommonError::DeserializationError { .. } => ErrorSeverity::Medium,
            CommonError::ConfigurationError { .. } => ErrorSeverity::High,
            CommonError::IoError { .. } => ErrorSeverity::Medium,
            CommonError::CompressionError { .. } => ErrorSeverity::Low,
            CommonError::DecompressionError { .. } => ErrorSeverity::Medium,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            CommonError::SerializationError { .. }
            | CommonError::DeserializationError { .. }
            | CommonError::CompressionError { .. }
            | CommonError::DecompressionError { .. } => ErrorCategory::DataProcessing,
            CommonError::ConfigurationError { .. } => ErrorCategory::Configuration,
            CommonError::IoError { .. } => ErrorCategory::Infrastructure,
        }
    }
}

/// Context helpers for attaching a message to foreign errors.
pub mod context {
    use super::*;

    /// Extension trait for converting foreign results into [`CommonError`].
    pub trait ErrorContext<T> {
        /// Wrap the error as an IO error with the given context.
        fn with_io_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String;

        /// Wrap the error as a configuration error with the given context.
        fn with_config_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String;
    }

    impl<T, E> ErrorContext<T> for std::result::Result<T, E>
    where
        E: Into<anyhow::Error>,
    {
        fn with_io_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String,
        {
            self.map_err(|e| CommonError::io_error_with_source(f(), e.into()))
        }

        fn with_config_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String,
        {
            self.map_err(|e| CommonError::configuration_error_with_source(f(), e.into()))
        }
    }
}
