//! Configuration for aggregation runs and iterative refinement.
//!
//! Values come from [`Default`], a JSON document, or both, and can then be
//! overridden from `SUMSTAT_*` environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::TransportCodec;
use crate::compression::{CompressionAlgorithm, compressor_for};
use crate::error::context::ErrorContext;
use crate::error::{CommonError, Result};

/// Shape of the merge phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceStrategy {
    /// Pairwise merges level by level, `ceil(log2 P)` depth.
    #[default]
    Tree,
    /// Left fold over the partitions in index order, `P - 1` depth.
    Linear,
}

/// How partial results move from the local-compute side to the merge side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum TransportMode {
    /// Partials are moved by value.
    #[default]
    InProcess,
    /// Partials are encoded after local compute and decoded before merging.
    Serialized {
        #[serde(default)]
        compression: Option<CompressionAlgorithm>,
        /// Compression level; only zstd honours it
        #[serde(default)]
        level: Option<i32>,
    },
}

impl TransportMode {
    /// The codec partials go through, or `None` when they move by value.
    pub fn codec(&self) -> Result<Option<TransportCodec>> {
        match *self {
            TransportMode::InProcess => Ok(None),
            TransportMode::Serialized {
                compression: None,
                level: Some(level),
            } => Err(CommonError::configuration_error(format!(
                "compression level {} given without a compression algorithm",
                level
            ))),
            TransportMode::Serialized {
                compression: None,
                level: None,
            } => Ok(Some(TransportCodec::plain())),
            TransportMode::Serialized {
                compression: Some(algorithm),
                level,
            } => {
                let mut codec = TransportCodec::compressed(algorithm);
                if let Some(level) = level {
                    compressor_for(algorithm, Some(level))?;
                    codec = codec.with_level(level);
                }
                Ok(Some(codec))
            }
        }
    }
}

/// Configuration for one distributed aggregation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Worker threads used for local compute and tree merges
    pub parallelism: usize,
    /// Merge tree shape
    pub reduce_strategy: ReduceStrategy,
    /// Partial-result transport
    pub transport: TransportMode,
    /// Prefix for worker thread names
    pub thread_name_prefix: String,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            reduce_strategy: ReduceStrategy::Tree,
            transport: TransportMode::InProcess,
            thread_name_prefix: "sumstat-worker".to_string(),
        }
    }
}

/// Configuration for the iterative refinement driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Upper bound on the number of rounds
    pub max_rounds: usize,
    /// Stop once successive artifacts move less than this; `None` runs
    /// exactly `max_rounds` rounds
    pub tolerance: Option<f64>,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            tolerance: None,
        }
    }
}

impl RefinementConfig {
    /// Fixed number of rounds, no convergence check.
    pub fn fixed_rounds(max_rounds: usize) -> Self {
        Self {
            max_rounds,
            tolerance: None,
        }
    }

    /// Stop at `tolerance` or after `max_rounds`, whichever comes first.
    pub fn until_converged(max_rounds: usize, tolerance: f64) -> Self {
        Self {
            max_rounds,
            tolerance: Some(tolerance),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(CommonError::configuration_error(
                "max_rounds must be at least 1",
            ));
        }
        if let Some(tolerance) = self.tolerance {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(CommonError::configuration_error(format!(
                    "tolerance must be a finite non-negative number, got {}",
                    tolerance
                )));
            }
        }
        Ok(())
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SumstatConfig {
    pub aggregation: AggregationConfig,
    pub refinement: RefinementConfig,
}

impl SumstatConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .with_config_context(|| "failed to parse configuration JSON".to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_io_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json_str(&text)
    }

    /// Apply `SUMSTAT_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Recognised keys: `SUMSTAT_PARALLELISM`, `SUMSTAT_REDUCE_STRATEGY`
    /// (`tree`/`linear`), `SUMSTAT_MAX_ROUNDS`, `SUMSTAT_TOLERANCE`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SUMSTAT_PARALLELISM") {
            self.aggregation.parallelism = value
                .trim()
                .parse::<usize>()
                .with_config_context(|| format!("SUMSTAT_PARALLELISM={}", value))?;
        }
        if let Some(value) = lookup("SUMSTAT_REDUCE_STRATEGY") {
            self.aggregation.reduce_strategy = match value.trim().to_ascii_lowercase().as_str() {
                "tree" => ReduceStrategy::Tree,
                "linear" => ReduceStrategy::Linear,
                other => {
                    return Err(CommonError::configuration_error(format!(
                        "unknown reduce strategy '{}'",
                        other
                    )));
                }
            };
        }
        if let Some(value) = lookup("SUMSTAT_MAX_ROUNDS") {
            self.refinement.max_rounds = value
                .trim()
                .parse::<usize>()
                .with_config_context(|| format!("SUMSTAT_MAX_ROUNDS={}", value))?;
        }
        if let Some(value) = lookup("SUMSTAT_TOLERANCE") {
            let tolerance = value
                .trim()
                .parse::<f64>()
                .with_config_context(|| format!("SUMSTAT_TOLERANCE={}", value))?;
            self.refinement.tolerance = Some(tolerance);
        }
        debug!(config = ?self, "configuration after overrides");
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggregation.parallelism == 0 {
            return Err(CommonError::configuration_error(
                "parallelism must be at least 1",
            ));
        }
        self.aggregation.transport.codec()?;
        self.refinement.validate()
    }
}
