//! Compression of encoded partial results.
//!
//! Partial results shipped from workers to the merging side are dominated by
//! dense floating-point blocks (cross products, per-class totals), so the
//! transport codec can optionally compress them with zstd, lz4 or snappy.

use std::fmt::Debug;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};

/// Compression algorithm types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Zstd - best ratio, moderate speed.
    Zstd,
    /// LZ4 - fastest, lower ratio.
    Lz4,
    /// Snappy - balanced.
    Snappy,
}

impl CompressionAlgorithm {
    /// Default compression level for this algorithm.
    pub fn default_level(&self) -> i32 {
        match self {
            CompressionAlgorithm::Zstd => 3,
            CompressionAlgorithm::Lz4 | CompressionAlgorithm::Snappy => 0,
        }
    }

    /// Tag written into framed payloads.
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::Zstd => 1,
            CompressionAlgorithm::Lz4 => 2,
            CompressionAlgorithm::Snappy => 3,
        }
    }

    /// Inverse of [`CompressionAlgorithm::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(CompressionAlgorithm::Zstd),
            2 => Some(CompressionAlgorithm::Lz4),
            3 => Some(CompressionAlgorithm::Snappy),
            _ => None,
        }
    }
}

/// Generic compressor interface.
pub trait Compressor: Debug + Send + Sync {
    /// Compress the input data and return compressed bytes.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data and return original bytes.
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the compression algorithm used by this compressor.
    fn algorithm(&self) -> CompressionAlgorithm;
}

/// Builds a compressor for `algorithm`, validating `level` where the
/// algorithm supports one.
pub fn compressor_for(
    algorithm: CompressionAlgorithm,
    level: Option<i32>,
) -> Result<Box<dyn Compressor>> {
    match algorithm {
        CompressionAlgorithm::Zstd => {
            let level = level.unwrap_or(algorithm.default_level());
            if !(1..=22).contains(&level) {
                return Err(CommonError::configuration_error(format!(
                    "Invalid zstd compression level: {}. Must be between 1 and 22",
                    level
                )));
            }
            Ok(Box::new(ZstdCompressor { level }))
        }
        CompressionAlgorithm::Lz4 => Ok(Box::new(Lz4Compressor)),
        CompressionAlgorithm::Snappy => Ok(Box::new(SnappyCompressor)),
    }
}

#[derive(Debug)]
struct ZstdCompressor {
    level: i32,
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level)
            .map_err(|e| CommonError::compression_error_with_source("Zstd compression failed", e))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(compressed_data).map_err(|e| {
            CommonError::decompression_error_with_source("Zstd decompression failed", e)
        })
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zstd
    }
}

#[derive(Debug)]
struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(compressed_data).map_err(|e| {
            CommonError::decompression_error_with_source("LZ4 decompression failed", e)
        })
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }
}

#[derive(Debug)]
struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = snap::write::FrameEncoder::new(Vec::new());
        encoder.write_all(data).map_err(|e| {
            CommonError::compression_error_with_source("Snappy compression failed", e)
        })?;
        encoder.into_inner().map_err(|e| {
            CommonError::compression_error_with_source(
                "Snappy compression finalization failed",
                anyhow::anyhow!("{}", e),
            )
        })
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decompressed = Vec::new();
        snap::read::FrameDecoder::new(compressed_data)
            .read_to_end(&mut decompressed)
            .map_err(|e| {
                CommonError::decompression_error_with_source("Snappy decompression failed", e)
            })?;
        Ok(decompressed)
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Snappy
    }
}
