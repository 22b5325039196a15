//! Transport codec for partial results and broadcast artifacts.
//!
//! A frame is `[MAGIC][compression tag][payload]` where the payload is the
//! bincode (serde mode) encoding of the value, compressed when the tag is
//! non-zero. The receiving side reads the tag from the frame, so only the
//! sender needs to know the compression setting.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::compression::{CompressionAlgorithm, compressor_for};
use crate::error::{CommonError, Result};

/// First byte of every frame.
pub const FRAME_MAGIC: u8 = 0x5A;

const HEADER_LEN: usize = 2;
const UNCOMPRESSED_TAG: u8 = 0;

/// Encodes values for shipping between workers and the merging side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCodec {
    compression: Option<CompressionAlgorithm>,
    level: Option<i32>,
}

impl TransportCodec {
    /// Codec that writes uncompressed frames.
    pub fn plain() -> Self {
        Self::default()
    }

    /// Codec that compresses payloads with `algorithm` at its default level.
    pub fn compressed(algorithm: CompressionAlgorithm) -> Self {
        Self {
            compression: Some(algorithm),
            level: None,
        }
    }

    /// Overrides the compression level.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = Some(level);
        self
    }

    /// Encode `value` into a frame.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| CommonError::serialization_error_with_source("bincode encode failed", e))?;

        let (tag, body) = match self.compression {
            Some(algorithm) => {
                let compressor = compressor_for(algorithm, self.level)?;
                (algorithm.tag(), compressor.compress(&payload)?)
            }
            None => (UNCOMPRESSED_TAG, payload),
        };

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.push(FRAME_MAGIC);
        frame.push(tag);
        frame.extend_from_slice(&body);
        trace!(bytes = frame.len(), tag, "encoded frame");
        Ok(frame)
    }

    /// Decode a frame produced by any [`TransportCodec`].
    pub fn decode<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<T> {
        decode_frame(frame)
    }
}

/// Decode a frame without a codec instance.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < HEADER_LEN {
        return Err(CommonError::deserialization_error(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    if frame[0] != FRAME_MAGIC {
        return Err(CommonError::deserialization_error(format!(
            "bad frame magic 0x{:02x}",
            frame[0]
        )));
    }

    let body = &frame[HEADER_LEN..];
    let decompressed;
    let payload = match frame[1] {
        UNCOMPRESSED_TAG => body,
        tag => {
            let algorithm = CompressionAlgorithm::from_tag(tag).ok_or_else(|| {
                CommonError::deserialization_error(format!("unknown compression tag {}", tag))
            })?;
            decompressed = compressor_for(algorithm, None)?.decompress(body)?;
            decompressed.as_slice()
        }
    };

    let (value, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map_err(|e| CommonError::deserialization_error_with_source("bincode decode failed", e))?;
    Ok(value)
}
