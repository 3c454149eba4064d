use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::model::TransmissionEvent;

/// Upper bound on inflated payload size, so a hostile batch cannot balloon in memory.
const MAX_DECOMPRESSED_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("failed to serialize events: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("gzip stream error: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("invalid base64 payload: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("decompressed payload exceeds the size limit")]
    TooLarge,
    #[error("failed to deserialize events: {0}")]
    Deserialize(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct CompressionThresholds {
    /// Compress when a batch holds more than this many events.
    pub max_plain_events: usize,
    /// Compress when the serialized batch is larger than this many bytes.
    pub max_plain_bytes: usize,
}

impl Default for CompressionThresholds {
    fn default() -> Self {
        Self {
            max_plain_events: 10,
            max_plain_bytes: 5 * 1024,
        }
    }
}

impl CompressionThresholds {
    pub fn should_compress(&self, event_count: usize, serialized_bytes: usize) -> bool {
        event_count > self.max_plain_events || serialized_bytes > self.max_plain_bytes
    }
}

/// Serializes the events, gzips them and base64-encodes the result.
pub fn compress_events(events: &[TransmissionEvent]) -> Result<String, CompressionError> {
    let serialized = serde_json::to_vec(events).map_err(CompressionError::Serialize)?;
    compress_bytes(&serialized)
}

pub(crate) fn compress_bytes(serialized: &[u8]) -> Result<String, CompressionError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(serialized)?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

/// Exact inverse of [`compress_events`].
pub fn decompress_events(payload: &str) -> Result<Vec<TransmissionEvent>, CompressionError> {
    let compressed = BASE64.decode(payload.trim())?;

    let mut decoder = GzDecoder::new(compressed.as_slice()).take(MAX_DECOMPRESSED_BYTES + 1);
    let mut serialized = Vec::new();
    decoder.read_to_end(&mut serialized)?;
    if serialized.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(CompressionError::TooLarge);
    }

    serde_json::from_slice(&serialized).map_err(CompressionError::Deserialize)
}
