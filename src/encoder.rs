//! Transport encoder: applies the compression policy to a serialized record.

use std::io::Write as _;
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::config::CompressionMode;
use crate::error::GelfError;

/// Compresses serialized payloads.
pub trait Compressor: Send + Sync {
    fn compress(&self, raw: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// zlib (RFC 1950) compressor, the format GELF receivers auto-detect.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: Compression,
}

impl ZlibCompressor {
    pub fn new(level: Compression) -> Self {
        Self { level }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new(Compression::default())
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, raw: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut enc = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), self.level);
        enc.write_all(raw)?;
        enc.finish()
    }
}

/// Bytes ready for the dispatcher or the chunker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// Whether a payload of `raw_len` bytes is compressed under `mode`.
pub fn should_compress(mode: CompressionMode, raw_len: usize, max_datagram_size: usize) -> bool {
    match mode {
        CompressionMode::Never => false,
        CompressionMode::Always => true,
        CompressionMode::Optimal => raw_len > max_datagram_size,
    }
}

/// Apply the compression policy to a raw payload.
///
/// # Errors
///
/// Returns `GelfError::Compression` if the compressor fails.
pub fn encode(
    raw: Vec<u8>,
    mode: CompressionMode,
    max_datagram_size: usize,
    compressor: &dyn Compressor,
) -> Result<Encoded, GelfError> {
    if !should_compress(mode, raw.len(), max_datagram_size) {
        return Ok(Encoded {
            bytes: raw,
            compressed: false,
        });
    }

    let bytes = compressor
        .compress(&raw)
        .map_err(|e| GelfError::Compression(Arc::new(e)))?;

    Ok(Encoded {
        bytes,
        compressed: true,
    })
}
