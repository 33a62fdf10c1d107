//! Chunk payload compression
//!
//! Every chunk is offered to the configured codec. The compressed form is
//! kept only when it is strictly smaller than the input; otherwise the chunk
//! is stored raw and the directory entry records equal stored and
//! uncompressed sizes.
//!
//! Codec id lives in the low two bits of the directory entry flags.

use crate::error::{BundleError, Result};
use serde::{Deserialize, Serialize};

/// Compression method for chunk payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// LZ4 block compression (fast, moderate ratio)
    Lz4 = 1,
    /// Zstd compression (slower, better ratio)
    Zstd = 2,
}

impl CompressionMethod {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Lz4),
            2 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

impl Default for CompressionMethod {
    fn default() -> Self {
        CompressionMethod::Lz4
    }
}

impl std::str::FromStr for CompressionMethod {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CompressionMethod::None),
            "lz4" => Ok(CompressionMethod::Lz4),
            "zstd" => Ok(CompressionMethod::Zstd),
            _ => Err(BundleError::Config(format!(
                "Unknown compression method '{}'. Valid options: none, lz4, zstd",
                s
            ))),
        }
    }
}

/// Compression configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub method: CompressionMethod,
    /// Zstd level, ignored by other codecs
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            method: CompressionMethod::Lz4,
            level: 3,
        }
    }
}

impl CompressionConfig {
    pub fn none() -> Self {
        CompressionConfig {
            method: CompressionMethod::None,
            ..Default::default()
        }
    }

    pub fn lz4() -> Self {
        CompressionConfig::default()
    }

    pub fn zstd(level: i32) -> Self {
        CompressionConfig {
            method: CompressionMethod::Zstd,
            level,
        }
    }
}

/// Compress data using the specified method
pub fn compress(data: &[u8], config: &CompressionConfig) -> Result<Vec<u8>> {
    match config.method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Lz4 => Ok(lz4_flex::block::compress(data)),
        CompressionMethod::Zstd => zstd::bulk::compress(data, config.level)
            .map_err(|e| BundleError::Compression(format!("Zstd compression failed: {}", e))),
    }
}

/// Decompress data that must expand to exactly `expected_size` bytes
pub fn decompress(data: &[u8], method: CompressionMethod, expected_size: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; expected_size];
    decompress_into(data, method, &mut out)?;
    Ok(out)
}

/// Decompress into `out`, which must be filled exactly
pub fn decompress_into(data: &[u8], method: CompressionMethod, out: &mut [u8]) -> Result<()> {
    let written = match method {
        CompressionMethod::None => {
            if data.len() == out.len() {
                out.copy_from_slice(data);
            }
            data.len()
        }
        CompressionMethod::Lz4 => lz4_flex::block::decompress_into(data, out)
            .map_err(|e| BundleError::Compression(format!("LZ4 decompression failed: {}", e)))?,
        CompressionMethod::Zstd => zstd::bulk::decompress_to_buffer(data, out)
            .map_err(|e| BundleError::Compression(format!("Zstd decompression failed: {}", e)))?,
    };

    if written != out.len() {
        return Err(BundleError::Compression(format!(
            "Expected {} decompressed bytes, got {}",
            out.len(),
            written
        )));
    }
    Ok(())
}

/// Compress data if that makes it smaller, returns (data, method_used)
pub fn compress_if_beneficial(
    data: &[u8],
    config: &CompressionConfig,
) -> Result<(Vec<u8>, CompressionMethod)> {
    if matches!(config.method, CompressionMethod::None) {
        return Ok((data.to_vec(), CompressionMethod::None));
    }

    let compressed = compress(data, config)?;
    if compressed.len() < data.len() {
        Ok((compressed, config.method))
    } else {
        Ok((data.to_vec(), CompressionMethod::None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_method_conversion() {
        assert_eq!(CompressionMethod::from_u8(0), Some(CompressionMethod::None));
        assert_eq!(CompressionMethod::from_u8(1), Some(CompressionMethod::Lz4));
        assert_eq!(CompressionMethod::from_u8(2), Some(CompressionMethod::Zstd));
        assert_eq!(CompressionMethod::from_u8(3), None);
        assert_eq!("ZSTD".parse::<CompressionMethod>().unwrap(), CompressionMethod::Zstd);
        assert!("brotli".parse::<CompressionMethod>().is_err());
    }

    #[test]
    fn test_lz4_compression() {
        let data = b"Hello, World! ".repeat(100);
        let compressed = compress(&data, &CompressionConfig::lz4()).unwrap();
        assert!(compressed.len() < data.len());

        let decompressed = decompress(&compressed, CompressionMethod::Lz4, data.len()).unwrap();
        assert_eq!(data, decompressed);
    }

    #[test]
    fn test_zstd_compression() {
        let data = b"Zstandard compression test data! ".repeat(100);
        let compressed = compress(&data, &CompressionConfig::zstd(3)).unwrap();
        assert!(compressed.len() < data.len());

        let decompressed = decompress(&compressed, CompressionMethod::Zstd, data.len()).unwrap();
        assert_eq!(data, decompressed);
    }

    #[test]
    fn test_wrong_expected_size() {
        let data = b"abcabcabcabcabcabcabcabc".repeat(10);
        let compressed = compress(&data, &CompressionConfig::lz4()).unwrap();
        let result = decompress(&compressed, CompressionMethod::Lz4, data.len() + 5);
        assert!(matches!(result, Err(BundleError::Compression(_))));
    }

    #[test]
    fn test_incompressible_falls_back() {
        let data = b"hi";
        let (stored, method) = compress_if_beneficial(data, &CompressionConfig::lz4()).unwrap();
        assert_eq!(method, CompressionMethod::None);
        assert_eq!(stored, data);

        let large = b"X".repeat(2000);
        let (stored, method) = compress_if_beneficial(&large, &CompressionConfig::lz4()).unwrap();
        assert_eq!(method, CompressionMethod::Lz4);
        assert!(stored.len() < large.len());
    }
}
