//! Reversible byte-stream transforms applied to stored backup items.
//!
//! Compressors work on readers so the writer can hash, compress and store a
//! source file in a single pass, and the validator can hash both the stored
//! and the decompressed bytes while streaming a backup item.

use crate::utils::errors::{EngineError, Result};
use async_compression::tokio::bufread::{ZstdDecoder, ZstdEncoder};
use async_compression::Level;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt};

/// zstd level used when none is configured.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Owned, pinned async reader.
pub type ByteReader<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;

/// Owned, pinned buffered async reader.
pub type ByteBufReader<'a> = Pin<Box<dyn AsyncBufRead + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Zstd,
    None,
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
            CompressionAlgorithm::None => write!(f, "none"),
        }
    }
}

/// A reversible transform: `decompress(compress(x)) == x` for every input.
#[async_trait::async_trait]
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Wrap a plain reader so that reading from the result yields compressed bytes.
    fn encode_reader<'a>(&self, inner: ByteBufReader<'a>) -> ByteReader<'a>;

    /// Wrap a compressed reader so that reading from the result yields the original bytes.
    fn decode_reader<'a>(&self, inner: ByteBufReader<'a>) -> ByteReader<'a>;

    async fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2);
        self.encode_reader(Box::pin(data))
            .read_to_end(&mut out)
            .await
            .map_err(|e| EngineError::WriteFailure(format!("compression failed: {}", e)))?;
        Ok(out)
    }

    /// Fails with `CorruptData` if the input is not a valid stream for this algorithm.
    async fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2);
        self.decode_reader(Box::pin(data))
            .read_to_end(&mut out)
            .await
            .map_err(|e| EngineError::CorruptData(e.to_string()))?;
        Ok(out)
    }
}

/// zstd via async-compression.
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_ZSTD_LEVEL)
    }
}

#[async_trait::async_trait]
impl Compressor for ZstdCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zstd
    }

    fn encode_reader<'a>(&self, inner: ByteBufReader<'a>) -> ByteReader<'a> {
        Box::pin(ZstdEncoder::with_quality(inner, Level::Precise(self.level)))
    }

    fn decode_reader<'a>(&self, inner: ByteBufReader<'a>) -> ByteReader<'a> {
        Box::pin(ZstdDecoder::new(inner))
    }
}

/// Identity transform. Stored items are byte-for-byte copies of the source.
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

#[async_trait::async_trait]
impl Compressor for NoCompression {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn encode_reader<'a>(&self, inner: ByteBufReader<'a>) -> ByteReader<'a> {
        Box::pin(inner)
    }

    fn decode_reader<'a>(&self, inner: ByteBufReader<'a>) -> ByteReader<'a> {
        Box::pin(inner)
    }
}

/// Build the compressor for a configured algorithm.
pub fn build_compressor(algorithm: CompressionAlgorithm, level: i32) -> Arc<dyn Compressor> {
    match algorithm {
        CompressionAlgorithm::Zstd => Arc::new(ZstdCompressor::new(level)),
        CompressionAlgorithm::None => Arc::new(NoCompression),
    }
}

/// Compressor able to decode items stored with `algorithm`.
///
/// Decoding does not depend on the level an item was written with.
pub fn decoder_for(algorithm: CompressionAlgorithm) -> Arc<dyn Compressor> {
    build_compressor(algorithm, DEFAULT_ZSTD_LEVEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_documents() -> Vec<Vec<u8>> {
        vec![
            Vec::new(),
            b"[]".to_vec(),
            br#"[{"id":1,"college":"Riverside","accountManager":"J. Doe"}]"#.to_vec(),
            "{\"note\":\"caf\u{e9} \u{2603}\"}".as_bytes().to_vec(),
            (0..=255u8).cycle().take(200_000).collect(),
        ]
    }

    #[tokio::test]
    async fn test_zstd_round_trip() -> Result<()> {
        let compressor = ZstdCompressor::default();
        for doc in sample_documents() {
            let compressed = compressor.compress(&doc).await?;
            assert_eq!(compressor.decompress(&compressed).await?, doc);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_none_round_trip() -> Result<()> {
        let compressor = NoCompression;
        for doc in sample_documents() {
            let stored = compressor.compress(&doc).await?;
            assert_eq!(stored, doc);
            assert_eq!(compressor.decompress(&stored).await?, doc);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_zstd_shrinks_repetitive_json() -> Result<()> {
        let doc = br#"{"college":"Riverside","status":"active"},"#.repeat(500);
        let compressed = ZstdCompressor::new(9).compress(&doc).await?;
        assert!(compressed.len() < doc.len() / 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_zstd_rejects_garbage() {
        let result = ZstdCompressor::default()
            .decompress(b"this was never a zstd frame")
            .await;
        assert!(matches!(result, Err(EngineError::CorruptData(_))));
    }

    #[test]
    fn test_build_compressor() {
        assert_eq!(
            build_compressor(CompressionAlgorithm::Zstd, 5).algorithm(),
            CompressionAlgorithm::Zstd
        );
        assert_eq!(
            build_compressor(CompressionAlgorithm::None, 0).algorithm(),
            CompressionAlgorithm::None
        );
    }
}
