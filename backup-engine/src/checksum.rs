//! SHA-256 fingerprints for source data, stored backups and staged restores.
//!
//! Every checksum in a manifest is the lower-case hex SHA-256 of the
//! *uncompressed* content. Directory aggregates hash the sorted
//! `relativeFileName:checksum` lines of the files they contain, so the
//! aggregate does not depend on walk order.

use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Read buffer used when hashing streams.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of a byte slice.
pub fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash a stream to the end, returning the hex digest and the number of bytes read.
pub async fn digest_reader<R>(mut reader: R) -> std::io::Result<(String, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = StreamingDigest::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finish())
}

/// Aggregate checksum over `(relative_name, checksum)` pairs.
///
/// Names use `/` as separator regardless of platform.
pub fn aggregate<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut lines: Vec<String> = pairs
        .into_iter()
        .map(|(name, checksum)| format!("{}:{}", name, checksum))
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Incremental hasher fed while a copy stream is read.
#[derive(Clone, Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consume the hasher, returning `(hex_digest, total_bytes)`.
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes)
    }
}

/// Reader adapter that hashes every byte passing through it.
///
/// The writer puts this between the live source file and the compressor so
/// the manifest checksum describes exactly the bytes that were stored.
pub struct HashingReader<R> {
    inner: R,
    digest: StreamingDigest,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: StreamingDigest::new(),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.digest.bytes()
    }

    /// Returns `(hex_digest, total_bytes)` of everything read so far.
    pub fn finish(self) -> (String, u64) {
        self.digest.finish()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.digest.update(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}
