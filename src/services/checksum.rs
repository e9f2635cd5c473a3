//! SHA-256 content identity for every write and read path.

use sha2::{Digest, Sha256};
#[cfg(test)]
use {
    bytes::Bytes,
    futures::{Stream, StreamExt, pin_mut},
    std::io,
};

#[cfg(test)]
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("byte stream failed after {bytes_read} bytes: {source}")]
    StreamRead {
        bytes_read: u64,
        #[source]
        source: io::Error,
    },
}

/// Compute the lowercase hex SHA-256 digest of a buffer.
pub fn hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Consume a byte stream chunk by chunk, returning the digest and the number
/// of bytes observed. Nothing beyond the current chunk is held in memory.
/// Production writers fold the digest into their own copy loop instead.
#[cfg(test)]
pub async fn hash_stream<S>(stream: S) -> Result<(String, u64), ChecksumError>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut digest = RunningDigest::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => digest.update(&chunk),
            Err(source) => {
                return Err(ChecksumError::StreamRead {
                    bytes_read: digest.bytes_seen(),
                    source,
                });
            }
        }
    }
    Ok(digest.finish())
}

/// Incremental digest used by writers that checksum while they write.
#[derive(Clone, Default)]
pub struct RunningDigest {
    hasher: Sha256,
    bytes_seen: u64,
}

impl RunningDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_seen += chunk.len() as u64;
    }

    #[cfg(test)]
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes_seen)
    }
}

/// Compare a caller-declared digest against a computed one.
pub fn matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual)
}
