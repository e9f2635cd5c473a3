//! Joins the chunks of a chunked upload into one buffer.

use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u32,
    pub bytes: Bytes,
}

impl Chunk {
    pub fn new(index: u32, bytes: impl Into<Bytes>) -> Self {
        Self {
            index,
            bytes: bytes.into(),
        }
    }
}

/// Order chunks by their declared index and concatenate them.
///
/// Arrival order is irrelevant. Indices are not checked for gaps or
/// duplicates: whatever was received is joined in sorted order, and chunks
/// sharing an index keep their arrival order.
pub fn assemble(mut chunks: Vec<Chunk>) -> Bytes {
    chunks.sort_by_key(|chunk| chunk.index);
    let total = chunks.iter().map(|chunk| chunk.bytes.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for chunk in chunks {
        out.extend_from_slice(&chunk.bytes);
    }
    out.freeze()
}
