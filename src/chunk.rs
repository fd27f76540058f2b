use bytes::Bytes;
use serde::{Serialize, Deserialize};
use crate::common::{checksum, NodeRef};
use crate::error::{FsError, Result};

/// Default chunk size, 512 bytes.
pub const CHUNK_SIZE_BYTES: u64 = 512;

/// A segment of a file before it is placed on any node.
#[derive(Debug, Clone)]
pub struct ProtoChunk {
    pub index: u64,
    pub data: Bytes,
    pub checksum: String,
}

impl ProtoChunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A stored chunk, as recorded in the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub chunk_id: String,
    pub file_id: String,
    pub index: u64,
    pub size: u64,
    pub checksum: String,
    pub primary_node: NodeRef,
    pub replica_node: NodeRef,
}

impl ChunkDescriptor {
    /// The distinct nodes holding a copy of this chunk, primary first.
    pub fn copies(&self) -> Vec<NodeRef> {
        if self.primary_node == self.replica_node {
            vec![self.primary_node]
        } else {
            vec![self.primary_node, self.replica_node]
        }
    }
}

/// Key under which a chunk is stored on its nodes.
pub fn chunk_id(file_id: &str, index: u64) -> String {
    format!("{file_id}_chunk_{index}")
}

/// Split data into ordered segments of `chunk_size` bytes; the last one may be shorter.
/// Segments share the input buffer.
pub fn split(data: &Bytes, chunk_size: u64) -> Result<Vec<ProtoChunk>> {
    if chunk_size == 0 {
        return Err(FsError::InvalidArgument("chunk size must be greater than zero".to_string()));
    }
    let chunk_size = usize::try_from(chunk_size)
        .map_err(|_| FsError::InvalidArgument(format!("chunk size {chunk_size} too large")))?;

    let num_chunks = data.len().div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(num_chunks);

    for i in 0..num_chunks {
        let start = i * chunk_size;
        let end = std::cmp::min(start + chunk_size, data.len());
        let chunk_data = data.slice(start..end);
        let checksum = checksum(&chunk_data);
        chunks.push(ProtoChunk { index: i as u64, data: chunk_data, checksum });
    }

    Ok(chunks)
}
