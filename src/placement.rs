use crate::common::NodeRef;
use crate::error::{FsError, Result};

/// Nodes assigned to hold the two copies of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub primary: NodeRef,
    pub replica: NodeRef,
}

impl Placement {
    /// False when the pool has a single node and both copies land on it.
    pub fn is_redundant(&self) -> bool {
        self.primary != self.replica
    }
}

/// Round-robin placement: the primary walks the pool by chunk index and the
/// replica sits on the next node over.
pub fn place(chunk_index: u64, node_count: usize) -> Result<Placement> {
    if node_count == 0 {
        return Err(FsError::InvalidArgument("node pool is empty".to_string()));
    }
    let n = node_count as u64;
    let primary = chunk_index % n;
    let replica = (primary + 1) % n;
    Ok(Placement {
        primary: NodeRef(primary as usize),
        replica: NodeRef(replica as usize),
    })
}
