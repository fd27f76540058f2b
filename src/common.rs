use std::fmt;
use std::sync::Arc;
use serde::{Serialize, Deserialize};
use sha2::Digest;
use crate::chunkserver::NodeClient;
use crate::error::{FsError, Result};

/// Hex-encoded SHA256 digest of a chunk's bytes.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the digest recorded for it.
pub fn verify_checksum(key: &str, data: &[u8], expected: &str) -> Result<()> {
    let actual = checksum(data);
    if actual != expected {
        return Err(FsError::ChecksumMismatch {
            key: key.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Position of a storage node in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef(pub usize);

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The fixed set of storage nodes. Built once at startup, never resized.
#[derive(Clone, Default)]
pub struct NodePool {
    nodes: Vec<Arc<dyn NodeClient>>,
}

impl NodePool {
    pub fn new() -> NodePool {
        NodePool { nodes: Vec::new() }
    }

    pub fn add_node(&mut self, node: Arc<dyn NodeClient>) -> NodeRef {
        self.nodes.push(node);
        NodeRef(self.nodes.len() - 1)
    }

    pub fn get_node(&self, node: NodeRef) -> Option<Arc<dyn NodeClient>> {
        self.nodes.get(node.0).cloned()
    }

    /// Resolve a node, treating an unknown reference as an unreachable node.
    pub fn resolve(&self, node: NodeRef) -> Result<Arc<dyn NodeClient>> {
        self.get_node(node)
            .ok_or_else(|| FsError::node_unavailable(node.to_string(), "not in node pool"))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeRef, &Arc<dyn NodeClient>)> {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeRef(i), node))
    }
}

impl FromIterator<Arc<dyn NodeClient>> for NodePool {
    fn from_iter<I: IntoIterator<Item = Arc<dyn NodeClient>>>(iter: I) -> Self {
        NodePool { nodes: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = checksum(b"hello world");
        assert_eq!(a, checksum(b"hello world"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, checksum(b"hello world!"));
    }

    #[test]
    fn test_verify_checksum_reports_mismatch() {
        let sum = checksum(b"abc");
        assert!(verify_checksum("k", b"abc", &sum).is_ok());
        match verify_checksum("k", b"abd", &sum) {
            Err(FsError::ChecksumMismatch { key, expected, .. }) => {
                assert_eq!(key, "k");
                assert_eq!(expected, sum);
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_node_is_unavailable() {
        let pool = NodePool::new();
        assert!(pool.is_empty());
        assert!(matches!(pool.resolve(NodeRef(3)), Err(FsError::NodeUnavailable { .. })));
    }
}
