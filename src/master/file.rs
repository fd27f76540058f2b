use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::chunk::ChunkDescriptor;

/// Metadata for a namespace entry. Only files own chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub chunks: Vec<ChunkDescriptor>,
}

impl FileMetadata {
    /// Metadata for a file made of `chunks`, given in index order.
    pub fn file(name: impl Into<String>, chunks: Vec<ChunkDescriptor>) -> FileMetadata {
        let now = Utc::now();
        FileMetadata {
            name: name.into(),
            is_directory: false,
            size: chunks.iter().map(|c| c.size).sum(),
            created_at: now,
            modified_at: now,
            chunks,
        }
    }

    pub fn directory(name: impl Into<String>) -> FileMetadata {
        let now = Utc::now();
        FileMetadata {
            name: name.into(),
            is_directory: true,
            size: 0,
            created_at: now,
            modified_at: now,
            chunks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeRef;

    #[test]
    fn test_file_size_is_sum_of_chunks() {
        let chunks = (0..3)
            .map(|i| ChunkDescriptor {
                chunk_id: format!("/f_chunk_{i}"),
                file_id: "/f".into(),
                index: i,
                size: if i < 2 { 512 } else { 76 },
                checksum: String::new(),
                primary_node: NodeRef(0),
                replica_node: NodeRef(1),
            })
            .collect();
        let meta = FileMetadata::file("f", chunks);
        assert!(!meta.is_directory);
        assert_eq!(meta.size, 1100);
    }

    #[test]
    fn test_directory_owns_no_chunks() {
        let meta = FileMetadata::directory("docs");
        assert!(meta.is_directory);
        assert!(meta.chunks.is_empty());
        assert_eq!(meta.size, 0);
    }
}
