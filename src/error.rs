use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Already at root")]
    AtRoot,

    #[error("Node {node} unavailable: {reason}")]
    NodeUnavailable { node: String, reason: String },

    #[error("Chunk {chunk_id} unavailable on primary and replica")]
    ChunkUnavailable { chunk_id: String },

    #[error("Upload of {file} failed at chunk {chunk_index}: {reason} ({rolled_back} copies rolled back)")]
    PartialWriteFailure {
        file: String,
        chunk_index: u64,
        reason: String,
        rolled_back: usize,
    },

    #[error("Checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FsError {
    pub fn node_unavailable(node: impl Into<String>, reason: impl ToString) -> Self {
        FsError::NodeUnavailable {
            node: node.into(),
            reason: reason.to_string(),
        }
    }
}
