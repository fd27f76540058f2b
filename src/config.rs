use std::path::{Path, PathBuf};
use std::time::Duration;
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use crate::error::{FsError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Human-readable chunk size, e.g. "512 B" or "64 KiB".
    pub chunk_size: String,
    pub nodes: Vec<NodeConfig>,
    pub rpc_timeout_ms: u64,
    pub transfer_workers: usize,
    pub read_cache_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub backend: NodeBackend,
}

/// How a node keeps its chunks under `data_dir`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeBackend {
    /// One file per chunk.
    #[default]
    File,
    /// A SQLite key-value table.
    Sqlite,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: "512 B".to_string(),
            nodes: (0..2)
                .map(|i| NodeConfig {
                    id: format!("node-{i}"),
                    data_dir: PathBuf::from(format!("./data/node-{i}")),
                    backend: NodeBackend::File,
                })
                .collect(),
            rpc_timeout_ms: 1000,
            transfer_workers: 4,
            read_cache_entries: 32,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| FsError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunk_size_bytes()?;
        if self.nodes.is_empty() {
            return Err(FsError::Config("at least one node is required".to_string()));
        }
        if self.transfer_workers == 0 {
            return Err(FsError::Config("transfer_workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn chunk_size_bytes(&self) -> Result<u64> {
        let size = Byte::parse_str(&self.chunk_size, true)
            .map_err(|e| FsError::Config(format!("chunk_size {:?}: {}", self.chunk_size, e)))?
            .as_u64();
        if size == 0 {
            return Err(FsError::Config("chunk_size must be greater than zero".to_string()));
        }
        Ok(size)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
