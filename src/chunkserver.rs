use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use lru::LruCache;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use crate::common::checksum;
use crate::error::{FsError, Result};

mod sqlite;

pub use sqlite::SqliteChunkserver;

/// What the orchestrator can ask of a single storage node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    fn id(&self) -> &str;

    async fn write(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fails with `NotFound` when the node holds no such key.
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Fails with `NotFound` when the node holds no such key.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self) -> Result<BTreeSet<String>>;
}

const CHUNK_FILE_PREFIX: &str = "ch";
const TEMP_EXTENSION: &str = "tmp";
const CRC_LEN: usize = 4;
const KEY_LEN_LEN: usize = 4;
const HEADER_LEN: usize = CRC_LEN + KEY_LEN_LEN;

/// Recently read chunks. `generation` moves on every write or delete so a
/// read that raced one of them does not cache what it saw.
struct ReadCache {
    entries: LruCache<String, Bytes>,
    generation: u64,
}

/// Flat-file chunkserver: one file per chunk under the storage directory.
///
/// File names are a digest of the key so that any key fits the file system's
/// name limit. Each file carries its key and a CRC32 over key and contents.
pub struct LocalChunkserver {
    pub id: String,

    /// The path to the chunkserver storage directory.
    storage_dir: PathBuf,

    lru_cache: Option<Mutex<ReadCache>>,
}

impl LocalChunkserver {
    pub fn new(id: impl Into<String>, storage_dir: impl AsRef<Path>, cache_entries: usize) -> Result<LocalChunkserver> {
        let id = id.into();
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;
        sweep_temp_files(&id, &storage_dir)?;

        Ok(LocalChunkserver {
            id,
            storage_dir,
            lru_cache: NonZeroUsize::new(cache_entries).map(|cap| {
                Mutex::new(ReadCache {
                    entries: LruCache::new(cap),
                    generation: 0,
                })
            }),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn chunk_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(format!("{CHUNK_FILE_PREFIX}{}", checksum(key.as_bytes())))
    }

    async fn cache_get(&self, key: &str) -> Option<Bytes> {
        let cache = self.lru_cache.as_ref()?;
        cache.lock().await.entries.get(key).cloned()
    }

    async fn cache_generation(&self) -> u64 {
        match &self.lru_cache {
            Some(cache) => cache.lock().await.generation,
            None => 0,
        }
    }

    /// Cache `data` unless a write or delete happened since `generation` was taken.
    async fn cache_put(&self, key: &str, data: Bytes, generation: u64) {
        if let Some(cache) = &self.lru_cache {
            let mut cache = cache.lock().await;
            if cache.generation == generation {
                cache.entries.put(key.to_string(), data);
            }
        }
    }

    /// Must run after the file system change it accounts for.
    async fn cache_evict(&self, key: &str) {
        if let Some(cache) = &self.lru_cache {
            let mut cache = cache.lock().await;
            cache.entries.pop(key);
            cache.generation += 1;
        }
    }

    fn map_io(&self, key: &str, err: std::io::Error) -> FsError {
        if err.kind() == ErrorKind::NotFound {
            FsError::NotFound(format!("{key} on {}", self.id))
        } else {
            FsError::Io(err)
        }
    }

    /// Read the key stored in a chunk file's header.
    async fn stored_key(path: &Path) -> Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header).await?;
        let key_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut key = vec![0u8; key_len];
        file.read_exact(&mut key).await?;
        String::from_utf8(key).map_err(|e| FsError::Internal(format!("{}: {}", path.display(), e)))
    }
}

/// Remove temp files left behind by writes that never reached the rename.
fn sweep_temp_files(id: &str, storage_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(storage_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
            std::fs::remove_file(&path)?;
            debug!("{} removed stale {}", id, path.display());
        }
    }
    Ok(())
}

fn encode_frame(key: &str, data: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + key.len() + data.len());
    frame.put_u32_le(0);
    frame.put_u32_le(key.len() as u32);
    frame.put_slice(key.as_bytes());
    frame.put_slice(data);
    let crc = crc32fast::hash(&frame[CRC_LEN..]);
    frame[..CRC_LEN].copy_from_slice(&crc.to_le_bytes());
    frame.freeze()
}

fn decode_frame(key: &str, frame: Vec<u8>) -> Result<Bytes> {
    let corrupt = |expected: String, actual: String| FsError::ChecksumMismatch {
        key: key.to_string(),
        expected,
        actual,
    };

    if frame.len() < HEADER_LEN {
        return Err(corrupt("chunk header".to_string(), format!("{} bytes", frame.len())));
    }
    let mut frame = Bytes::from(frame);
    let header = frame.split_to(CRC_LEN);
    let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let actual = crc32fast::hash(&frame);
    if expected != actual {
        return Err(corrupt(format!("{expected:08x}"), format!("{actual:08x}")));
    }

    let key_len = frame.split_to(KEY_LEN_LEN);
    let key_len = u32::from_le_bytes([key_len[0], key_len[1], key_len[2], key_len[3]]) as usize;
    if frame.len() < key_len {
        return Err(corrupt(format!("{key_len} key bytes"), format!("{} bytes", frame.len())));
    }
    let stored = frame.split_to(key_len);
    if stored != key.as_bytes() {
        return Err(corrupt(key.to_string(), String::from_utf8_lossy(&stored).into_owned()));
    }
    Ok(frame)
}

#[async_trait]
impl NodeClient for LocalChunkserver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        let chunk_path = self.chunk_path(key);
        let temp_path = chunk_path.with_extension(TEMP_EXTENSION);

        // Write to a temporary file first, then rename.
        fs::write(&temp_path, encode_frame(key, &data)).await?;
        fs::rename(&temp_path, &chunk_path).await?;
        self.cache_evict(key).await;

        debug!("{} stored {} ({} bytes)", self.id, key, data.len());
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        if let Some(data) = self.cache_get(key).await {
            return Ok(data);
        }

        let generation = self.cache_generation().await;
        let frame = fs::read(self.chunk_path(key)).await.map_err(|e| self.map_io(key, e))?;
        let data = decode_frame(key, frame).inspect_err(|e| warn!("{} holds a corrupt copy: {}", self.id, e))?;
        self.cache_put(key, data.clone(), generation).await;
        Ok(data)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = fs::remove_file(self.chunk_path(key)).await;
        self.cache_evict(key).await;
        removed.map_err(|e| self.map_io(key, e))?;
        debug!("{} deleted {}", self.id, key);
        Ok(())
    }

    async fn list(&self) -> Result<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        let mut entries = fs::read_dir(&self.storage_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_chunk = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(CHUNK_FILE_PREFIX))
                .is_some_and(|digest| digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()));
            if !is_chunk {
                continue;
            }
            match Self::stored_key(&path).await {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(e) => warn!("{} ignoring stray file {}: {}", self.id, path.display(), e),
            }
        }
        Ok(keys)
    }
}

/// Key-value chunkserver held entirely in memory.
#[derive(Default)]
pub struct MemoryChunkserver {
    pub id: String,
    chunks: RwLock<HashMap<String, Bytes>>,
}

impl MemoryChunkserver {
    pub fn new(id: impl Into<String>) -> MemoryChunkserver {
        MemoryChunkserver {
            id: id.into(),
            chunks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chunks.read().await.is_empty()
    }
}

#[async_trait]
impl NodeClient for MemoryChunkserver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        self.chunks.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        self.chunks
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("{key} on {}", self.id)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.chunks
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(format!("{key} on {}", self.id)))
    }

    async fn list(&self) -> Result<BTreeSet<String>> {
        Ok(self.chunks.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let node = LocalChunkserver::new("node-0", dir.path(), 4).unwrap();

        node.write("/a/f_chunk_0", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(node.read("/a/f_chunk_0").await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            node.list().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["/a/f_chunk_0".to_string()]
        );

        node.delete("/a/f_chunk_0").await.unwrap();
        assert!(matches!(node.read("/a/f_chunk_0").await, Err(FsError::NotFound(_))));
        assert!(matches!(node.delete("/a/f_chunk_0").await, Err(FsError::NotFound(_))));
        assert!(node.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_overwrite_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let node = LocalChunkserver::new("node-0", dir.path(), 4).unwrap();

        node.write("k", Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(node.read("k").await.unwrap(), Bytes::from_static(b"one"));
        node.write("k", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(node.read("k").await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_local_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let node = LocalChunkserver::new("node-0", dir.path(), 0).unwrap();
        node.write("k", Bytes::from_static(b"payload")).await.unwrap();

        let path = node.chunk_path("k");
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        assert!(matches!(node.read("k").await, Err(FsError::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn test_local_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let node = LocalChunkserver::new("node-0", dir.path(), 4).unwrap();
        node.write("empty", Bytes::new()).await.unwrap();
        assert!(node.read("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_long_keys_fit_file_name_limit() {
        let dir = tempfile::tempdir().unwrap();
        let node = LocalChunkserver::new("node-0", dir.path(), 4).unwrap();

        let long_name = format!("/{}_chunk_0", "n".repeat(200));
        let deep_path = format!("{}/f_chunk_3", "/nested-directory".repeat(20));
        for key in [&long_name, &deep_path] {
            node.write(key, Bytes::from_static(b"data")).await.unwrap();
            assert_eq!(node.read(key).await.unwrap(), Bytes::from_static(b"data"));
        }

        let keys = node.list().await.unwrap();
        assert!(keys.contains(&long_name));
        assert!(keys.contains(&deep_path));
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_local_startup_removes_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let node = LocalChunkserver::new("node-0", dir.path(), 0).unwrap();
            node.write("kept", Bytes::from_static(b"v")).await.unwrap();
        }
        let stale = dir.path().join(format!("{CHUNK_FILE_PREFIX}deadbeef.{TEMP_EXTENSION}"));
        std::fs::write(&stale, b"half a chunk").unwrap();
        std::fs::write(dir.path().join("chunks.db"), b"not a chunk").unwrap();

        let node = LocalChunkserver::new("node-0", dir.path(), 0).unwrap();
        assert!(!stale.exists());
        assert_eq!(node.list().await.unwrap().into_iter().collect::<Vec<_>>(), vec!["kept".to_string()]);
        assert_eq!(node.read("kept").await.unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_local_read_racing_a_write_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let node = LocalChunkserver::new("node-0", dir.path(), 4).unwrap();
        node.write("k", Bytes::from_static(b"old")).await.unwrap();

        // A read picks up the old bytes, then a write lands before it caches them.
        let generation = node.cache_generation().await;
        node.write("k", Bytes::from_static(b"new")).await.unwrap();
        node.cache_put("k", Bytes::from_static(b"old"), generation).await;
        assert_eq!(node.read("k").await.unwrap(), Bytes::from_static(b"new"));

        // Same for a delete.
        let generation = node.cache_generation().await;
        node.delete("k").await.unwrap();
        node.cache_put("k", Bytes::from_static(b"new"), generation).await;
        assert!(matches!(node.read("k").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_node() {
        let node = MemoryChunkserver::new("mem-0");
        node.write("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(node.len().await, 1);
        assert_eq!(node.read("k").await.unwrap(), Bytes::from_static(b"v"));
        node.delete("k").await.unwrap();
        assert!(node.is_empty().await);
        assert!(matches!(node.read("k").await, Err(FsError::NotFound(_))));
    }
}
