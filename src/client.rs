//! Upload, download and delete across the node pool.
//!
//! An upload writes every chunk to its primary and then its replica. Each
//! successful copy is appended to a rollback log; if any write fails, every
//! logged copy is deleted and the namespace is left untouched. The file
//! becomes visible only when the namespace commit succeeds.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::chunk::{self, ChunkDescriptor, ProtoChunk};
use crate::common::{verify_checksum, NodePool, NodeRef};
use crate::config::Config;
use crate::error::{FsError, Result};
use crate::master::{FileMetadata, InodeId, NamespaceTree};
use crate::placement::{place, Placement};
use crate::transfer::{next_result, TransferPool};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub chunk_size: u64,
    pub rpc_timeout: Duration,
    pub transfer_workers: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            chunk_size: chunk::CHUNK_SIZE_BYTES,
            rpc_timeout: Duration::from_secs(1),
            transfer_workers: 4,
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            chunk_size: config.chunk_size_bytes()?,
            rpc_timeout: config.rpc_timeout(),
            transfer_workers: config.transfer_workers,
        })
    }
}

/// Lifecycle of one chunk during an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWriteState {
    Pending,
    PrimaryWritten,
    ReplicaWritten,
    Committed,
    Failed,
    RollingBack,
    RolledBack,
}

impl fmt::Display for ChunkWriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub chunks: usize,
    pub copies_deleted: usize,
    pub copies_failed: usize,
}

/// A chunk copy that landed on a node and must be removed if the upload aborts.
#[derive(Debug, Clone)]
struct WrittenCopy {
    chunk_index: u64,
    chunk_id: String,
    node: NodeRef,
}

#[derive(Default)]
struct RollbackLog {
    copies: Mutex<Vec<WrittenCopy>>,
}

impl RollbackLog {
    async fn record(&self, copy: WrittenCopy) {
        self.copies.lock().await.push(copy);
    }

    async fn take(&self) -> Vec<WrittenCopy> {
        std::mem::take(&mut *self.copies.lock().await)
    }
}

struct ChunkWriteOutcome {
    index: u64,
    state: ChunkWriteState,
    result: Result<ChunkDescriptor>,
}

/// Run a node call under the per-call timeout. A timeout counts as the node being unreachable.
async fn call_node<T>(node: NodeRef, timeout: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(FsError::node_unavailable(node.to_string(), format!("timed out after {timeout:?}"))),
    }
}

async fn write_chunk(
    nodes: Arc<NodePool>,
    file_id: String,
    piece: ProtoChunk,
    placement: Placement,
    timeout: Duration,
    abort: CancellationToken,
    log: Arc<RollbackLog>,
) -> ChunkWriteOutcome {
    let chunk_id = chunk::chunk_id(&file_id, piece.index);
    let mut state = ChunkWriteState::Pending;

    let mut targets = vec![(placement.primary, ChunkWriteState::PrimaryWritten)];
    if placement.is_redundant() {
        targets.push((placement.replica, ChunkWriteState::ReplicaWritten));
    }

    for (node, next_state) in targets {
        if abort.is_cancelled() {
            return ChunkWriteOutcome { index: piece.index, state, result: Err(FsError::Cancelled) };
        }

        let written = match nodes.resolve(node) {
            Ok(client) => call_node(node, timeout, client.write(&chunk_id, piece.data.clone())).await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!("write of {} to {} failed in state {}: {}", chunk_id, node, state, e);
            // A timed-out write may still land on the node after we give up on it.
            log.record(WrittenCopy { chunk_index: piece.index, chunk_id: chunk_id.clone(), node }).await;
            return ChunkWriteOutcome { index: piece.index, state: ChunkWriteState::Failed, result: Err(e) };
        }

        log.record(WrittenCopy { chunk_index: piece.index, chunk_id: chunk_id.clone(), node }).await;
        state = next_state;
        debug!("{} -> {} on {}", chunk_id, state, node);
    }

    // A single-node pool holds one copy; it still counts as fully written.
    state = ChunkWriteState::ReplicaWritten;

    ChunkWriteOutcome {
        index: piece.index,
        state,
        result: Ok(ChunkDescriptor {
            chunk_id,
            file_id,
            index: piece.index,
            size: piece.len(),
            checksum: piece.checksum,
            primary_node: placement.primary,
            replica_node: placement.replica,
        }),
    }
}

async fn read_copy(nodes: &NodePool, desc: &ChunkDescriptor, node: NodeRef, timeout: Duration) -> Result<Bytes> {
    let client = nodes.resolve(node)?;
    let data = call_node(node, timeout, client.read(&desc.chunk_id)).await?;
    verify_checksum(&desc.chunk_id, &data, &desc.checksum)?;
    Ok(data)
}

/// Read a chunk from its primary, falling back once to the replica.
async fn read_chunk(nodes: Arc<NodePool>, desc: ChunkDescriptor, timeout: Duration) -> Result<(u64, Bytes)> {
    for node in [desc.primary_node, desc.replica_node] {
        match read_copy(&nodes, &desc, node, timeout).await {
            Ok(data) => return Ok((desc.index, data)),
            Err(e) => warn!("read of {} from {} failed: {}", desc.chunk_id, node, e),
        }
    }
    Err(FsError::ChunkUnavailable { chunk_id: desc.chunk_id })
}

async fn delete_copy(nodes: Arc<NodePool>, chunk_id: String, node: NodeRef, timeout: Duration) -> Result<()> {
    let client = nodes.resolve(node)?;
    call_node(node, timeout, client.delete(&chunk_id)).await
}

pub struct Client {
    namespace: Arc<NamespaceTree>,
    nodes: Arc<NodePool>,
    transfers: TransferPool,
    options: ClientOptions,
}

impl Client {
    pub fn new(namespace: Arc<NamespaceTree>, nodes: NodePool, options: ClientOptions) -> Client {
        Client {
            namespace,
            nodes: Arc::new(nodes),
            transfers: TransferPool::new(options.transfer_workers),
            options,
        }
    }

    pub fn namespace(&self) -> &NamespaceTree {
        &self.namespace
    }

    pub fn nodes(&self) -> &NodePool {
        &self.nodes
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// List the current directory.
    pub async fn ls(&self) -> Result<Vec<String>> {
        self.namespace.ls().await
    }

    pub async fn cd(&self, name: &str) -> Result<()> {
        self.namespace.cd(name).await
    }

    pub async fn mkdir(&self, name: &str) -> Result<()> {
        self.namespace.mkdir(name).await
    }

    pub async fn pwd(&self) -> Result<String> {
        self.namespace.pwd().await
    }

    pub async fn meta(&self, name: &str) -> Result<Arc<FileMetadata>> {
        self.namespace.get_metadata(name).await
    }

    /// Store `data` as `filename` in the current directory.
    pub async fn upload(&self, filename: &str, data: Bytes) -> Result<Arc<FileMetadata>> {
        self.upload_with(filename, data, self.options.chunk_size, &CancellationToken::new()).await
    }

    pub async fn upload_with(
        &self,
        filename: &str,
        data: Bytes,
        chunk_size: u64,
        cancel: &CancellationToken,
    ) -> Result<Arc<FileMetadata>> {
        // The target directory is fixed here; a later cd does not move the commit.
        let dir = self.namespace.current_dir().await;
        let reservation = self.namespace.reserve(dir, filename).await?;

        let chunks = match self.write_chunks(dir, filename, data, chunk_size, cancel).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.namespace.release(reservation).await;
                return Err(e);
            }
        };

        let metadata = FileMetadata::file(filename, chunks);
        let committed = Arc::new(metadata.clone());
        if let Err(e) = self.namespace.commit(reservation, metadata).await {
            warn!("commit of {} failed: {}", filename, e);
            let copies = committed
                .chunks
                .iter()
                .flat_map(|desc| {
                    desc.copies().into_iter().map(move |node| WrittenCopy {
                        chunk_index: desc.index,
                        chunk_id: desc.chunk_id.clone(),
                        node,
                    })
                })
                .collect();
            self.rollback(copies).await;
            return Err(e);
        }

        debug!("{} chunks of {} {}", committed.chunks.len(), filename, ChunkWriteState::Committed);
        info!("uploaded {} ({} bytes, {} chunks)", filename, committed.size, committed.chunks.len());
        Ok(committed)
    }

    async fn write_chunks(
        &self,
        dir: InodeId,
        filename: &str,
        data: Bytes,
        chunk_size: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkDescriptor>> {
        let file_id = self.namespace.file_id(dir, filename).await?;
        let pieces = chunk::split(&data, chunk_size)?;
        let node_count = self.nodes.len();
        let total = pieces.len();

        let abort = cancel.child_token();
        let log = Arc::new(RollbackLog::default());
        let mut tasks = JoinSet::new();

        for piece in pieces {
            let placement = place(piece.index, node_count)?;
            self.transfers.dispatch(
                &mut tasks,
                write_chunk(
                    self.nodes.clone(),
                    file_id.clone(),
                    piece,
                    placement,
                    self.options.rpc_timeout,
                    abort.clone(),
                    log.clone(),
                ),
            );
        }

        let mut descriptors = Vec::with_capacity(total);
        let mut failure: Option<(u64, FsError)> = None;

        while let Some(joined) = next_result(&mut tasks).await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => ChunkWriteOutcome { index: 0, state: ChunkWriteState::Failed, result: Err(e) },
            };
            match outcome.result {
                Ok(desc) => descriptors.push(desc),
                Err(e) => {
                    debug!("chunk {} of {} ended in {}", outcome.index, file_id, outcome.state);
                    // Keep the first real failure; later ones are usually just the abort.
                    let replace = match &failure {
                        None => true,
                        Some((_, FsError::Cancelled)) => !matches!(e, FsError::Cancelled),
                        Some(_) => false,
                    };
                    if replace {
                        failure = Some((outcome.index, e));
                    }
                    abort.cancel();
                }
            }
        }

        // Every write may have landed before the caller cancelled; nothing is committed then either.
        if failure.is_none() && cancel.is_cancelled() {
            failure = Some((0, FsError::Cancelled));
        }

        if let Some((chunk_index, err)) = failure {
            let rolled_back = self.rollback(log.take().await).await;
            if cancel.is_cancelled() {
                info!("upload of {} cancelled, {} copies rolled back", file_id, rolled_back);
                return Err(FsError::Cancelled);
            }
            return Err(FsError::PartialWriteFailure {
                file: file_id,
                chunk_index,
                reason: err.to_string(),
                rolled_back,
            });
        }

        descriptors.sort_by_key(|desc| desc.index);
        Ok(descriptors)
    }

    /// Best-effort removal of copies written by an aborted upload. Returns how many were deleted.
    async fn rollback(&self, copies: Vec<WrittenCopy>) -> usize {
        let mut by_chunk: BTreeMap<u64, Vec<WrittenCopy>> = BTreeMap::new();
        for copy in copies {
            by_chunk.entry(copy.chunk_index).or_default().push(copy);
        }

        let mut deleted = 0;
        for (index, copies) in by_chunk {
            debug!("chunk {} -> {}", index, ChunkWriteState::RollingBack);
            for copy in copies {
                match delete_copy(self.nodes.clone(), copy.chunk_id.clone(), copy.node, self.options.rpc_timeout).await {
                    Ok(()) => deleted += 1,
                    // The failed write never reached the node.
                    Err(FsError::NotFound(_)) => {}
                    Err(e) => warn!("rollback of {} on {} failed: {}", copy.chunk_id, copy.node, e),
                }
            }
            debug!("chunk {} -> {}", index, ChunkWriteState::RolledBack);
        }
        deleted
    }

    /// Fetch and reassemble `filename` from the current directory.
    pub async fn download(&self, filename: &str) -> Result<Bytes> {
        self.download_with(filename, &CancellationToken::new()).await
    }

    pub async fn download_with(&self, filename: &str, cancel: &CancellationToken) -> Result<Bytes> {
        let metadata = self.namespace.get_metadata(filename).await?;
        if metadata.is_directory {
            return Err(FsError::IsDirectory(filename.to_string()));
        }

        let mut tasks = JoinSet::new();
        for desc in metadata.chunks.iter().cloned() {
            self.transfers.dispatch(&mut tasks, read_chunk(self.nodes.clone(), desc, self.options.rpc_timeout));
        }

        let mut parts: BTreeMap<u64, Bytes> = BTreeMap::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = next_result(&mut tasks) => Some(joined),
            };
            let Some(next) = next else {
                tasks.abort_all();
                return Err(FsError::Cancelled);
            };
            let Some(joined) = next else { break };
            match joined.and_then(|read| read) {
                Ok((index, data)) => {
                    parts.insert(index, data);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        let mut body = BytesMut::with_capacity(metadata.size as usize);
        for data in parts.into_values() {
            body.extend_from_slice(&data);
        }
        if body.len() as u64 != metadata.size {
            return Err(FsError::Internal(format!(
                "{} reassembled to {} bytes, expected {}",
                filename,
                body.len(),
                metadata.size
            )));
        }

        info!("downloaded {} ({} bytes)", filename, body.len());
        Ok(body.freeze())
    }

    /// Remove `filename` from the namespace, then delete its copies best-effort.
    pub async fn delete(&self, filename: &str) -> Result<DeleteReport> {
        let dir = self.namespace.current_dir().await;
        let (metadata, reservation) = self.namespace.detach_file(dir, filename).await?;

        let mut tasks = JoinSet::new();
        for desc in &metadata.chunks {
            for node in desc.copies() {
                let (nodes, chunk_id, timeout) = (self.nodes.clone(), desc.chunk_id.clone(), self.options.rpc_timeout);
                self.transfers.dispatch(&mut tasks, async move {
                    delete_copy(nodes, chunk_id.clone(), node, timeout)
                        .await
                        .inspect_err(|e| warn!("delete of {} on {} failed: {}", chunk_id, node, e))
                });
            }
        }

        let mut report = DeleteReport { chunks: metadata.chunks.len(), ..DeleteReport::default() };
        while let Some(joined) = next_result(&mut tasks).await {
            match joined.and_then(|deleted| deleted) {
                Ok(()) => report.copies_deleted += 1,
                Err(_) => report.copies_failed += 1,
            }
        }

        self.namespace.release(reservation).await;

        if report.copies_failed > 0 {
            warn!("{} copies of {} could not be deleted", report.copies_failed, filename);
        }
        info!("deleted {} ({} chunks)", filename, report.chunks);
        Ok(report)
    }
}
