//! In-memory directory tree.
//!
//! Inodes live in an arena keyed by [`InodeId`]. A directory owns its
//! children only by id, and every inode points back at its parent by id, so
//! the arena is the sole owner of all nodes. Each directory carries its own
//! lock: structural changes under one directory are serialized while the
//! rest of the tree stays available. Lock order is cursor, then directory
//! entries (ancestor before descendant), then the arena.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use crate::error::{FsError, Result};
use crate::master::file::FileMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(u64);

const ROOT: InodeId = InodeId(0);

struct Inode {
    parent: Option<InodeId>,
    kind: InodeKind,
}

enum InodeKind {
    Directory(Directory),
    File(Arc<FileMetadata>),
}

struct Directory {
    name: String,
    created_at: DateTime<Utc>,
    entries: RwLock<DirEntries>,
}

struct DirEntries {
    children: HashMap<String, InodeId>,
    /// Names held by in-flight uploads and deletes. Not listed, but taken.
    reserved: HashSet<String>,
    modified_at: DateTime<Utc>,
}

impl Directory {
    fn new(name: &str) -> Directory {
        let now = Utc::now();
        Directory {
            name: name.to_string(),
            created_at: now,
            entries: RwLock::new(DirEntries {
                children: HashMap::new(),
                reserved: HashSet::new(),
                modified_at: now,
            }),
        }
    }

    async fn metadata(&self) -> FileMetadata {
        let entries = self.entries.read().await;
        FileMetadata {
            modified_at: entries.modified_at,
            created_at: self.created_at,
            ..FileMetadata::directory(self.name.clone())
        }
    }
}

impl DirEntries {
    fn ensure_vacant(&self, name: &str) -> Result<()> {
        if self.children.contains_key(name) || self.reserved.contains(name) {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

impl Inode {
    fn as_directory(&self) -> Option<&Directory> {
        match &self.kind {
            InodeKind::Directory(dir) => Some(dir),
            InodeKind::File(_) => None,
        }
    }

    fn is_directory(&self) -> bool {
        self.as_directory().is_some()
    }

    fn name(&self) -> &str {
        match &self.kind {
            InodeKind::Directory(dir) => &dir.name,
            InodeKind::File(meta) => &meta.name,
        }
    }
}

/// A name held in a directory while its chunks are being written or removed.
/// Consumed by [`NamespaceTree::commit`] or [`NamespaceTree::release`].
#[must_use]
#[derive(Debug)]
pub struct Reservation {
    dir: InodeId,
    name: String,
}

impl Reservation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> InodeId {
        self.dir
    }
}

/// Reject names that cannot be a single path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument(format!("invalid name {name:?}")));
    }
    Ok(())
}

pub struct NamespaceTree {
    arena: RwLock<HashMap<InodeId, Arc<Inode>>>,
    next_id: AtomicU64,
    cursor: Mutex<InodeId>,
}

impl Default for NamespaceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceTree {
    pub fn new() -> NamespaceTree {
        let root = Inode {
            parent: None,
            kind: InodeKind::Directory(Directory::new("/")),
        };
        let mut arena = HashMap::new();
        arena.insert(ROOT, Arc::new(root));
        NamespaceTree {
            arena: RwLock::new(arena),
            next_id: AtomicU64::new(ROOT.0 + 1),
            cursor: Mutex::new(ROOT),
        }
    }

    fn allocate(&self) -> InodeId {
        InodeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn inode(&self, id: InodeId) -> Result<Arc<Inode>> {
        self.arena
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("inode {}", id.0)))
    }

    async fn directory(&self, id: InodeId) -> Result<Arc<Inode>> {
        let inode = self.inode(id).await?;
        if !inode.is_directory() {
            return Err(FsError::NotADirectory(inode.name().to_string()));
        }
        Ok(inode)
    }

    /// The directory the cursor points at.
    pub async fn current_dir(&self) -> InodeId {
        *self.cursor.lock().await
    }

    pub async fn mkdir(&self, name: &str) -> Result<()> {
        let dir = self.current_dir().await;
        self.mkdir_in(dir, name).await
    }

    pub async fn mkdir_in(&self, dir: InodeId, name: &str) -> Result<()> {
        validate_name(name)?;
        let parent = self.directory(dir).await?;
        let Some(parent_dir) = parent.as_directory() else {
            return Err(FsError::NotADirectory(parent.name().to_string()));
        };

        let mut entries = parent_dir.entries.write().await;
        entries.ensure_vacant(name)?;

        let id = self.allocate();
        let inode = Inode {
            parent: Some(dir),
            kind: InodeKind::Directory(Directory::new(name)),
        };
        self.arena.write().await.insert(id, Arc::new(inode));
        entries.children.insert(name.to_string(), id);
        entries.touch();

        debug!("mkdir {} in {}", name, parent.name());
        Ok(())
    }

    /// Move the cursor to a child directory, or to the parent with `..`.
    pub async fn cd(&self, name: &str) -> Result<()> {
        let mut cursor = self.cursor.lock().await;

        if name == ".." {
            let current = self.inode(*cursor).await?;
            return match current.parent {
                Some(parent) => {
                    *cursor = parent;
                    Ok(())
                }
                None => Err(FsError::AtRoot),
            };
        }

        validate_name(name)?;
        let current = self.directory(*cursor).await?;
        let Some(current_dir) = current.as_directory() else {
            return Err(FsError::NotADirectory(current.name().to_string()));
        };
        let entries = current_dir.entries.read().await;
        let id = *entries
            .children
            .get(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        if !self.inode(id).await?.is_directory() {
            return Err(FsError::NotADirectory(name.to_string()));
        }
        *cursor = id;
        Ok(())
    }

    /// Names of the committed entries in the current directory, sorted.
    pub async fn ls(&self) -> Result<Vec<String>> {
        let dir = self.current_dir().await;
        self.ls_in(dir).await
    }

    pub async fn ls_in(&self, dir: InodeId) -> Result<Vec<String>> {
        let inode = self.directory(dir).await?;
        let Some(directory) = inode.as_directory() else {
            return Err(FsError::NotADirectory(inode.name().to_string()));
        };
        let mut names: Vec<String> = directory.entries.read().await.children.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Insert a file under the current directory.
    pub async fn add_file(&self, metadata: FileMetadata) -> Result<()> {
        let dir = self.current_dir().await;
        self.add_file_in(dir, metadata).await
    }

    pub async fn add_file_in(&self, dir: InodeId, metadata: FileMetadata) -> Result<()> {
        validate_name(&metadata.name)?;
        let parent = self.directory(dir).await?;
        let Some(parent_dir) = parent.as_directory() else {
            return Err(FsError::NotADirectory(parent.name().to_string()));
        };
        let mut entries = parent_dir.entries.write().await;
        entries.ensure_vacant(&metadata.name)?;
        self.insert_file(dir, &mut entries, metadata).await;
        Ok(())
    }

    async fn insert_file(&self, dir: InodeId, entries: &mut DirEntries, metadata: FileMetadata) {
        let id = self.allocate();
        let name = metadata.name.clone();
        let inode = Inode {
            parent: Some(dir),
            kind: InodeKind::File(Arc::new(metadata)),
        };
        self.arena.write().await.insert(id, Arc::new(inode));
        entries.children.insert(name, id);
        entries.touch();
    }

    /// Hold `name` in `dir` so no other upload, mkdir or add can take it.
    pub async fn reserve(&self, dir: InodeId, name: &str) -> Result<Reservation> {
        validate_name(name)?;
        let parent = self.directory(dir).await?;
        let Some(parent_dir) = parent.as_directory() else {
            return Err(FsError::NotADirectory(parent.name().to_string()));
        };
        let mut entries = parent_dir.entries.write().await;
        entries.ensure_vacant(name)?;
        entries.reserved.insert(name.to_string());
        Ok(Reservation { dir, name: name.to_string() })
    }

    /// Drop a reservation without creating an entry.
    pub async fn release(&self, reservation: Reservation) {
        let Ok(parent) = self.directory(reservation.dir).await else {
            return;
        };
        if let Some(parent_dir) = parent.as_directory() {
            parent_dir.entries.write().await.reserved.remove(&reservation.name);
        }
    }

    /// Turn a reservation into a visible file entry.
    pub async fn commit(&self, reservation: Reservation, metadata: FileMetadata) -> Result<()> {
        if metadata.name != reservation.name {
            let err = FsError::InvalidArgument(format!(
                "metadata name {} does not match reservation {}",
                metadata.name, reservation.name
            ));
            self.release(reservation).await;
            return Err(err);
        }
        let parent = self.directory(reservation.dir).await?;
        let Some(parent_dir) = parent.as_directory() else {
            return Err(FsError::NotADirectory(parent.name().to_string()));
        };
        let mut entries = parent_dir.entries.write().await;
        entries.reserved.remove(&reservation.name);
        if entries.children.contains_key(&reservation.name) {
            return Err(FsError::AlreadyExists(reservation.name));
        }
        self.insert_file(reservation.dir, &mut entries, metadata).await;
        Ok(())
    }

    /// Detach a file from the current directory.
    pub async fn remove_file(&self, name: &str) -> Result<Arc<FileMetadata>> {
        let dir = self.current_dir().await;
        let (metadata, reservation) = self.detach_file(dir, name).await?;
        self.release(reservation).await;
        Ok(metadata)
    }

    /// Detach a file and keep its name reserved until the caller releases it.
    pub async fn detach_file(&self, dir: InodeId, name: &str) -> Result<(Arc<FileMetadata>, Reservation)> {
        validate_name(name)?;
        let parent = self.directory(dir).await?;
        let Some(parent_dir) = parent.as_directory() else {
            return Err(FsError::NotADirectory(parent.name().to_string()));
        };
        let mut entries = parent_dir.entries.write().await;
        let id = *entries
            .children
            .get(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;

        let mut arena = self.arena.write().await;
        let metadata = match arena.get(&id).map(|inode| &inode.kind) {
            Some(InodeKind::File(metadata)) => metadata.clone(),
            Some(InodeKind::Directory(_)) => return Err(FsError::IsDirectory(name.to_string())),
            None => return Err(FsError::NotFound(name.to_string())),
        };
        arena.remove(&id);
        drop(arena);

        entries.children.remove(name);
        entries.reserved.insert(name.to_string());
        entries.touch();
        debug!("detached {} from {}", name, parent.name());
        Ok((metadata, Reservation { dir, name: name.to_string() }))
    }

    /// Metadata of an entry in the current directory, chunks in index order.
    pub async fn get_metadata(&self, name: &str) -> Result<Arc<FileMetadata>> {
        let dir = self.current_dir().await;
        self.get_metadata_in(dir, name).await
    }

    pub async fn get_metadata_in(&self, dir: InodeId, name: &str) -> Result<Arc<FileMetadata>> {
        validate_name(name)?;
        let parent = self.directory(dir).await?;
        let Some(parent_dir) = parent.as_directory() else {
            return Err(FsError::NotADirectory(parent.name().to_string()));
        };
        let entries = parent_dir.entries.read().await;
        let id = *entries
            .children
            .get(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        let inode = self.inode(id).await?;
        match &inode.kind {
            InodeKind::File(metadata) => Ok(metadata.clone()),
            InodeKind::Directory(directory) => Ok(Arc::new(directory.metadata().await)),
        }
    }

    /// Absolute path of the current directory.
    pub async fn pwd(&self) -> Result<String> {
        let dir = self.current_dir().await;
        self.path_of(dir).await
    }

    pub async fn path_of(&self, dir: InodeId) -> Result<String> {
        let mut components = Vec::new();
        let mut next = Some(dir);
        while let Some(id) = next {
            let inode = self.inode(id).await?;
            if inode.parent.is_some() {
                components.push(inode.name().to_string());
            }
            next = inode.parent;
        }
        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }

    /// Identifier for a file: its full path, unique across directories.
    pub async fn file_id(&self, dir: InodeId, name: &str) -> Result<String> {
        let path = self.path_of(dir).await?;
        if path.ends_with('/') {
            Ok(format!("{path}{name}"))
        } else {
            Ok(format!("{path}/{name}"))
        }
    }
}
