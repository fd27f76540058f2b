//! Namespace metadata: which files exist, where, and which chunks make them up.

pub mod file;
pub mod namespace;

pub use file::FileMetadata;
pub use namespace::{InodeId, NamespaceTree, Reservation};
