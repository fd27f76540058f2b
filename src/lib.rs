//! A small chunked file store.
//!
//! Files are split into fixed-size chunks. Each chunk is written to a primary
//! node and a replica node picked round-robin from a fixed pool, and a
//! namespace tree records, per file, the ordered chunk list and where each
//! copy lives.
//!
//! Upload flow:
//! - reserve the name in the current directory
//! - split the data, place every chunk, write primary then replica
//! - on any failed write, delete every copy written so far
//! - otherwise commit the file entry; it is visible from this point on
//!
//! Download reads each chunk from its primary and falls back to the replica
//! when the primary is unreachable or returns bytes that fail the checksum.

pub mod chunk;
pub mod chunkserver;
pub mod client;
pub mod common;
pub mod config;
pub mod error;
pub mod master;
pub mod placement;
pub mod shell;
pub mod transfer;

pub use client::Client;
pub use config::Config;
pub use error::{FsError, Result};
