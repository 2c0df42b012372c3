//! Cairn Storage Engine - local multi-shard object storage
//!
//! This crate implements the storage side of a Cairn node:
//! - Blob storage (small-object database + file tree, optional zstd)
//! - Metabase: object index, graveyard, expiration and lock records
//! - Write-cache staging writes in front of the blob store
//! - Shards with an epoch-driven garbage collector
//! - The storage engine orchestrating inhume, placement and lock expiry
//!   across shards

pub mod blobovnicza;
pub mod blobstor;
pub mod engine;
pub mod error;
pub mod fstree;
pub mod metabase;
pub mod shard;
pub mod util;
pub mod writecache;

// Re-exports
pub use blobstor::{BlobStor, PutPrm, StorageId};
pub use engine::{HashedShard, InhumePrm, ShardOrder, StorageEngine};
pub use error::{Result, StorageError};
pub use metabase::{Grave, Metabase};
pub use shard::{Event, EventKind, Shard, ShardCallbacks, ShardInfo};
pub use writecache::{FlushStatsSnapshot, WriteCache};
