//! Storage engine error types

use cairn_common::SplitInfo;
use thiserror::Error;

/// Result type for storage engine operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage engine error
#[derive(Debug, Error)]
pub enum StorageError {
    /// Requested object is absent
    #[error("object not found")]
    NotFound,

    /// Object has been inhumed and waits for physical removal
    #[error("object already removed")]
    AlreadyRemoved,

    /// Object expiration epoch has passed
    #[error("object expired")]
    ObjectExpired,

    /// Requested address is the root of a split object
    #[error("object is a root of a split object: {0}")]
    SplitInfo(SplitInfo),

    /// Object is protected by an active lock
    #[error("object is locked")]
    ObjectLocked,

    /// Lock object still protects other objects
    #[error("lock object removal is forbidden while it protects objects")]
    LockObjectRemoval,

    /// Node is under a maintenance guard
    #[error("execution is blocked: {0}")]
    ExecutionBlocked(String),

    /// No shard accepted the inhume request
    #[error("inhume operation failed")]
    InhumeFailure,

    /// Every shard refused the object
    #[error("could not put object to any shard")]
    PutFailure,

    #[error("shard is in read-only mode")]
    ReadOnly,

    #[error("shard is in degraded mode")]
    Degraded,

    #[error("write-cache must be in read-only mode")]
    MustBeReadOnly,

    #[error("object is too big: {size} > {max} bytes")]
    BigObject { size: u64, max: u64 },

    #[error("write-cache is out of space")]
    OutOfSpace,

    #[error("data corruption: {0}")]
    Corrupted(String),

    /// Exhaustive write-cache drain stopped on an entry
    #[error("flush {key}: {source}")]
    FlushEntry {
        key: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("component is closed")]
    Closed,

    /// Iteration handler asked to stop early
    #[error("iteration interrupted")]
    Interrupted,

    #[error(transparent)]
    Common(#[from] cairn_common::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl StorageError {
    /// Create a corruption error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    #[must_use]
    pub const fn is_removed(&self) -> bool {
        matches!(self, Self::AlreadyRemoved)
    }

    #[must_use]
    pub const fn is_expired(&self) -> bool {
        matches!(self, Self::ObjectExpired)
    }

    #[must_use]
    pub const fn is_locked(&self) -> bool {
        matches!(self, Self::ObjectLocked)
    }

    /// Split information carried by the error, if any
    #[must_use]
    pub const fn split_info(&self) -> Option<&SplitInfo> {
        match self {
            Self::SplitInfo(info) => Some(info),
            _ => None,
        }
    }
}
