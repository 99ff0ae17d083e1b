//! Error taxonomy for the replicated store (spec §7).
//!
//! Mirrors the domain/transient/fatal split: domain errors are returned to
//! callers, transient errors (`TxnTooBig`) are handled internally via
//! commit-and-retry, and integrity violations panic rather than propagate —
//! the operator is expected to inspect a corrupted store, not route around
//! it silently.

use thiserror::Error;

/// Errors surfaced by the `Store` layer (spec §4.2).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found")]
    KeyNotFound,

    #[error("transaction too big, commit and retry")]
    TxnTooBig,

    #[error("store is closed")]
    Closed,

    #[error(transparent)]
    Database(#[from] redb::DatabaseError),

    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),

    #[error(transparent)]
    Table(#[from] redb::TableError),

    #[error(transparent)]
    Storage(#[from] redb::StorageError),

    #[error(transparent)]
    Commit(#[from] redb::CommitError),

    #[error(transparent)]
    Compaction(#[from] redb::CompactionError),
}

/// Errors surfaced by `LogStore` (spec §4.3, §7).
#[derive(Error, Debug)]
pub enum LogStoreError {
    #[error("no bootstrap info for this partition")]
    NoBootstrapInfo,

    #[error("no saved log for this partition")]
    NoSavedLog,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

/// Errors from `KeyCodec` decoding (spec §4.1).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key: wrong length (got {got}, want {want})")]
    WrongLength { got: usize, want: usize },

    #[error("invalid key: tag/prefix mismatch")]
    TagMismatch,

    #[error("invalid key: embedded cluster id does not match partition")]
    ClusterMismatch,
}

/// Errors surfaced by `StateMachine` operations that cannot be encoded into
/// a `Response` (infrastructure faults only — malformed client input is
/// always encoded into `Response.error`, never returned as a Rust `Err`,
/// per spec §7).
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("query key condition is not entered")]
    QueryKeyConditionMissing,

    #[error("multiple items matched a rename update")]
    MultipleItemsUpdate,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),

    #[error("snapshot stream closed during capture or recovery")]
    Cancelled,

    #[error("snapshot framing error: {0}")]
    Framing(&'static str),

    #[error("snapshot record checksum mismatch")]
    ChecksumMismatch,

    #[error("state machine closed")]
    Closed,
}

/// Errors surfaced by the `Cluster` façade (spec §4.6).
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("malformed raft address: {0}")]
    RaftAddress(String),

    #[error("bootstrap node set is empty")]
    EmptyBootstrap,

    #[error("cluster id is empty")]
    EmptyClusterID,

    #[error("cluster not found locally")]
    ClusterNotFound,

    #[error("response error: {0}")]
    Response(String),
}
