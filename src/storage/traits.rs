//! Storage abstraction for the replica's persistent state
//!
//! The replica persists its term, its vote, the log suffix not covered by a
//! snapshot, and the latest snapshot. Durability is required before any of
//! these operations return: a replica must never acknowledge an RPC whose
//! effects could be lost in a crash.

use crate::cluster::MemberId;
use crate::core::replica::LogEntry;
use crate::core::snapshot::Snapshot;

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error (e.g. disk full, permission denied).
    #[error("I/O error: {0}")]
    Io(String),
    /// Data corruption detected.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Storage not initialized.
    #[error("storage not initialized")]
    NotInitialized,
}

/// Storage trait for the replica's persistent state.
///
/// All operations are synchronous to keep the consensus core simple. The
/// `Send` bound is required for use behind the async server loop.
pub trait Storage: Send {
    /// Load the current term. Returns 0 on a fresh start.
    fn load_term(&self) -> Result<u64, StorageError>;

    /// Save the current term. Must be durable before returning.
    fn save_term(&mut self, term: u64) -> Result<(), StorageError>;

    /// Load the member voted for in the current term, if any.
    fn load_vote(&self) -> Result<Option<MemberId>, StorageError>;

    /// Save the vote. Must be durable before returning.
    fn save_vote(&mut self, vote: Option<MemberId>) -> Result<(), StorageError>;

    /// Load all retained log entries, in index order.
    fn load_entries(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Append entries after any existing entries.
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove every entry with index greater than `index` (keep entries at
    /// or below it). Used for conflict resolution.
    fn truncate_after(&mut self, index: u64) -> Result<(), StorageError>;

    /// Persist the snapshot and drop every entry with index at or below
    /// `index`, as one durable step. Used for snapshot compaction and
    /// snapshot installation.
    fn compact_before(&mut self, index: u64, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Load the most recent snapshot, if one has been saved.
    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;
}
