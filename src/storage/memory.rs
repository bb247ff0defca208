//! In-memory storage implementation for testing
//!
//! Fast, no side effects, no persistence across restarts.

use super::{Storage, StorageError};
use crate::cluster::MemberId;
use crate::core::replica::LogEntry;
use crate::core::snapshot::Snapshot;

/// In-memory storage implementation
///
/// Stores all state in memory - no disk I/O, no persistence. Ideal for unit
/// tests where speed matters and side effects are unwanted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    term: u64,
    vote: Option<MemberId>,
    entries: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        Ok(self.term)
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.term = term;
        Ok(())
    }

    fn load_vote(&self) -> Result<Option<MemberId>, StorageError> {
        Ok(self.vote)
    }

    fn save_vote(&mut self, vote: Option<MemberId>) -> Result<(), StorageError> {
        self.vote = vote;
        Ok(())
    }

    fn load_entries(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.entries.clone())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_after(&mut self, index: u64) -> Result<(), StorageError> {
        self.entries.retain(|e| e.index <= index);
        Ok(())
    }

    fn compact_before(&mut self, index: u64, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.snapshot = Some(snapshot.clone());
        self.entries.retain(|e| e.index > index);
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.clone())
    }
}
