//! Durable log adapter
//!
//! The consensus core must persist certain state to stable storage before
//! responding to RPCs: the current term, the vote, the log entries, and the
//! latest snapshot.
//!
//! - `MemoryStorage`: fast, in-memory storage for testing
//! - `FileStorage`: file-based storage with CRC32 checksums

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use traits::{Storage, StorageError};
