//! Snapshot types for log compaction
//!
//! A snapshot captures the state machine image at a specific log index and
//! replaces every log entry at or below it. The metadata also carries the
//! cluster configuration effective at that index: configuration changes are
//! log entries, so compaction would otherwise lose them.

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;

/// Metadata describing what a snapshot covers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMeta {
    /// Last log index included in this snapshot.
    pub last_included_index: u64,
    /// Term of the last included log entry.
    pub last_included_term: u64,
    /// Cluster configuration as of the last included entry.
    pub config: ClusterConfig,
}

/// A snapshot of the state machine at a specific point in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    /// Serialized state machine image.
    pub data: Vec<u8>,
}
