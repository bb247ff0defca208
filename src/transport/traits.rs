//! Transport abstraction for replica RPC communication
//!
//! Targets are plain address strings taken from the cluster configuration;
//! the transport treats them as opaque routing keys. All operations are
//! idempotent at the log level, so callers retry transport errors freely.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::replica::{
    AppendRequest, AppendResponse, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::core::server::{SubmitRequest, SubmitResponse};

/// Errors that can occur during transport operations. All are transient:
/// the replication manager and the forwarding path retry them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection to the target failed.
    #[error("connection to the target failed")]
    ConnectionFailed,
    /// Request timed out.
    #[error("request timed out")]
    Timeout,
    /// No route to the target address.
    #[error("no route to the target address")]
    UnknownAddress,
}

/// Point-to-point RPC to cluster members.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to the member at `target`.
    async fn request_vote(
        &self,
        target: &str,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    /// Send an AppendEntries RPC (empty entries = heartbeat).
    async fn append_entries(
        &self,
        target: &str,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError>;

    /// Send an InstallSnapshot RPC.
    async fn install_snapshot(
        &self,
        target: &str,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError>;

    /// Forward a command submission to the member at `target`.
    async fn submit(
        &self,
        target: &str,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, TransportError>;
}
