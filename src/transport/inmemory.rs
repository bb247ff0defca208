//! In-memory transport implementation for testing
//!
//! Routes RPCs between in-process replicas over channels, keyed by the
//! same address strings a real transport would use.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::cluster::MemberId;
use crate::core::node::SharedReplica;
use crate::core::replica::{
    AppendRequest, AppendResponse, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::core::server::{ReplicaHandle, SubmitRequest, SubmitResponse};
use crate::transport::{Transport, TransportError};

/// Synthetic address for a test member.
pub fn member_address(id: MemberId) -> String {
    format!("mem://{}", id)
}

/// Request types that can be delivered to a node
pub enum Request {
    Vote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    Append {
        request: AppendRequest,
        reply: oneshot::Sender<AppendResponse>,
    },
    Snapshot {
        request: SnapshotRequest,
        reply: oneshot::Sender<SnapshotResponse>,
    },
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<SubmitResponse>,
    },
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    /// Senders to each address's request queue
    routes: HashMap<String, mpsc::Sender<Request>>,
    /// Optional timeout for RPC calls
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    pub fn new(routes: HashMap<String, mpsc::Sender<Request>>) -> Self {
        Self { routes, timeout: None }
    }

    pub fn with_timeout(routes: HashMap<String, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self { routes, timeout: Some(timeout) }
    }

    async fn deliver<R>(
        &self,
        target: &str,
        make: impl FnOnce(oneshot::Sender<R>) -> Request,
    ) -> Result<R, TransportError> {
        let sender = self.routes.get(target).ok_or(TransportError::UnknownAddress)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &str,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        self.deliver(target, |reply| Request::Vote { request, reply }).await
    }

    async fn append_entries(
        &self,
        target: &str,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError> {
        self.deliver(target, |reply| Request::Append { request, reply }).await
    }

    async fn install_snapshot(
        &self,
        target: &str,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError> {
        self.deliver(target, |reply| Request::Snapshot { request, reply }).await
    }

    async fn submit(
        &self,
        target: &str,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, TransportError> {
        self.deliver(target, |reply| Request::Submit { request, reply }).await
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request against a shared replica. Forwarded
    /// submissions are answered with a redirect, since the full command
    /// pipeline is not available here.
    pub async fn process_one_shared(&mut self, replica: &SharedReplica) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::dispatch(request, replica, None).await;
                true
            }
            None => false,
        }
    }

    /// Process one incoming request, routing forwarded submissions through
    /// a running server's handle.
    pub async fn process_one_with_handle(
        &mut self,
        replica: &SharedReplica,
        handle: &ReplicaHandle,
    ) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::dispatch(request, replica, Some(handle)).await;
                true
            }
            None => false,
        }
    }

    /// Drop any queued requests without answering them (simulates lost
    /// messages after a partition heals).
    pub fn drain_pending(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }

    async fn dispatch(request: Request, replica: &SharedReplica, handle: Option<&ReplicaHandle>) {
        match request {
            Request::Vote { request, reply } => {
                let response = replica.lock().await.handle_vote_request(&request);
                let _ = reply.send(response);
            }
            Request::Append { request, reply } => {
                let outcome = replica.lock().await.handle_append_request(&request);
                let _ = reply.send(outcome.response);
            }
            Request::Snapshot { request, reply } => {
                let response = replica.lock().await.handle_install_snapshot(&request);
                let _ = reply.send(response);
            }
            Request::Submit { request, reply } => {
                let response = match handle {
                    Some(handle) => handle.handle_forwarded(request.command).await,
                    None => {
                        let leader = replica.lock().await.leader_id;
                        SubmitResponse::Redirect { leader }
                    }
                };
                let _ = reply.send(response);
            }
        }
    }
}

/// Create transports and handles for a cluster of nodes
pub fn create_cluster(
    ids: &[MemberId],
) -> (HashMap<MemberId, InMemoryTransport>, HashMap<MemberId, NodeHandle>) {
    create_cluster_with_timeout(ids, None)
}

/// Create transports and handles for a cluster of nodes with optional
/// per-RPC timeout
pub fn create_cluster_with_timeout(
    ids: &[MemberId],
    timeout: Option<Duration>,
) -> (HashMap<MemberId, InMemoryTransport>, HashMap<MemberId, NodeHandle>) {
    let mut senders: HashMap<MemberId, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<MemberId, NodeHandle> = HashMap::new();

    for &id in ids {
        let (tx, rx) = mpsc::channel(32);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    let mut transports: HashMap<MemberId, InMemoryTransport> = HashMap::new();
    for &id in ids {
        let routes: HashMap<String, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&other, _)| other != id)
            .map(|(&other, tx)| (member_address(other), tx.clone()))
            .collect();
        let transport = match timeout {
            Some(t) => InMemoryTransport::with_timeout(routes, t),
            None => InMemoryTransport::new(routes),
        };
        transports.insert(id, transport);
    }

    (transports, handles)
}
