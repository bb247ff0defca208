//! HTTP transport implementation for replica RPC
//!
//! axum serves the inbound RPC surface, reqwest sends outbound requests.
//! Payloads are JSON.

use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};

use crate::core::node::SharedReplica;
use crate::core::replica::{
    AppendRequest, AppendResponse, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::core::server::{ReplicaHandle, SubmitRequest, SubmitResponse};
use crate::transport::{Transport, TransportError};

/// HTTP transport for replica RPC communication. Targets are
/// "host:port" strings from the cluster configuration.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");
        HttpTransport { client }
    }

    async fn post_json<Req, Resp>(&self, target: &str, path: &str, request: &Req) -> Result<Resp, TransportError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("http://{}{}", target, path);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;

        response
            .json::<Resp>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: &str,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        self.post_json(target, "/raft/request_vote", &request).await
    }

    async fn append_entries(
        &self,
        target: &str,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError> {
        self.post_json(target, "/raft/append_entries", &request).await
    }

    async fn install_snapshot(
        &self,
        target: &str,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError> {
        self.post_json(target, "/raft/install_snapshot", &request).await
    }

    async fn submit(
        &self,
        target: &str,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, TransportError> {
        self.post_json(target, "/raft/submit", &request).await
    }
}

/// Shared state for the RPC router.
#[derive(Clone)]
pub struct RpcState {
    pub replica: SharedReplica,
    pub handle: ReplicaHandle,
}

/// Create an axum router serving the replica RPC surface.
pub fn rpc_router(replica: SharedReplica, handle: ReplicaHandle) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .route("/raft/submit", post(handle_submit))
        .with_state(RpcState { replica, handle })
}

async fn handle_request_vote(
    State(state): State<RpcState>,
    Json(request): Json<VoteRequest>,
) -> Json<VoteResponse> {
    let response = state.replica.lock().await.handle_vote_request(&request);
    Json(response)
}

async fn handle_append_entries(
    State(state): State<RpcState>,
    Json(request): Json<AppendRequest>,
) -> Json<AppendResponse> {
    let outcome = state.replica.lock().await.handle_append_request(&request);
    Json(outcome.response)
}

async fn handle_install_snapshot(
    State(state): State<RpcState>,
    Json(request): Json<SnapshotRequest>,
) -> Json<SnapshotResponse> {
    let response = state.replica.lock().await.handle_install_snapshot(&request);
    Json(response)
}

async fn handle_submit(
    State(state): State<RpcState>,
    Json(request): Json<SubmitRequest>,
) -> Json<SubmitResponse> {
    Json(state.handle.handle_forwarded(request.command).await)
}
