//! HTTP client API
//!
//! Endpoints for external clients:
//! - submit commands (forwarded to the leader when this member is not it)
//! - query cluster status, leader, and membership
//! - read keys from the sample key-value machine
//! - request membership changes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::cluster::{MemberConfig, MemberId, MemberStatus};
use crate::core::node::SharedReplica;
use crate::core::replica::Role;
use crate::core::server::{ReplicaError, ReplicaHandle};
use crate::state_machine::kv::SharedKvStore;
use crate::state_machine::Command;

/// State for the client HTTP handlers.
#[derive(Clone)]
pub struct ClientState {
    /// Handle for submissions and membership changes (goes through the
    /// full server pipeline).
    pub handle: ReplicaHandle,
    /// Shared replica for status queries.
    pub replica: SharedReplica,
    /// Key-value store for direct reads.
    pub kv: SharedKvStore,
}

/// Request body for submitting a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBody {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Response from a successful submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReply {
    pub result: String,
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
    /// Leader hint (member id) if known, for redirect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<MemberId>,
}

/// Response for the leader query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderReply {
    pub leader_id: Option<MemberId>,
    pub member_id: MemberId,
    pub is_leader: bool,
}

/// Response for the status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub member_id: MemberId,
    /// Current role (Follower, Candidate, Leader, Stopped)
    pub role: String,
    pub term: u64,
    pub leader_id: Option<MemberId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_length: u64,
    pub snapshot_index: u64,
}

/// One member in the membership listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberReply {
    pub id: MemberId,
    pub address: String,
    pub status: String,
}

/// Request body for adding a member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMemberBody {
    pub id: MemberId,
    pub address: String,
}

/// Request body for removing a member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveMemberBody {
    pub id: MemberId,
}

/// Create the axum router for the client API.
pub fn client_router(handle: ReplicaHandle, replica: SharedReplica, kv: SharedKvStore) -> Router {
    let state = ClientState { handle, replica, kv };
    Router::new()
        .route("/client/submit", post(handle_submit))
        .route("/client/leader", get(handle_leader))
        .route("/client/status", get(handle_status))
        .route("/client/read/:key", get(handle_read))
        .route("/client/members", get(handle_members))
        .route("/client/add_member", post(handle_add_member))
        .route("/client/remove_member", post(handle_remove_member))
        .with_state(state)
}

fn error_reply(error: ReplicaError) -> (StatusCode, Json<ErrorReply>) {
    let (status, leader_hint) = match &error {
        ReplicaError::NoLeader => (StatusCode::SERVICE_UNAVAILABLE, None),
        ReplicaError::NotLeader { leader_hint } => (StatusCode::SERVICE_UNAVAILABLE, *leader_hint),
        ReplicaError::LeadershipLost => (StatusCode::SERVICE_UNAVAILABLE, None),
        ReplicaError::Stopped => (StatusCode::SERVICE_UNAVAILABLE, None),
        ReplicaError::Rejected(_) | ReplicaError::StateMachine(_) => (StatusCode::BAD_REQUEST, None),
        ReplicaError::Membership(_) => (StatusCode::CONFLICT, None),
        ReplicaError::Transport(_) | ReplicaError::Remote(_) => (StatusCode::BAD_GATEWAY, None),
    };
    (status, Json(ErrorReply { error: error.to_string(), leader_hint }))
}

/// POST /client/submit - submit a command through the full pipeline:
/// append, replicate, commit, apply (or forward to the leader).
async fn handle_submit(
    State(state): State<ClientState>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<SubmitReply>, (StatusCode, Json<ErrorReply>)> {
    let command = Command { name: body.name, args: body.args };
    match state.handle.submit(command).await {
        Ok(result) => Ok(Json(SubmitReply { result })),
        Err(error) => Err(error_reply(error)),
    }
}

/// GET /client/leader - current leader information.
async fn handle_leader(State(state): State<ClientState>) -> Json<LeaderReply> {
    let replica = state.replica.lock().await;
    Json(LeaderReply {
        leader_id: replica.leader_id,
        member_id: replica.id,
        is_leader: replica.role == Role::Leader,
    })
}

/// GET /client/status - replica status.
async fn handle_status(State(state): State<ClientState>) -> Json<StatusReply> {
    let replica = state.replica.lock().await;
    Json(StatusReply {
        member_id: replica.id,
        role: format!("{:?}", replica.role),
        term: replica.current_term,
        leader_id: replica.leader_id,
        commit_index: replica.commit_index,
        last_applied: replica.last_applied,
        log_length: replica.log.len() as u64,
        snapshot_index: replica.snapshot_last_index,
    })
}

/// GET /client/read/{key} - read a key directly from the local store.
async fn handle_read(
    State(state): State<ClientState>,
    Path(key): Path<String>,
) -> Result<Json<String>, StatusCode> {
    let value = state.kv.lock().unwrap().get(&key);
    match value {
        Some(value) => Ok(Json(value)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// GET /client/members - current cluster membership.
async fn handle_members(State(state): State<ClientState>) -> Json<Vec<MemberReply>> {
    let replica = state.replica.lock().await;
    let members = replica
        .cluster
        .members()
        .map(|m| MemberReply {
            id: m.id,
            address: m.address.clone(),
            status: match m.status {
                MemberStatus::Active => "Active".to_string(),
                MemberStatus::Joining => "Joining".to_string(),
                MemberStatus::Leaving => "Leaving".to_string(),
            },
        })
        .collect();
    Json(members)
}

/// POST /client/add_member - add a member via joint consensus.
async fn handle_add_member(
    State(state): State<ClientState>,
    Json(body): Json<AddMemberBody>,
) -> Result<StatusCode, (StatusCode, Json<ErrorReply>)> {
    match state.handle.add_member(MemberConfig::new(body.id, body.address)).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(error) => Err(error_reply(error)),
    }
}

/// POST /client/remove_member - remove a member via joint consensus.
async fn handle_remove_member(
    State(state): State<ClientState>,
    Json(body): Json<RemoveMemberBody>,
) -> Result<StatusCode, (StatusCode, Json<ErrorReply>)> {
    match state.handle.remove_member(body.id).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(error) => Err(error_reply(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterConfig;
    use crate::core::replica::Replica;
    use crate::core::server::ReplicaServer;
    use crate::state_machine::kv::KeyValueStore;
    use crate::state_machine::StateMachine;
    use crate::storage::MemoryStorage;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn test_cluster_config(ids: &[MemberId]) -> ClusterConfig {
        ClusterConfig::new(
            ids.iter()
                .map(|&id| MemberConfig::new(id, crate::transport::inmemory::member_address(id))),
        )
    }

    /// A follower node with a running server and the client router.
    fn follower_app() -> (Router, SharedReplica) {
        let ids = [1, 2, 3];
        let kv: SharedKvStore = Arc::new(std::sync::Mutex::new(KeyValueStore::new()));
        let replica = Replica::new(
            1,
            test_cluster_config(&ids),
            Box::new(MemoryStorage::new()),
            Box::new(kv.clone()),
        );
        let (mut transports, _handles) =
            crate::transport::inmemory::create_cluster_with_timeout(
                &ids,
                Some(std::time::Duration::from_millis(100)),
            );
        let (server, shared) = ReplicaServer::new(replica, transports.remove(&1).unwrap());
        let handle = server.start();
        (client_router(handle, shared.clone(), kv), shared)
    }

    #[tokio::test]
    async fn test_leader_endpoint_on_follower() {
        let (app, _shared) = follower_app();

        let request = Request::builder()
            .method("GET")
            .uri("/client/leader")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let reply: LeaderReply = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply.member_id, 1);
        assert!(!reply.is_leader);
        assert_eq!(reply.leader_id, None);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (app, shared) = follower_app();
        shared.lock().await.handle_append_request(&crate::core::replica::AppendRequest {
            term: 5,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });

        let request = Request::builder()
            .method("GET")
            .uri("/client/status")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let reply: StatusReply = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply.member_id, 1);
        assert_eq!(reply.role, "Follower");
        assert_eq!(reply.term, 5);
        assert_eq!(reply.leader_id, Some(2));
    }

    #[tokio::test]
    async fn test_members_endpoint() {
        let (app, _shared) = follower_app();

        let request = Request::builder()
            .method("GET")
            .uri("/client/members")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let members: Vec<MemberReply> = serde_json::from_slice(&body).unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.iter().all(|m| m.status == "Active"));
    }

    #[tokio::test]
    async fn test_submit_without_leader_is_unavailable() {
        let (app, _shared) = follower_app();

        let request = Request::builder()
            .method("POST")
            .uri("/client/submit")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name": "set", "args": ["x", "1"]}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let reply: ErrorReply = serde_json::from_slice(&body).unwrap();
        assert!(reply.error.contains("no leader"));
    }

    #[tokio::test]
    async fn test_read_endpoint() {
        let ids = [1];
        let kv: SharedKvStore = Arc::new(std::sync::Mutex::new(KeyValueStore::new()));
        let replica = Replica::new(
            1,
            test_cluster_config(&ids),
            Box::new(MemoryStorage::new()),
            Box::new(kv.clone()),
        );
        let (mut transports, _handles) = crate::transport::inmemory::create_cluster(&ids);
        let (server, shared) = ReplicaServer::new(replica, transports.remove(&1).unwrap());
        let handle = server.start();
        let app = client_router(handle, shared, kv.clone());

        kv.lock()
            .unwrap()
            .apply(&Command::new("set", ["greeting", "hello"]))
            .unwrap();

        let request = Request::builder()
            .method("GET")
            .uri("/client/read/greeting")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: String = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, "hello");

        let request = Request::builder()
            .method("GET")
            .uri("/client/read/missing")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_add_member_on_follower_is_unavailable() {
        let (app, _shared) = follower_app();

        let request = Request::builder()
            .method("POST")
            .uri("/client/add_member")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"id": 4, "address": "127.0.0.1:8004"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
