//! Concurrent RPC fan-out for a replica
//!
//! `ReplicaNode` owns the transport and drives vote and replication rounds:
//! requests are built while holding the replica lock, sent with the lock
//! released, and each response re-acquires the lock to update state.
//! Fan-outs finish early once a decision is reached (a won election, a
//! lost leadership).

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::cluster::MemberId;
use crate::core::replica::{Replica, Role, SnapshotResponse, VoteRequest};
use crate::core::replication::ReplicationRequest;
use crate::state_machine::ApplyResult;
use crate::transport::{Transport, TransportError};

/// Shared reference to the replica state.
pub type SharedReplica = Arc<Mutex<Replica>>;

/// Result of one replication round.
#[derive(Debug)]
pub struct ReplicationOutcome {
    /// Whether the replica still held leadership at the end of the round.
    pub still_leader: bool,
    /// Commit index after the round.
    pub commit_index: u64,
    /// Entries applied during the round, in index order.
    pub applied: Vec<(u64, ApplyResult)>,
}

enum PeerReply {
    Append(Result<crate::core::replica::AppendResponse, TransportError>),
    Snapshot(Result<SnapshotResponse, TransportError>, u64),
}

/// Drives a replica's outbound RPC traffic over a transport.
pub struct ReplicaNode<T: Transport> {
    replica: SharedReplica,
    transport: Arc<T>,
}

impl<T: Transport + 'static> ReplicaNode<T> {
    pub fn new(replica: Replica, transport: T) -> Self {
        Self {
            replica: Arc::new(Mutex::new(replica)),
            transport: Arc::new(transport),
        }
    }

    /// Shared replica handle (for incoming RPC processing).
    pub fn shared_replica(&self) -> SharedReplica {
        self.replica.clone()
    }

    /// Shared transport handle (for command forwarding off the loop).
    pub fn transport(&self) -> Arc<T> {
        self.transport.clone()
    }

    /// Start an election. Returns true if it was won on the spot
    /// (single-member cluster).
    pub async fn start_election(&self) -> bool {
        self.replica.lock().await.start_election()
    }

    /// Request votes from all peers concurrently. Returns true once a
    /// quorum grants; remaining responses are not awaited.
    pub async fn request_votes(&self) -> bool {
        let (request, targets) = {
            let replica = self.replica.lock().await;
            if replica.role != Role::Candidate {
                return replica.role == Role::Leader;
            }
            let request = VoteRequest {
                term: replica.current_term,
                candidate_id: replica.id,
                last_log_index: replica.last_log_index(),
                last_log_term: replica.last_log_term(),
            };
            let targets: Vec<(MemberId, String)> = replica
                .cluster
                .peer_ids(replica.id)
                .into_iter()
                .filter_map(|peer| {
                    replica
                        .cluster
                        .address_of(peer)
                        .map(|addr| (peer, addr.to_string()))
                })
                .collect();
            (request, targets)
        };

        let mut responses: FuturesUnordered<_> = targets
            .into_iter()
            .map(|(peer, addr)| {
                let request = request.clone();
                let transport = Arc::clone(&self.transport);
                async move { (peer, transport.request_vote(&addr, request).await) }
            })
            .collect();

        while let Some((peer, result)) = responses.next().await {
            if let Ok(response) = result {
                let mut replica = self.replica.lock().await;
                if replica.record_vote_response(peer, &response) {
                    return true; // Quorum reached; don't wait for the rest.
                }
                if replica.role != Role::Candidate {
                    return false; // Demoted mid-election.
                }
            }
        }

        false
    }

    /// Run one replication round: send every peer its pending entries (or
    /// a snapshot when it is behind the retained log) and process the
    /// responses as they arrive. Also serves as the heartbeat.
    pub async fn replicate_once(&self) -> ReplicationOutcome {
        let requests = {
            let replica = self.replica.lock().await;
            if replica.role != Role::Leader {
                return ReplicationOutcome {
                    still_leader: false,
                    commit_index: replica.commit_index,
                    applied: Vec::new(),
                };
            }

            let mut requests = Vec::new();
            for peer in replica.replication_peers() {
                // A member without an address has left the configuration;
                // its progress is pruned when the removal commits.
                let Some(addr) = replica.cluster.address_of(peer).map(str::to_string) else {
                    continue;
                };
                if let Some(request) = replica.build_replication(peer) {
                    requests.push((peer, addr, request));
                }
            }
            requests
        };

        let mut responses: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer, addr, request)| {
                let transport = Arc::clone(&self.transport);
                async move {
                    match request {
                        ReplicationRequest::Entries(req) => {
                            (peer, PeerReply::Append(transport.append_entries(&addr, req).await))
                        }
                        ReplicationRequest::Snapshot(req) => {
                            let boundary = req.last_included_index;
                            let reply = transport.install_snapshot(&addr, req).await;
                            (peer, PeerReply::Snapshot(reply, boundary))
                        }
                    }
                }
            })
            .collect();

        let mut applied = Vec::new();
        while let Some((peer, reply)) = responses.next().await {
            let mut replica = self.replica.lock().await;
            match reply {
                PeerReply::Append(Ok(response)) => {
                    applied.extend(replica.record_append_response(peer, &response));
                }
                PeerReply::Snapshot(Ok(response), boundary) => match response {
                    SnapshotResponse::Success { term } => {
                        if term > replica.current_term {
                            replica.step_down(term);
                        } else {
                            replica.record_snapshot_installed(peer, boundary);
                            applied.extend(replica.advance_commit());
                        }
                    }
                    SnapshotResponse::Failed { term, reason } => {
                        if term > replica.current_term {
                            replica.step_down(term);
                        } else {
                            warn!(id = replica.id, peer, %reason, "snapshot install failed");
                        }
                    }
                },
                // Transient transport errors: the next round retries.
                PeerReply::Append(Err(_)) | PeerReply::Snapshot(Err(_), _) => {}
            }

            if replica.role != Role::Leader {
                let commit_index = replica.commit_index;
                return ReplicationOutcome { still_leader: false, commit_index, applied };
            }
        }

        let replica = self.replica.lock().await;
        ReplicationOutcome {
            still_leader: replica.role == Role::Leader,
            commit_index: replica.commit_index,
            applied,
        }
    }

    /// Current role.
    pub async fn role(&self) -> Role {
        self.replica.lock().await.role
    }

    /// Current commit index.
    pub async fn commit_index(&self) -> u64 {
        self.replica.lock().await.commit_index
    }
}
