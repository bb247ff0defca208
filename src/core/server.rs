//! The replica event loop and command pipeline
//!
//! `ReplicaServer` owns the timers (heartbeat interval, election deadline)
//! and the command channel. Client commands append on the leader, register
//! a pending entry keyed by log index, and resolve when that index is
//! applied; on a non-leader they are forwarded to the known leader off the
//! loop. Membership changes run the two-phase joint consensus sequence:
//! joint entry, wait for its commit, final entry, wait again.

use std::collections::HashMap;
use std::pin::pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::cluster::{ClusterConfig, MemberConfig, MemberId, MembershipChange, MembershipError};
use crate::core::config::ReplicaConfig;
use crate::core::node::{ReplicaNode, ReplicationOutcome, SharedReplica};
use crate::core::replica::{Replica, Role};
use crate::state_machine::Command;
use crate::transport::{Transport, TransportError};

/// Errors surfaced by the command and membership pipelines.
#[derive(Debug, Clone, Error)]
pub enum ReplicaError {
    /// Not the leader and no leader is known; the caller should retry.
    #[error("no leader is currently known")]
    NoLeader,
    /// Not the leader; carries the known leader as a hint.
    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<MemberId> },
    /// Leadership was lost before the command committed. The command may
    /// still commit under the new leader; the caller must treat it as
    /// unresolved, never as definitely failed.
    #[error("leadership lost before the command committed")]
    LeadershipLost,
    /// The state machine refused the command before it entered the log.
    #[error("command rejected: {0}")]
    Rejected(String),
    /// The state machine returned an error when the command was applied.
    #[error("state machine error: {0}")]
    StateMachine(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A forwarded submission failed on the remote member.
    #[error("forwarded submission failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error("replica is stopped")]
    Stopped,
}

/// Wire format of a (possibly forwarded) command submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub command: Command,
    /// True when this submission was already forwarded once; a non-leader
    /// answers it with a redirect instead of forwarding again.
    pub forwarded: bool,
}

/// Wire format of a submission outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubmitResponse {
    /// Committed and applied; carries the state machine result.
    Applied { result: String },
    /// The receiver is not the leader; retry at the hinted member.
    Redirect { leader: Option<MemberId> },
    /// Terminal failure on the receiving member.
    Failed { error: String },
}

/// Commands sent into the server loop.
enum ServerCommand {
    Submit {
        command: Command,
        forwarded: bool,
        reply: oneshot::Sender<Result<String, ReplicaError>>,
    },
    ChangeMembership {
        change: MembershipChange,
        reply: oneshot::Sender<Result<(), ReplicaError>>,
    },
}

/// Handle for interacting with a running ReplicaServer.
#[derive(Clone)]
pub struct ReplicaHandle {
    command_tx: mpsc::Sender<ServerCommand>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ReplicaHandle {
    /// Submit a command. Resolves with the state machine result once the
    /// command is committed and applied; forwards to the leader when this
    /// member is not it.
    pub async fn submit(&self, command: Command) -> Result<String, ReplicaError> {
        self.send_submit(command, false).await
    }

    /// Handle a submission forwarded from another member, mapping the
    /// result to the wire format. Never forwards again.
    pub async fn handle_forwarded(&self, command: Command) -> SubmitResponse {
        match self.send_submit(command, true).await {
            Ok(result) => SubmitResponse::Applied { result },
            Err(ReplicaError::NotLeader { leader_hint }) => {
                SubmitResponse::Redirect { leader: leader_hint }
            }
            Err(ReplicaError::NoLeader) => SubmitResponse::Redirect { leader: None },
            Err(e) => SubmitResponse::Failed { error: e.to_string() },
        }
    }

    async fn send_submit(&self, command: Command, forwarded: bool) -> Result<String, ReplicaError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ServerCommand::Submit { command, forwarded, reply: reply_tx })
            .await
            .map_err(|_| ReplicaError::Stopped)?;
        reply_rx.await.map_err(|_| ReplicaError::Stopped)?
    }

    /// Add a member to the cluster through the joint consensus sequence.
    /// Resolves when the final configuration entry commits.
    pub async fn add_member(&self, member: MemberConfig) -> Result<(), ReplicaError> {
        self.change_membership(MembershipChange::Add(member)).await
    }

    /// Remove a member from the cluster through the joint consensus
    /// sequence. Resolves when the final configuration entry commits.
    pub async fn remove_member(&self, id: MemberId) -> Result<(), ReplicaError> {
        self.change_membership(MembershipChange::Remove(id)).await
    }

    async fn change_membership(&self, change: MembershipChange) -> Result<(), ReplicaError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ServerCommand::ChangeMembership { change, reply: reply_tx })
            .await
            .map_err(|_| ReplicaError::Stopped)?;
        reply_rx.await.map_err(|_| ReplicaError::Stopped)?
    }

    /// Shut the server down gracefully.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// A membership change waiting on the two-phase commit sequence.
struct PendingMembership {
    stage: MembershipStage,
    reply: oneshot::Sender<Result<(), ReplicaError>>,
}

enum MembershipStage {
    /// The joint entry is in the log; waiting for it to commit.
    Joint { joint_index: u64, final_config: ClusterConfig },
    /// The final entry is in the log; waiting for it to commit.
    Final { final_index: u64 },
}

/// The replica server: event loop, command pipeline, membership
/// coordinator.
pub struct ReplicaServer<T: Transport> {
    node: ReplicaNode<T>,
    command_rx: mpsc::Receiver<ServerCommand>,
    command_tx: mpsc::Sender<ServerCommand>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    config: ReplicaConfig,
    /// Commands awaiting commit, keyed by their log index.
    pending: HashMap<u64, oneshot::Sender<Result<String, ReplicaError>>>,
    /// At most one membership change in flight.
    membership: Option<PendingMembership>,
}

impl<T: Transport + 'static> ReplicaServer<T> {
    /// Create a server with the default config. Returns the server and the
    /// shared replica for incoming RPC handling.
    pub fn new(replica: Replica, transport: T) -> (Self, SharedReplica) {
        Self::with_config(replica, transport, ReplicaConfig::default())
    }

    /// Create a server with a custom config.
    pub fn with_config(
        mut replica: Replica,
        transport: T,
        config: ReplicaConfig,
    ) -> (Self, SharedReplica) {
        replica.set_snapshot_threshold(config.snapshot_threshold);

        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = ReplicaNode::new(replica, transport);
        let shared = node.shared_replica();
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            config,
            pending: HashMap::new(),
            membership: None,
        };
        (server, shared)
    }

    /// Start the event loop and return a handle for interaction.
    pub fn start(self) -> ReplicaHandle {
        let handle = ReplicaHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// Main server loop.
    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        // Delay behavior keeps missed ticks from starving the election
        // deadline.
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let election_timeout = self.config.random_election_timeout();

        loop {
            let election_deadline = self.election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(election_deadline));

            tokio::select! {
                _ = self.shutdown_rx.recv() => break,

                Some(command) = self.command_rx.recv() => match command {
                    ServerCommand::Submit { command, forwarded, reply } => {
                        self.handle_submit(command, forwarded, reply).await;
                    }
                    ServerCommand::ChangeMembership { change, reply } => {
                        self.handle_change_membership(change, reply).await;
                    }
                },

                _ = heartbeat.tick() => {
                    if self.node.role().await == Role::Leader {
                        // A leader's own election timer must not fire.
                        self.node.shared_replica().lock().await.last_leader_contact = Instant::now();
                        self.run_replication_round().await;
                    } else if !self.pending.is_empty() || self.membership.is_some() {
                        // Demoted by an incoming RPC between rounds.
                        self.fail_all(ReplicaError::LeadershipLost);
                    }
                }

                _ = election_sleep => {
                    let role = self.node.role().await;
                    if role != Role::Leader && role != Role::Stopped
                        && self.election_timed_out(election_timeout).await
                    {
                        let won = self.node.start_election().await || self.node.request_votes().await;
                        if won {
                            // Establish leadership immediately.
                            self.run_replication_round().await;
                        }
                    }
                }

                else => break,
            }
        }

        self.node.shared_replica().lock().await.stop();
        self.fail_all(ReplicaError::Stopped);
    }

    async fn election_deadline(&self, timeout: Duration) -> Instant {
        let last = self.node.shared_replica().lock().await.last_leader_contact;
        last + timeout
    }

    async fn election_timed_out(&self, timeout: Duration) -> bool {
        let last = self.node.shared_replica().lock().await.last_leader_contact;
        Instant::now() >= last + timeout
    }

    /// Run replication rounds until the membership sequence stops
    /// advancing (at most two: joint commit, then final commit).
    async fn run_replication_round(&mut self) {
        loop {
            let outcome = self.node.replicate_once().await;
            if !self.process_outcome(outcome).await {
                break;
            }
        }
    }

    /// Resolve pending commands from an outcome and advance the membership
    /// sequence. Returns true when a new entry was appended and another
    /// round should run.
    async fn process_outcome(&mut self, outcome: ReplicationOutcome) -> bool {
        for (index, result) in &outcome.applied {
            if let Some(reply) = self.pending.remove(index) {
                let _ = reply.send(result.clone().map_err(ReplicaError::StateMachine));
            }
        }

        if !outcome.still_leader {
            self.fail_all(ReplicaError::LeadershipLost);
            return false;
        }

        let Some(PendingMembership { stage, reply }) = self.membership.take() else {
            return false;
        };

        match stage {
            MembershipStage::Joint { joint_index, final_config } => {
                if outcome.commit_index >= joint_index {
                    // Joint entry committed under dual majorities: append
                    // the final configuration.
                    let appended = {
                        let shared = self.node.shared_replica();
                        let mut replica = shared.lock().await;
                        replica.append_config(final_config)
                    };
                    let Some(final_index) = appended else {
                        // Demoted between the round and this append.
                        let _ = reply.send(Err(ReplicaError::LeadershipLost));
                        return false;
                    };
                    info!(final_index, "joint configuration committed, appending final");
                    self.membership = Some(PendingMembership {
                        stage: MembershipStage::Final { final_index },
                        reply,
                    });
                    true
                } else {
                    self.membership = Some(PendingMembership {
                        stage: MembershipStage::Joint { joint_index, final_config },
                        reply,
                    });
                    false
                }
            }
            MembershipStage::Final { final_index } => {
                if outcome.commit_index >= final_index {
                    // Change complete: stop replicating to removed members.
                    self.node.shared_replica().lock().await.prune_progress();
                    info!(final_index, "membership change committed");
                    let _ = reply.send(Ok(()));
                } else {
                    self.membership = Some(PendingMembership {
                        stage: MembershipStage::Final { final_index },
                        reply,
                    });
                }
                false
            }
        }
    }

    /// Handle a client submission: append and register on the leader,
    /// forward to the known leader otherwise.
    async fn handle_submit(
        &mut self,
        command: Command,
        forwarded: bool,
        reply: oneshot::Sender<Result<String, ReplicaError>>,
    ) {
        enum Decision {
            Append(u64),
            Forward { addr: String, command: Command },
            Fail(ReplicaError),
        }

        let decision = {
            let shared = self.node.shared_replica();
            let mut replica = shared.lock().await;
            match replica.role {
                Role::Stopped => Decision::Fail(ReplicaError::Stopped),
                Role::Leader => match replica.validate_command(&command) {
                    Err(reason) => Decision::Fail(ReplicaError::Rejected(reason)),
                    Ok(()) => match replica.append_command(command) {
                        Some(index) => Decision::Append(index),
                        None => Decision::Fail(ReplicaError::NotLeader {
                            leader_hint: replica.leader_id,
                        }),
                    },
                },
                _ if forwarded => {
                    // Never forward twice; the submitter retries with the
                    // hint instead.
                    Decision::Fail(ReplicaError::NotLeader { leader_hint: replica.leader_id })
                }
                _ => {
                    let leader_addr = replica
                        .leader_id
                        .and_then(|leader| replica.cluster.address_of(leader))
                        .map(str::to_string);
                    match leader_addr {
                        Some(addr) => Decision::Forward { addr, command },
                        None => Decision::Fail(ReplicaError::NoLeader),
                    }
                }
            }
        };

        match decision {
            Decision::Append(index) => {
                debug!(index, "command appended, awaiting commit");
                self.pending.insert(index, reply);
                self.run_replication_round().await;
            }
            Decision::Forward { addr, command } => {
                // Forwarding is transport I/O; it must not block the loop.
                let transport = self.node.transport();
                tokio::spawn(async move {
                    let request = SubmitRequest { command, forwarded: true };
                    let result = match transport.submit(&addr, request).await {
                        Ok(SubmitResponse::Applied { result }) => Ok(result),
                        Ok(SubmitResponse::Redirect { .. }) => Err(ReplicaError::NoLeader),
                        Ok(SubmitResponse::Failed { error }) => Err(ReplicaError::Remote(error)),
                        Err(e) => Err(ReplicaError::Transport(e)),
                    };
                    let _ = reply.send(result);
                });
            }
            Decision::Fail(error) => {
                let _ = reply.send(Err(error));
            }
        }
    }

    /// Begin a membership change: append the joint configuration and track
    /// the two-phase sequence.
    async fn handle_change_membership(
        &mut self,
        change: MembershipChange,
        reply: oneshot::Sender<Result<(), ReplicaError>>,
    ) {
        if self.membership.is_some() {
            let _ = reply.send(Err(MembershipError::ChangeInProgress.into()));
            return;
        }

        let appended = {
            let shared = self.node.shared_replica();
            let mut replica = shared.lock().await;
            if replica.role != Role::Leader {
                Err(ReplicaError::NotLeader { leader_hint: replica.leader_id })
            } else {
                match replica.cluster.joint_for(&change) {
                    Err(e) => Err(e.into()),
                    Ok(joint) => {
                        let final_config = joint.finalized();
                        match replica.append_config(joint) {
                            Some(joint_index) => Ok((joint_index, final_config)),
                            None => Err(ReplicaError::NotLeader { leader_hint: replica.leader_id }),
                        }
                    }
                }
            }
        };

        match appended {
            Ok((joint_index, final_config)) => {
                info!(joint_index, ?change, "joint configuration appended");
                self.membership = Some(PendingMembership {
                    stage: MembershipStage::Joint { joint_index, final_config },
                    reply,
                });
                self.run_replication_round().await;
            }
            Err(error) => {
                let _ = reply.send(Err(error));
            }
        }
    }

    /// Fail every outstanding command and membership change. Called on
    /// demotion and on shutdown.
    fn fail_all(&mut self, error: ReplicaError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(error.clone()));
        }
        if let Some(PendingMembership { reply, .. }) = self.membership.take() {
            let _ = reply.send(Err(error.clone()));
        }
    }

    // Accessors used by tests and the API layer.

    pub async fn start_election(&self) {
        self.node.start_election().await;
    }

    pub async fn request_votes(&self) -> bool {
        self.node.request_votes().await
    }

    pub async fn role(&self) -> Role {
        self.node.role().await
    }

    pub async fn commit_index(&self) -> u64 {
        self.node.commit_index().await
    }
}
