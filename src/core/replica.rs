//! The consensus state context
//!
//! `Replica` is the single mutable instance of consensus state per process:
//! role, current term, vote, the cached log suffix with its snapshot
//! boundary, commit/apply cursors, and the current cluster configuration.
//! Every mutation is serialized through one owner (the server loop and RPC
//! handlers share it behind one async mutex); the RPC handlers here are
//! synchronous and transport-agnostic.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterConfig, MemberId};
use crate::core::replication::Progress;
use crate::core::snapshot::{Snapshot, SnapshotMeta};
use crate::events::{Event, EventBus};
use crate::state_machine::{ApplyResult, Command, Snapshotable};
use crate::storage::Storage;

/// Replica roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive state, receives updates from the leader
    Follower,
    /// Actively seeking votes to become leader
    Candidate,
    /// Handles all client requests and replicates the log
    Leader,
    /// Terminal state entered on explicit shutdown
    Stopped,
}

/// Payload of a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries from previous terms
    /// indirectly.
    Noop,
    /// A client command for the user state machine.
    Command(Command),
    /// A membership change; carries the full (possibly joint)
    /// configuration and takes effect as soon as it is appended.
    Config(ClusterConfig),
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Index in the log (1-indexed, gapless)
    pub index: u64,
    /// Term in which the entry was appended
    pub term: u64,
    pub payload: EntryPayload,
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: MemberId,
    /// Index of the candidate's last log entry
    pub last_log_index: u64,
    /// Term of the candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Current term, for the candidate to update itself
    pub term: u64,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments (empty `entries` is a heartbeat)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: MemberId,
    /// Index of the log entry immediately preceding the new ones
    pub prev_log_index: u64,
    /// Term of the entry at prev_log_index
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// AppendEntries RPC results
///
/// On success `match_index` is the last index the follower's log is known
/// to match. On failure the conflict fields hint where the leader should
/// resume: the first index of the conflicting term, or one past the
/// follower's last index when its log is short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
    pub conflict_index: Option<u64>,
    pub conflict_term: Option<u64>,
}

/// Result of handling an AppendEntries RPC
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The response to send back to the leader
    pub response: AppendResponse,
    /// Leader id if a valid leader was recognized
    pub leader_id: Option<MemberId>,
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_id: MemberId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Cluster configuration as of the last included entry
    pub config: ClusterConfig,
    /// Serialized state machine image
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotResponse {
    Success { term: u64 },
    Failed { term: u64, reason: String },
}

impl SnapshotResponse {
    pub fn term(&self) -> u64 {
        match self {
            SnapshotResponse::Success { term } => *term,
            SnapshotResponse::Failed { term, .. } => *term,
        }
    }
}

/// The consensus state context (sync, transport-agnostic)
pub struct Replica {
    // Storage backend for persistent state
    storage: Box<dyn Storage>,
    // State machine committed entries are applied to (must support snapshots)
    machine: Box<dyn Snapshotable>,
    // Subscriber registry; events fire synchronously after transitions
    events: EventBus,

    /// Unique identifier of this replica
    pub id: MemberId,
    pub role: Role,

    // Persistent state (cached in memory, always written through storage
    // before any RPC is answered)
    /// Latest term this replica has seen
    pub current_term: u64,
    /// Member voted for in the current term
    pub voted_for: Option<MemberId>,
    /// Log entries not covered by the snapshot; log[0] is the entry at
    /// index snapshot_last_index + 1
    pub log: Vec<LogEntry>,
    /// Last log index covered by the snapshot (0 if none)
    pub snapshot_last_index: u64,
    /// Term of the last snapshot-covered entry (0 if none)
    pub snapshot_last_term: u64,

    // Volatile state
    /// Highest log index known to be committed
    pub commit_index: u64,
    /// Highest log index applied to the state machine
    pub last_applied: u64,

    /// Current cluster configuration; mutated only by configuration entries
    /// (adopted on append) and snapshot installation
    pub cluster: ClusterConfig,
    /// Configuration effective at the snapshot boundary, the base for
    /// re-deriving `cluster` after a conflicting suffix is truncated
    fallback_config: ClusterConfig,

    // Leader-side replication progress, one record per known peer
    pub(crate) progress: HashMap<MemberId, Progress>,

    /// Members that granted a vote in the current election
    votes_granted: BTreeSet<MemberId>,
    /// Current known leader (set when receiving valid AppendEntries)
    pub leader_id: Option<MemberId>,
    /// Last time a valid leader was heard from (drives the election timer)
    pub last_leader_contact: Instant,
    /// Applied entries between automatic snapshots (0 = disabled)
    snapshot_threshold: u64,
}

impl Replica {
    /// Create a replica, recovering term, vote, log, and snapshot from
    /// storage. The given cluster configuration is only the seed: a
    /// configuration found in the snapshot or the log supersedes it.
    pub fn new(
        id: MemberId,
        cluster: ClusterConfig,
        storage: Box<dyn Storage>,
        mut machine: Box<dyn Snapshotable>,
    ) -> Self {
        let current_term = storage.load_term().expect("failed to load term from storage");
        let voted_for = storage.load_vote().expect("failed to load vote from storage");
        let log = storage.load_entries().expect("failed to load log from storage");

        let mut fallback_config = cluster;
        let (snapshot_last_index, snapshot_last_term) = match storage.load_snapshot() {
            Ok(Some(snapshot)) => {
                machine
                    .restore(&snapshot.data)
                    .expect("failed to restore state machine from snapshot");
                fallback_config = snapshot.meta.config;
                (snapshot.meta.last_included_index, snapshot.meta.last_included_term)
            }
            Ok(None) => (0, 0),
            Err(e) => panic!("failed to load snapshot from storage: {}", e),
        };

        // The latest configuration entry in the recovered log wins over the
        // snapshot's.
        let mut current_config = fallback_config.clone();
        for entry in &log {
            if let EntryPayload::Config(config) = &entry.payload {
                current_config = config.clone();
            }
        }

        // Everything in the snapshot is committed and applied.
        let commit_index = snapshot_last_index;
        let last_applied = snapshot_last_index;

        Replica {
            storage,
            machine,
            events: EventBus::new(),
            id,
            role: Role::Follower,
            current_term,
            voted_for,
            log,
            snapshot_last_index,
            snapshot_last_term,
            commit_index,
            last_applied,
            cluster: current_config,
            fallback_config,
            progress: HashMap::new(),
            votes_granted: BTreeSet::new(),
            leader_id: None,
            last_leader_contact: Instant::now(),
            snapshot_threshold: 1000,
        }
    }

    /// Subscriber registry for this replica's events.
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Number of applied entries between automatic snapshots (0 disables).
    pub fn set_snapshot_threshold(&mut self, threshold: u64) {
        self.snapshot_threshold = threshold;
    }

    // === Persistence helpers ===

    fn set_term(&mut self, term: u64) {
        self.current_term = term;
        self.storage.save_term(term).expect("failed to persist term");
    }

    fn set_vote(&mut self, vote: Option<MemberId>) {
        self.voted_for = vote;
        self.storage.save_vote(vote).expect("failed to persist vote");
    }

    /// Update term and clear the vote together (on discovering a higher term).
    fn update_term(&mut self, new_term: u64) {
        self.set_term(new_term);
        self.set_vote(None);
    }

    /// Append a single entry to the log and persist it. Configuration
    /// payloads take effect immediately.
    fn persist_entry(&mut self, entry: LogEntry) {
        if let EntryPayload::Config(config) = &entry.payload {
            self.install_config(config.clone());
        }
        self.storage
            .append_entries(std::slice::from_ref(&entry))
            .expect("failed to persist log entry");
        self.log.push(entry);
    }

    /// Drop every entry above `index` from log and storage.
    fn persist_truncate_after(&mut self, index: u64) {
        assert!(
            index >= self.commit_index,
            "refusing to truncate committed entries (index {}, commit {})",
            index,
            self.commit_index
        );
        let keep = index.saturating_sub(self.snapshot_last_index) as usize;
        if keep < self.log.len() {
            self.storage
                .truncate_after(index)
                .expect("failed to truncate log");
            self.log.truncate(keep);
        }
    }

    /// Adopt a configuration. On a leader this also creates progress
    /// records for members that just joined.
    pub(crate) fn install_config(&mut self, config: ClusterConfig) {
        self.cluster = config;
        if self.role == Role::Leader {
            self.sync_progress();
        }
    }

    /// Re-derive the current configuration after a log suffix was
    /// truncated: the latest surviving configuration entry, or the one at
    /// the snapshot boundary.
    fn rebuild_config(&mut self) {
        let mut config = self.fallback_config.clone();
        for entry in &self.log {
            if let EntryPayload::Config(c) = &entry.payload {
                config = c.clone();
            }
        }
        self.install_config(config);
    }

    // === Log accessors ===

    /// Last log index (the snapshot boundary if the log is empty).
    pub fn last_log_index(&self) -> u64 {
        match self.log.last() {
            Some(entry) => entry.index,
            None => self.snapshot_last_index,
        }
    }

    /// Term of the last log entry (the snapshot's if the log is empty).
    pub fn last_log_term(&self) -> u64 {
        match self.log.last() {
            Some(entry) => entry.term,
            None => self.snapshot_last_term,
        }
    }

    /// Entry at `index`, or None if it is covered by the snapshot or past
    /// the end of the log.
    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_last_index {
            return None;
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log.get(offset)
    }

    /// Term of the entry at `index`, honoring the snapshot boundary.
    pub fn entry_term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            Some(0)
        } else if index == self.snapshot_last_index {
            Some(self.snapshot_last_term)
        } else {
            self.entry_at(index).map(|e| e.term)
        }
    }

    /// Whether a candidate's log is at least as up-to-date as ours:
    /// higher last term wins; equal terms compare last index.
    pub fn log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= my_last_index)
    }

    // === Role transitions ===

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            self.role = role;
            self.events.emit(&Event::StateChanged { member: self.id, role });
        }
    }

    /// Demote to follower at a higher term. The sole mechanism preventing
    /// stale leaders from committing.
    pub(crate) fn step_down(&mut self, term: u64) {
        let old_role = self.role;
        self.update_term(term);
        self.set_role(Role::Follower);
        self.leader_id = None;
        self.votes_granted.clear();
        if old_role != Role::Follower {
            info!(id = self.id, term, ?old_role, "stepped down to follower");
        }
    }

    /// Enter the terminal Stopped state; all RPC handlers refuse from here.
    pub fn stop(&mut self) {
        self.set_role(Role::Stopped);
    }

    // === RPC handlers ===

    /// Handle a RequestVote RPC.
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> VoteResponse {
        if self.role == Role::Stopped || req.term < self.current_term {
            return VoteResponse { term: self.current_term, vote_granted: false };
        }

        if req.term > self.current_term {
            self.step_down(req.term);
        }

        // One vote per term.
        if self.voted_for.is_some() && self.voted_for != Some(req.candidate_id) {
            return VoteResponse { term: self.current_term, vote_granted: false };
        }

        // Election restriction: only vote for candidates whose log is at
        // least as up-to-date.
        if !self.log_up_to_date(req.last_log_term, req.last_log_index) {
            return VoteResponse { term: self.current_term, vote_granted: false };
        }

        self.set_vote(Some(req.candidate_id));
        // Granting a vote resets the election timer.
        self.last_leader_contact = Instant::now();
        debug!(id = self.id, candidate = req.candidate_id, term = self.current_term, "vote granted");

        VoteResponse { term: self.current_term, vote_granted: true }
    }

    /// Handle an AppendEntries RPC (heartbeat or replication).
    pub fn handle_append_request(&mut self, req: &AppendRequest) -> AppendOutcome {
        if self.role == Role::Stopped {
            return self.reject_append(None, None);
        }

        if req.term > self.current_term {
            self.step_down(req.term);
        }

        if req.term < self.current_term {
            return self.reject_append(None, None);
        }

        // Valid leader for the current term: accept leadership.
        self.set_role(Role::Follower);
        self.leader_id = Some(req.leader_id);
        self.last_leader_contact = Instant::now();

        // Consistency check at (prev_log_index, prev_log_term).
        if req.prev_log_index > self.last_log_index() {
            let hint = self.last_log_index() + 1;
            let mut outcome = self.reject_append(Some(hint), None);
            outcome.leader_id = Some(req.leader_id);
            return outcome;
        }
        if req.prev_log_index > self.snapshot_last_index {
            let local_term = self.entry_term(req.prev_log_index);
            if local_term != Some(req.prev_log_term) {
                let conflict_term = local_term;
                // First index of the conflicting term, so the leader can
                // skip the whole run.
                let mut conflict_index = req.prev_log_index;
                while conflict_index > self.snapshot_last_index + 1
                    && self.entry_term(conflict_index - 1) == conflict_term
                {
                    conflict_index -= 1;
                }
                let mut outcome = self.reject_append(Some(conflict_index), conflict_term);
                outcome.leader_id = Some(req.leader_id);
                return outcome;
            }
        } else if req.prev_log_index == self.snapshot_last_index
            && self.snapshot_last_index > 0
            && req.prev_log_term != self.snapshot_last_term
        {
            let mut outcome = self.reject_append(Some(self.snapshot_last_index), None);
            outcome.leader_id = Some(req.leader_id);
            return outcome;
        }
        // prev_log_index below the snapshot boundary: everything there is
        // committed, so it matches by definition; covered entries are
        // skipped during ingest.

        self.ingest_entries(&req.entries);

        // The log is verified to match through the last new entry; a tail
        // beyond it may still diverge, so the commit index never crosses it.
        let match_index = req.prev_log_index + req.entries.len() as u64;
        let commit_cap = match_index.max(self.commit_index);
        if req.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(req.leader_commit, commit_cap);
            self.apply_committed_entries();
        }
        AppendOutcome {
            response: AppendResponse {
                term: self.current_term,
                success: true,
                match_index,
                conflict_index: None,
                conflict_term: None,
            },
            leader_id: Some(req.leader_id),
        }
    }

    fn reject_append(&self, conflict_index: Option<u64>, conflict_term: Option<u64>) -> AppendOutcome {
        AppendOutcome {
            response: AppendResponse {
                term: self.current_term,
                success: false,
                match_index: 0,
                conflict_index,
                conflict_term,
            },
            leader_id: None,
        }
    }

    /// Store replicated entries, resolving conflicts: an existing entry
    /// with the same index but a different term is deleted together with
    /// everything after it.
    fn ingest_entries(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            // Already covered by the snapshot.
            if entry.index <= self.snapshot_last_index {
                continue;
            }

            let pos = (entry.index - self.snapshot_last_index - 1) as usize;
            if pos < self.log.len() {
                if self.log[pos].term != entry.term {
                    self.persist_truncate_after(entry.index - 1);
                    self.rebuild_config();
                    self.persist_entry(entry.clone());
                    debug!(id = self.id, index = entry.index, term = entry.term, "replaced conflicting entry");
                }
                // Same index and term: already present, skip (idempotent).
            } else {
                self.persist_entry(entry.clone());
                debug!(id = self.id, index = entry.index, term = entry.term, "replicated entry");
            }
        }
    }

    /// Handle an InstallSnapshot RPC.
    pub fn handle_install_snapshot(&mut self, req: &SnapshotRequest) -> SnapshotResponse {
        if self.role == Role::Stopped || req.term < self.current_term {
            return SnapshotResponse::Failed {
                term: self.current_term,
                reason: "stale term".to_string(),
            };
        }

        if req.term > self.current_term {
            self.step_down(req.term);
        }

        self.set_role(Role::Follower);
        self.leader_id = Some(req.leader_id);
        self.last_leader_contact = Instant::now();

        if req.last_included_index <= self.snapshot_last_index {
            return SnapshotResponse::Failed {
                term: self.current_term,
                reason: format!(
                    "snapshot too old: {} <= {}",
                    req.last_included_index, self.snapshot_last_index
                ),
            };
        }

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: req.last_included_index,
                last_included_term: req.last_included_term,
                config: req.config.clone(),
            },
            data: req.data.clone(),
        };

        // Persist first so disk and memory cannot diverge.
        if let Err(e) = self.storage.compact_before(req.last_included_index, &snapshot) {
            return SnapshotResponse::Failed {
                term: self.current_term,
                reason: format!("failed to save snapshot: {}", e),
            };
        }

        // The snapshot is durable; a state machine that cannot load it is
        // unrecoverable for this generation.
        self.machine
            .restore(&req.data)
            .expect("failed to restore state machine from installed snapshot");

        self.snapshot_last_index = req.last_included_index;
        self.snapshot_last_term = req.last_included_term;
        self.fallback_config = req.config.clone();

        // Drop log entries the snapshot covers; a surviving suffix may
        // carry a newer configuration than the snapshot's.
        self.log.retain(|entry| entry.index > req.last_included_index);
        self.rebuild_config();

        self.commit_index = self.commit_index.max(req.last_included_index);
        self.last_applied = self.last_applied.max(req.last_included_index);

        info!(
            id = self.id,
            last_included_index = req.last_included_index,
            "installed snapshot"
        );
        self.events.emit(&Event::SnapshotInstalled {
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
        });

        SnapshotResponse::Success { term: self.current_term }
    }

    // === Elections ===

    /// Start a new election: increment the term, become candidate, vote for
    /// self. Returns true if that self-vote already wins (single-member
    /// cluster).
    pub fn start_election(&mut self) -> bool {
        if self.role == Role::Stopped {
            return false;
        }

        self.set_term(self.current_term + 1);
        self.set_role(Role::Candidate);
        self.leader_id = None;
        self.set_vote(Some(self.id));

        self.votes_granted.clear();
        self.votes_granted.insert(self.id);

        // Reset the timer so we do not immediately time out again.
        self.last_leader_contact = Instant::now();
        info!(id = self.id, term = self.current_term, "became candidate");

        if self.cluster.has_quorum(&self.votes_granted) {
            self.become_leader();
            return true;
        }
        false
    }

    /// Record a vote response. Returns true if this replica just won the
    /// election (a quorum of the current, possibly joint, configuration).
    pub fn record_vote_response(&mut self, peer: MemberId, resp: &VoteResponse) -> bool {
        if resp.term > self.current_term {
            self.step_down(resp.term);
            return false;
        }

        if self.role != Role::Candidate {
            return false;
        }

        if resp.vote_granted {
            self.votes_granted.insert(peer);
        }

        if self.cluster.has_quorum(&self.votes_granted) {
            self.become_leader();
            return true;
        }
        false
    }

    /// Transition to leader after winning an election.
    fn become_leader(&mut self) {
        self.set_role(Role::Leader);
        self.leader_id = Some(self.id);
        self.last_leader_contact = Instant::now();
        info!(id = self.id, term = self.current_term, "became leader");

        // Progress is initialized before the no-op append so next_index
        // points at the no-op and the first round carries it.
        self.reset_progress();

        // The no-op lets entries from previous terms commit indirectly
        // (a leader only counts quorums for entries of its own term).
        self.append_payload(EntryPayload::Noop);

        self.events.emit(&Event::LeaderElected {
            term: self.current_term,
            leader: self.id,
        });
    }

    // === Appending (leader side) ===

    /// Append a payload at the next index in the current term. Callers
    /// must hold the leader role (checked by the command pipeline).
    pub(crate) fn append_payload(&mut self, payload: EntryPayload) -> u64 {
        let index = self.last_log_index() + 1;
        let entry = LogEntry { index, term: self.current_term, payload };
        self.persist_entry(entry);
        index
    }

    /// Validate a command against the user state machine.
    pub fn validate_command(&self, command: &Command) -> Result<(), String> {
        self.machine.validate(command)
    }

    /// Append a client command. Returns the entry's index, or None when
    /// called on a non-leader.
    pub fn append_command(&mut self, command: Command) -> Option<u64> {
        if self.role != Role::Leader {
            return None;
        }
        let name = command.name.clone();
        let index = self.append_payload(EntryPayload::Command(command));
        debug!(id = self.id, index, term = self.current_term, command = %name, "appended command");
        Some(index)
    }

    /// Append a configuration entry; the configuration takes effect
    /// immediately. Returns the entry's index, or None when called on a
    /// non-leader.
    pub fn append_config(&mut self, config: ClusterConfig) -> Option<u64> {
        if self.role != Role::Leader {
            return None;
        }
        let index = self.append_payload(EntryPayload::Config(config));
        info!(id = self.id, index, term = self.current_term, "appended configuration entry");
        Some(index)
    }

    // === Applying ===

    /// Apply committed entries in index order, up to commit_index. Returns
    /// (index, result) per applied entry. Triggers automatic snapshot
    /// compaction when the threshold is reached.
    pub fn apply_committed_entries(&mut self) -> Vec<(u64, ApplyResult)> {
        let mut results = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let index = self.last_applied;

            let payload = match self.entry_at(index) {
                Some(entry) => entry.payload.clone(),
                None => panic!(
                    "applying entry {} which is inside the snapshot (boundary {})",
                    index, self.snapshot_last_index
                ),
            };

            let result = match payload {
                EntryPayload::Noop => Ok(String::new()),
                EntryPayload::Command(command) => {
                    let result = self.machine.apply(&command);
                    self.events.emit(&Event::CommandApplied { index, name: command.name });
                    result
                }
                EntryPayload::Config(config) => {
                    // The config was adopted when appended; committing it
                    // makes the change observable.
                    self.events.emit(&Event::MembershipChanged { config });
                    Ok(String::new())
                }
            };
            results.push((index, result));
        }

        // All roles compact independently to bound log growth; leaders
        // additionally push snapshots to followers that fall behind.
        if self.snapshot_threshold > 0
            && self.last_applied - self.snapshot_last_index >= self.snapshot_threshold
        {
            info!(
                id = self.id,
                applied_since = self.last_applied - self.snapshot_last_index,
                "automatic snapshot triggered"
            );
            if let Err(e) = self.take_snapshot() {
                warn!(id = self.id, error = %e, "automatic snapshot failed");
            }
        }

        results
    }

    // === Snapshot compaction ===

    /// Compact the log up to last_applied: capture the state machine
    /// image, persist it with the snapshot metadata, and drop covered
    /// entries.
    pub fn take_snapshot(&mut self) -> Result<(), String> {
        if self.last_applied <= self.snapshot_last_index {
            return Err(format!(
                "nothing to snapshot: last_applied {} already covered by {}",
                self.last_applied, self.snapshot_last_index
            ));
        }

        let last_term = self
            .entry_term(self.last_applied)
            .ok_or_else(|| format!("no term known for applied index {}", self.last_applied))?;
        let data = self.machine.snapshot()?;

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: self.last_applied,
                last_included_term: last_term,
                config: self.cluster.clone(),
            },
            data,
        };

        self.storage
            .compact_before(self.last_applied, &snapshot)
            .map_err(|e| format!("failed to persist snapshot: {}", e))?;

        let boundary = self.last_applied;
        self.log.retain(|entry| entry.index > boundary);
        self.snapshot_last_index = boundary;
        self.snapshot_last_term = last_term;
        self.fallback_config = self.cluster.clone();

        info!(id = self.id, last_included_index = boundary, "compacted log into snapshot");
        Ok(())
    }

    /// Load the persisted snapshot (for installing on a lagging follower).
    pub fn load_snapshot(&self) -> Result<Option<Snapshot>, crate::storage::StorageError> {
        self.storage.load_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemberConfig, MembershipChange};
    use crate::state_machine::RecordingMachine;
    use crate::storage::MemoryStorage;

    fn test_cluster(ids: &[MemberId]) -> ClusterConfig {
        ClusterConfig::new(ids.iter().map(|&id| MemberConfig::new(id, format!("mem://{}", id))))
    }

    fn new_replica(id: MemberId, ids: &[MemberId]) -> Replica {
        Replica::new(
            id,
            test_cluster(ids),
            Box::new(MemoryStorage::new()),
            Box::new(RecordingMachine::new()),
        )
    }

    fn command_entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            payload: EntryPayload::Command(Command::new("set", ["x", "1"])),
        }
    }

    fn append(term: u64, leader: MemberId, prev_index: u64, prev_term: u64, entries: Vec<LogEntry>, commit: u64) -> AppendRequest {
        AppendRequest {
            term,
            leader_id: leader,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    fn test_new_replica_is_follower() {
        let replica = new_replica(1, &[1, 2, 3]);
        assert_eq!(replica.role, Role::Follower);
        assert_eq!(replica.current_term, 0);
        assert_eq!(replica.last_log_index(), 0);
        assert_eq!(replica.cluster.len(), 3);
    }

    #[test]
    fn test_start_election() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let won = replica.start_election();

        assert!(!won);
        assert_eq!(replica.role, Role::Candidate);
        assert_eq!(replica.current_term, 1);
        assert_eq!(replica.voted_for, Some(1));
    }

    #[test]
    fn test_single_member_wins_immediately() {
        let mut replica = new_replica(1, &[1]);
        let won = replica.start_election();

        assert!(won);
        assert_eq!(replica.role, Role::Leader);
        // The no-op for the new term is already appended.
        assert_eq!(replica.last_log_index(), 1);
        assert_eq!(replica.entry_at(1).unwrap().payload, EntryPayload::Noop);
    }

    #[test]
    fn test_vote_granted_and_timer_reset() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let req = VoteRequest { term: 1, candidate_id: 2, last_log_index: 0, last_log_term: 0 };

        let resp = replica.handle_vote_request(&req);
        assert!(resp.vote_granted);
        assert_eq!(replica.voted_for, Some(2));
    }

    #[test]
    fn test_vote_denied_stale_term() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        replica.set_term(5);

        let req = VoteRequest { term: 3, candidate_id: 2, last_log_index: 0, last_log_term: 0 };
        let resp = replica.handle_vote_request(&req);

        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
        assert_eq!(replica.voted_for, None);
    }

    #[test]
    fn test_no_second_vote_in_same_term() {
        let mut replica = new_replica(1, &[1, 2, 3]);

        let req2 = VoteRequest { term: 1, candidate_id: 2, last_log_index: 0, last_log_term: 0 };
        assert!(replica.handle_vote_request(&req2).vote_granted);

        let req3 = VoteRequest { term: 1, candidate_id: 3, last_log_index: 0, last_log_term: 0 };
        assert!(!replica.handle_vote_request(&req3).vote_granted);
        assert_eq!(replica.voted_for, Some(2));

        // A retransmission from the same candidate is granted again.
        assert!(replica.handle_vote_request(&req2).vote_granted);
    }

    #[test]
    fn test_vote_denied_outdated_log() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let out = replica.handle_append_request(&append(3, 2, 0, 0, vec![command_entry(1, 3)], 0));
        assert!(out.response.success);

        // Candidate's last log term (2) is behind ours (3).
        let req = VoteRequest { term: 4, candidate_id: 3, last_log_index: 5, last_log_term: 2 };
        let resp = replica.handle_vote_request(&req);

        assert!(!resp.vote_granted);
        assert_eq!(replica.current_term, 4);
    }

    #[test]
    fn test_vote_denied_shorter_log_same_term() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let entries = vec![command_entry(1, 2), command_entry(2, 2)];
        replica.handle_append_request(&append(2, 2, 0, 0, entries, 0));

        let req = VoteRequest { term: 3, candidate_id: 3, last_log_index: 1, last_log_term: 2 };
        assert!(!replica.handle_vote_request(&req).vote_granted);
    }

    #[test]
    fn test_append_accepts_and_records_leader() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let out = replica.handle_append_request(&append(1, 2, 0, 0, vec![command_entry(1, 1)], 0));

        assert!(out.response.success);
        assert_eq!(out.response.match_index, 1);
        assert_eq!(out.leader_id, Some(2));
        assert_eq!(replica.leader_id, Some(2));
        assert_eq!(replica.last_log_index(), 1);
    }

    #[test]
    fn test_append_rejects_stale_term() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        replica.set_term(2);

        let out = replica.handle_append_request(&append(1, 2, 0, 0, vec![], 0));

        assert!(!out.response.success);
        assert_eq!(out.leader_id, None);
        assert_eq!(replica.leader_id, None);
    }

    #[test]
    fn test_append_conflict_hint_short_log() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        // Empty log, leader claims prev at index 5.
        let out = replica.handle_append_request(&append(1, 2, 5, 1, vec![], 0));

        assert!(!out.response.success);
        assert_eq!(out.response.conflict_index, Some(1));
        assert_eq!(out.response.conflict_term, None);
    }

    #[test]
    fn test_append_conflict_hint_term_mismatch() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        // Three entries of term 1.
        let entries = vec![command_entry(1, 1), command_entry(2, 1), command_entry(3, 1)];
        replica.handle_append_request(&append(1, 2, 0, 0, entries, 0));

        // New leader at term 3 probes prev (3, term 2): mismatch; hint must
        // point at the first index of the conflicting term run.
        let out = replica.handle_append_request(&append(3, 3, 3, 2, vec![], 0));

        assert!(!out.response.success);
        assert_eq!(out.response.conflict_term, Some(1));
        assert_eq!(out.response.conflict_index, Some(1));
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let entries = vec![command_entry(1, 1), command_entry(2, 1)];
        replica.handle_append_request(&append(1, 2, 0, 0, entries, 0));

        // New leader replaces index 2 with a term-2 entry.
        let replacement = LogEntry {
            index: 2,
            term: 2,
            payload: EntryPayload::Command(Command::new("set", ["y", "new"])),
        };
        let out = replica.handle_append_request(&append(2, 3, 1, 1, vec![replacement], 0));

        assert!(out.response.success);
        assert_eq!(replica.last_log_index(), 2);
        assert_eq!(replica.entry_at(2).unwrap().term, 2);
    }

    #[test]
    fn test_append_is_idempotent() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let req = append(1, 2, 0, 0, vec![command_entry(1, 1)], 0);

        assert!(replica.handle_append_request(&req).response.success);
        assert!(replica.handle_append_request(&req).response.success);
        assert_eq!(replica.log.len(), 1);
    }

    #[test]
    fn test_commit_capped_by_log_length() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let out = replica.handle_append_request(&append(1, 2, 0, 0, vec![command_entry(1, 1)], 5));

        assert!(out.response.success);
        assert_eq!(replica.commit_index, 1);
        assert_eq!(replica.last_applied, 1);
    }

    #[test]
    fn test_candidate_steps_down_on_append_from_leader() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        replica.start_election();
        assert_eq!(replica.role, Role::Candidate);

        let out = replica.handle_append_request(&append(1, 2, 0, 0, vec![], 0));

        assert!(out.response.success);
        assert_eq!(replica.role, Role::Follower);
    }

    #[test]
    fn test_higher_term_response_demotes_candidate() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        replica.start_election();

        let resp = VoteResponse { term: 5, vote_granted: false };
        let won = replica.record_vote_response(2, &resp);

        assert!(!won);
        assert_eq!(replica.role, Role::Follower);
        assert_eq!(replica.current_term, 5);
        assert_eq!(replica.voted_for, None);
    }

    #[test]
    fn test_majority_votes_win_election() {
        let mut replica = new_replica(1, &[1, 2, 3, 4, 5]);
        replica.start_election();

        let granted = VoteResponse { term: 1, vote_granted: true };
        let denied = VoteResponse { term: 1, vote_granted: false };

        assert!(!replica.record_vote_response(2, &granted)); // 2 of 5
        assert!(!replica.record_vote_response(3, &denied)); // still 2
        assert!(replica.record_vote_response(4, &granted)); // 3 of 5
        assert_eq!(replica.role, Role::Leader);
    }

    #[test]
    fn test_duplicate_votes_counted_once() {
        let mut replica = new_replica(1, &[1, 2, 3, 4, 5]);
        replica.start_election();

        let granted = VoteResponse { term: 1, vote_granted: true };
        assert!(!replica.record_vote_response(2, &granted));
        assert!(!replica.record_vote_response(2, &granted));
        assert!(replica.record_vote_response(3, &granted));
    }

    #[test]
    fn test_leader_appends_noop_and_resets_progress() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        replica.handle_append_request(&append(1, 2, 0, 0, vec![command_entry(1, 1)], 0));

        replica.start_election();
        let granted = VoteResponse { term: 2, vote_granted: true };
        assert!(replica.record_vote_response(2, &granted));

        // No-op appended at index 2; next_index for peers points at it.
        assert_eq!(replica.last_log_index(), 2);
        assert_eq!(replica.entry_at(2).unwrap().payload, EntryPayload::Noop);
        assert_eq!(replica.progress.get(&2).unwrap().next_index, 2);
        assert_eq!(replica.progress.get(&3).unwrap().match_index, 0);
    }

    #[test]
    fn test_append_command_requires_leader() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        assert!(replica.append_command(Command::new("set", ["x", "1"])).is_none());

        replica.start_election();
        let granted = VoteResponse { term: 1, vote_granted: true };
        replica.record_vote_response(2, &granted);

        let index = replica.append_command(Command::new("set", ["x", "1"]));
        assert_eq!(index, Some(2)); // after the no-op
    }

    #[test]
    fn test_stopped_refuses_everything() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        replica.stop();

        assert_eq!(replica.role, Role::Stopped);
        let vote = VoteRequest { term: 9, candidate_id: 2, last_log_index: 0, last_log_term: 0 };
        assert!(!replica.handle_vote_request(&vote).vote_granted);
        assert!(!replica.handle_append_request(&append(9, 2, 0, 0, vec![], 0)).response.success);
        assert!(!replica.start_election());
    }

    #[test]
    fn test_config_entry_adopted_on_append() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let joint = test_cluster(&[1, 2, 3])
            .joint_for(&MembershipChange::Add(MemberConfig::new(4, "mem://4")))
            .unwrap();

        let entry = LogEntry { index: 1, term: 1, payload: EntryPayload::Config(joint.clone()) };
        let out = replica.handle_append_request(&append(1, 2, 0, 0, vec![entry], 0));

        assert!(out.response.success);
        assert!(replica.cluster.is_joint());
        assert_eq!(replica.cluster.len(), 4);
    }

    #[test]
    fn test_truncating_config_entry_restores_previous_config() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let joint = test_cluster(&[1, 2, 3])
            .joint_for(&MembershipChange::Add(MemberConfig::new(4, "mem://4")))
            .unwrap();

        // Uncommitted config entry from a leader that then crashes.
        let entry = LogEntry { index: 1, term: 1, payload: EntryPayload::Config(joint) };
        replica.handle_append_request(&append(1, 2, 0, 0, vec![entry], 0));
        assert!(replica.cluster.is_joint());

        // The next leader overwrites index 1 with a plain command.
        let out = replica.handle_append_request(&append(2, 3, 0, 0, vec![command_entry(1, 2)], 0));

        assert!(out.response.success);
        assert!(!replica.cluster.is_joint());
        assert_eq!(replica.cluster.len(), 3);
    }

    #[test]
    fn test_take_snapshot_compacts_log() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        replica.set_snapshot_threshold(0);
        let entries = (1..=3).map(|i| command_entry(i, 1)).collect();
        replica.handle_append_request(&append(1, 2, 0, 0, entries, 3));
        assert_eq!(replica.last_applied, 3);

        replica.take_snapshot().unwrap();

        assert_eq!(replica.snapshot_last_index, 3);
        assert_eq!(replica.snapshot_last_term, 1);
        assert!(replica.log.is_empty());
        assert_eq!(replica.last_log_index(), 3);

        // Appends continue past the boundary.
        let out = replica.handle_append_request(&append(1, 2, 3, 1, vec![command_entry(4, 1)], 3));
        assert!(out.response.success);
        assert_eq!(replica.last_log_index(), 4);
    }

    #[test]
    fn test_snapshot_threshold_triggers_compaction() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        replica.set_snapshot_threshold(2);

        let entries = (1..=4).map(|i| command_entry(i, 1)).collect();
        replica.handle_append_request(&append(1, 2, 0, 0, entries, 4));

        // Threshold reached while applying; the log is compacted.
        assert_eq!(replica.snapshot_last_index, 4);
        assert!(replica.log.is_empty());
    }

    #[test]
    fn test_install_snapshot() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let config = test_cluster(&[1, 2, 3]);
        let image = RecordingMachine::new().snapshot().unwrap();

        let req = SnapshotRequest {
            term: 2,
            leader_id: 2,
            last_included_index: 100,
            last_included_term: 2,
            config: config.clone(),
            data: image,
        };
        let resp = replica.handle_install_snapshot(&req);

        assert!(matches!(resp, SnapshotResponse::Success { term: 2 }));
        assert_eq!(replica.snapshot_last_index, 100);
        assert_eq!(replica.commit_index, 100);
        assert_eq!(replica.last_applied, 100);

        // AppendEntries at index 101 succeeds without the compacted prefix.
        let out = replica.handle_append_request(&append(2, 2, 100, 2, vec![command_entry(101, 2)], 100));
        assert!(out.response.success);
        assert_eq!(replica.last_log_index(), 101);
    }

    #[test]
    fn test_install_snapshot_rejects_stale() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        replica.set_term(5);

        let req = SnapshotRequest {
            term: 3,
            leader_id: 2,
            last_included_index: 10,
            last_included_term: 1,
            config: test_cluster(&[1, 2, 3]),
            data: vec![],
        };
        assert!(matches!(replica.handle_install_snapshot(&req), SnapshotResponse::Failed { .. }));
    }

    #[test]
    fn test_install_snapshot_rejects_older_than_current() {
        let mut replica = new_replica(1, &[1, 2, 3]);
        let image = RecordingMachine::new().snapshot().unwrap();
        let config = test_cluster(&[1, 2, 3]);

        let req = SnapshotRequest {
            term: 2,
            leader_id: 2,
            last_included_index: 50,
            last_included_term: 2,
            config: config.clone(),
            data: image.clone(),
        };
        replica.handle_install_snapshot(&req);

        let older = SnapshotRequest { last_included_index: 40, ..req };
        let resp = replica.handle_install_snapshot(&older);
        assert!(matches!(resp, SnapshotResponse::Failed { .. }));
    }

    #[test]
    fn test_recovery_from_storage() {
        let mut storage = MemoryStorage::new();
        storage.save_term(7).unwrap();
        storage.save_vote(Some(2)).unwrap();
        storage
            .append_entries(&[command_entry(1, 6), command_entry(2, 7)])
            .unwrap();

        let replica = Replica::new(
            1,
            test_cluster(&[1, 2, 3]),
            Box::new(storage),
            Box::new(RecordingMachine::new()),
        );

        assert_eq!(replica.current_term, 7);
        assert_eq!(replica.voted_for, Some(2));
        assert_eq!(replica.last_log_index(), 2);
        assert_eq!(replica.last_log_term(), 7);
    }

    #[test]
    fn test_recovery_adopts_config_from_log() {
        let joint = test_cluster(&[1, 2, 3])
            .joint_for(&MembershipChange::Add(MemberConfig::new(4, "mem://4")))
            .unwrap();

        let mut storage = MemoryStorage::new();
        storage
            .append_entries(&[
                command_entry(1, 1),
                LogEntry { index: 2, term: 1, payload: EntryPayload::Config(joint) },
            ])
            .unwrap();

        let replica = Replica::new(
            1,
            test_cluster(&[1, 2, 3]),
            Box::new(storage),
            Box::new(RecordingMachine::new()),
        );

        assert!(replica.cluster.is_joint());
        assert_eq!(replica.cluster.len(), 4);
    }

    #[test]
    fn test_events_emitted_on_transitions() {
        use crate::events::EventKind;
        use std::sync::{Arc, Mutex};

        let mut replica = new_replica(1, &[1]);
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let events = replica.events();
        let seen_clone = seen.clone();
        events.subscribe(EventKind::StateChanged, move |_| {
            seen_clone.lock().unwrap().push("state");
        });
        let seen_clone = seen.clone();
        events.subscribe(EventKind::LeaderElected, move |_| {
            seen_clone.lock().unwrap().push("elected");
        });

        replica.start_election();

        let seen = seen.lock().unwrap();
        // Candidate, then Leader, then the election event.
        assert_eq!(*seen, vec!["state", "state", "elected"]);
    }
}
