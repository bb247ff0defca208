//! Leader-side replication: per-follower progress, batch construction,
//! conflict backoff, and quorum-based commit advancement.
//!
//! A leader keeps one `Progress` record per known peer. Each replication
//! round sends every peer the entries from its `next_index`; a peer whose
//! `next_index` has fallen below the retained log gets a snapshot instead.
//! Commit advancement counts configuration quorums of `match_index` and
//! applies the term-matching rule: only entries of the leader's own term
//! commit by counting, earlier entries commit transitively.

use std::collections::BTreeSet;

use tracing::debug;

use crate::cluster::MemberId;
use crate::core::replica::{
    AppendRequest, AppendResponse, Replica, Role, SnapshotRequest,
};
use crate::state_machine::ApplyResult;

/// Replication state for a single follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Index of the next entry to send
    pub next_index: u64,
    /// Highest index known to be replicated
    pub match_index: u64,
}

/// One outbound replication message: entries when the peer's next index is
/// inside the retained log, a snapshot when it is not.
#[derive(Debug, Clone)]
pub enum ReplicationRequest {
    Entries(AppendRequest),
    Snapshot(SnapshotRequest),
}

impl Replica {
    /// Re-initialize progress for every peer (on becoming leader):
    /// next_index one past the local log, match_index unknown.
    pub(crate) fn reset_progress(&mut self) {
        let next = self.last_log_index() + 1;
        self.progress.clear();
        for peer in self.cluster.peer_ids(self.id) {
            self.progress.insert(peer, Progress { next_index: next, match_index: 0 });
        }
    }

    /// Add progress records for peers that just entered the configuration.
    /// Existing records (including those of leaving members) are kept; they
    /// are pruned only when the final configuration entry commits.
    pub(crate) fn sync_progress(&mut self) {
        let next = self.last_log_index() + 1;
        for peer in self.cluster.peer_ids(self.id) {
            self.progress
                .entry(peer)
                .or_insert(Progress { next_index: next, match_index: 0 });
        }
    }

    /// Drop progress records of members no longer in the configuration.
    /// Called when a final (non-joint) configuration entry commits; from
    /// here no further entries are sent to removed members.
    pub(crate) fn prune_progress(&mut self) {
        let cluster = &self.cluster;
        self.progress.retain(|peer, _| cluster.contains(*peer));
    }

    /// Peers a leader currently replicates to.
    pub fn replication_peers(&self) -> Vec<MemberId> {
        self.progress.keys().copied().collect()
    }

    /// Build the replication message for one peer, or None when the peer
    /// needs a snapshot that cannot be loaded.
    pub fn build_replication(&self, peer: MemberId) -> Option<ReplicationRequest> {
        let progress = self.progress.get(&peer)?;

        // Peer is behind the retained log: only a snapshot can help.
        if progress.next_index <= self.snapshot_last_index {
            let snapshot = self.load_snapshot().ok().flatten()?;
            return Some(ReplicationRequest::Snapshot(SnapshotRequest {
                term: self.current_term,
                leader_id: self.id,
                last_included_index: snapshot.meta.last_included_index,
                last_included_term: snapshot.meta.last_included_term,
                config: snapshot.meta.config,
                data: snapshot.data,
            }));
        }

        let prev_log_index = progress.next_index - 1;
        let prev_log_term = self.entry_term(prev_log_index)?;

        let entries: Vec<_> = self
            .log
            .iter()
            .filter(|e| e.index >= progress.next_index)
            .cloned()
            .collect();

        Some(ReplicationRequest::Entries(AppendRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }))
    }

    /// Process an AppendEntries response from a peer: update its progress,
    /// back off on rejection using the conflict hint, and advance the
    /// commit index when a quorum matches. Returns the entries applied as a
    /// result of the advancement.
    pub fn record_append_response(
        &mut self,
        peer: MemberId,
        resp: &AppendResponse,
    ) -> Vec<(u64, ApplyResult)> {
        if resp.term > self.current_term {
            self.step_down(resp.term);
            return Vec::new();
        }

        if self.role != Role::Leader {
            return Vec::new();
        }

        let Some(progress) = self.progress.get_mut(&peer) else {
            return Vec::new();
        };

        if resp.success {
            // Stale responses must never move match_index backwards.
            if resp.match_index > progress.match_index {
                progress.match_index = resp.match_index;
            }
            progress.next_index = progress.match_index + 1;
            return self.advance_commit();
        }

        // Rejected: jump back using the follower's hint. If it reported a
        // conflicting term we still hold, resume right after our last entry
        // of that term; otherwise resume at the reported index.
        let mut next = progress.next_index.saturating_sub(1).max(1);
        if let Some(conflict_term) = resp.conflict_term {
            if let Some(last_of_term) = self.last_index_of_term(conflict_term) {
                next = last_of_term + 1;
            } else if let Some(conflict_index) = resp.conflict_index {
                next = conflict_index.max(1);
            }
        } else if let Some(conflict_index) = resp.conflict_index {
            next = conflict_index.max(1);
        }

        // Borrow again; the hint search above needed &self.
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.next_index = next;
            debug!(id = self.id, peer, next_index = next, "replication rejected, backing off");
        }
        Vec::new()
    }

    /// Record a successful snapshot installation on a peer.
    pub fn record_snapshot_installed(&mut self, peer: MemberId, last_included_index: u64) {
        if let Some(progress) = self.progress.get_mut(&peer) {
            if last_included_index > progress.match_index {
                progress.match_index = last_included_index;
            }
            progress.next_index = progress.match_index + 1;
        }
    }

    /// Advance the commit index to the highest N such that a configuration
    /// quorum has match_index >= N (the leader counts itself) and the entry
    /// at N carries the current term. Applies newly committed entries.
    pub(crate) fn advance_commit(&mut self) -> Vec<(u64, ApplyResult)> {
        let mut new_commit = self.commit_index;

        for n in (self.commit_index + 1)..=self.last_log_index() {
            // Term-matching rule: never count a quorum for an entry of a
            // previous term.
            if self.entry_term(n) != Some(self.current_term) {
                continue;
            }

            let mut matched: BTreeSet<MemberId> = BTreeSet::new();
            matched.insert(self.id);
            for (peer, progress) in &self.progress {
                if progress.match_index >= n {
                    matched.insert(*peer);
                }
            }

            if self.cluster.has_quorum(&matched) {
                new_commit = n;
            }
        }

        if new_commit > self.commit_index {
            debug!(id = self.id, commit_index = new_commit, "advanced commit index");
            self.commit_index = new_commit;
            self.apply_committed_entries()
        } else {
            Vec::new()
        }
    }

    /// Highest index in the retained log holding an entry of `term`.
    fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }
}
