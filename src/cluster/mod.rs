//! Cluster membership model
//!
//! A `ClusterConfig` maps member ids to their address and lifecycle status.
//! It is the unit of replication for membership changes: a change is logged
//! as a configuration entry carrying the full (possibly joint) config, and a
//! replica adopts whatever configuration sits latest in its log.
//!
//! While a change is in flight the config is *joint*: it carries both the
//! old and the new voter sets, and a quorum requires a majority of each set.
//! This is what closes the dual-majority window during reconfiguration.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier of a cluster member.
pub type MemberId = u64;

/// Lifecycle status of a member within the current configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Full member of the steady-state configuration.
    Active,
    /// Being added; becomes Active when the final config entry commits.
    Joining,
    /// Being removed; dropped when the final config entry commits.
    Leaving,
}

/// A single cluster member: id, transport address, lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: MemberId,
    /// Transport address, e.g. "127.0.0.1:8001". The transport layer treats
    /// this as an opaque routing key.
    pub address: String,
    pub status: MemberStatus,
}

impl MemberConfig {
    /// Create an Active member.
    pub fn new(id: MemberId, address: impl Into<String>) -> Self {
        MemberConfig {
            id,
            address: address.into(),
            status: MemberStatus::Active,
        }
    }
}

/// The two voter sets of a joint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointVoters {
    pub old: BTreeSet<MemberId>,
    pub new: BTreeSet<MemberId>,
}

/// A requested membership change, applied through the two-phase joint
/// consensus sequence by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    Add(MemberConfig),
    Remove(MemberId),
}

/// Errors raised when validating a membership change request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("member {0} is already in the cluster")]
    AlreadyMember(MemberId),
    #[error("member {0} is not in the cluster")]
    UnknownMember(MemberId),
    #[error("cannot remove the last remaining member")]
    LastMember,
    #[error("a configuration change is already in progress")]
    ChangeInProgress,
}

/// The cluster configuration: member map plus optional joint voter sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    members: BTreeMap<MemberId, MemberConfig>,
    joint: Option<JointVoters>,
}

impl ClusterConfig {
    /// Build a steady-state configuration from a list of members.
    pub fn new(members: impl IntoIterator<Item = MemberConfig>) -> Self {
        ClusterConfig {
            members: members.into_iter().map(|m| (m.id, m)).collect(),
            joint: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn get(&self, id: MemberId) -> Option<&MemberConfig> {
        self.members.get(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberConfig> {
        self.members.values()
    }

    pub fn member_ids(&self) -> BTreeSet<MemberId> {
        self.members.keys().copied().collect()
    }

    /// Ids of every member except `self_id`.
    pub fn peer_ids(&self, self_id: MemberId) -> Vec<MemberId> {
        self.members.keys().copied().filter(|&id| id != self_id).collect()
    }

    pub fn address_of(&self, id: MemberId) -> Option<&str> {
        self.members.get(&id).map(|m| m.address.as_str())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_joint(&self) -> bool {
        self.joint.is_some()
    }

    pub fn joint_voters(&self) -> Option<&JointVoters> {
        self.joint.as_ref()
    }

    /// Whether the given set of members forms a quorum under this
    /// configuration. In a joint configuration this requires a strict
    /// majority of *both* the old and the new voter set; otherwise a strict
    /// majority of the single member set.
    pub fn has_quorum(&self, granted: &BTreeSet<MemberId>) -> bool {
        match &self.joint {
            Some(j) => majority_of(&j.old, granted) && majority_of(&j.new, granted),
            None => {
                let voters = self.member_ids();
                majority_of(&voters, granted)
            }
        }
    }

    /// Build the joint configuration for a requested change. The member map
    /// becomes the union of old and new members (an added member enters as
    /// Joining, a removed one is marked Leaving) and the joint voter sets
    /// record both generations.
    pub fn joint_for(&self, change: &MembershipChange) -> Result<ClusterConfig, MembershipError> {
        if self.joint.is_some() {
            return Err(MembershipError::ChangeInProgress);
        }

        let old: BTreeSet<MemberId> = self.member_ids();
        let mut members = self.members.clone();
        let new: BTreeSet<MemberId> = match change {
            MembershipChange::Add(member) => {
                if members.contains_key(&member.id) {
                    return Err(MembershipError::AlreadyMember(member.id));
                }
                let mut joining = member.clone();
                joining.status = MemberStatus::Joining;
                members.insert(joining.id, joining);
                let mut new = old.clone();
                new.insert(member.id);
                new
            }
            MembershipChange::Remove(id) => {
                let Some(leaving) = members.get_mut(id) else {
                    return Err(MembershipError::UnknownMember(*id));
                };
                if old.len() == 1 {
                    return Err(MembershipError::LastMember);
                }
                leaving.status = MemberStatus::Leaving;
                let mut new = old.clone();
                new.remove(id);
                new
            }
        };

        Ok(ClusterConfig {
            members,
            joint: Some(JointVoters { old, new }),
        })
    }

    /// Leave the joint phase: keep only the new voter set, normalize every
    /// status to Active. Identity on a non-joint configuration.
    pub fn finalized(&self) -> ClusterConfig {
        match &self.joint {
            Some(j) => {
                let members = self
                    .members
                    .iter()
                    .filter(|(id, _)| j.new.contains(id))
                    .map(|(id, m)| {
                        let mut m = m.clone();
                        m.status = MemberStatus::Active;
                        (*id, m)
                    })
                    .collect();
                ClusterConfig { members, joint: None }
            }
            None => self.clone(),
        }
    }
}

fn majority_of(voters: &BTreeSet<MemberId>, granted: &BTreeSet<MemberId>) -> bool {
    if voters.is_empty() {
        return false;
    }
    granted.intersection(voters).count() > voters.len() / 2
}
