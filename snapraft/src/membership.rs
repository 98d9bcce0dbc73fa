//! Membership table derived from committed configuration changes.
//!
//! Every node starts from the same bootstrap configuration (or the one carried
//! by its snapshot) and replays the same committed `ConfigChange` entries, so
//! all nodes agree on membership for a given log prefix. A change that has
//! been appended but not committed shows up as `Joining` or `Leaving` and does
//! not alter who counts toward quorum.
use crate::error::{Error, Result};
use crate::message::ReplicaID;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Added by an uncommitted entry. Receives replication, never votes.
    Joining,
    /// Part of the committed configuration.
    Active,
    /// Removed by an uncommitted entry. Still part of the committed
    /// configuration until that entry commits.
    Leaving,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: ReplicaID,
    pub address: String,
    pub role: Role,
    pub status: MemberStatus,
}

impl ClusterMember {
    pub fn new(id: ReplicaID, address: impl Into<String>) -> ClusterMember {
        ClusterMember {
            id,
            address: address.into(),
            role: Role::Follower,
            status: MemberStatus::Active,
        }
    }
}

/// Payload of an `EntryKind::ConfigChange` log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    AddMember { id: ReplicaID, address: String },
    RemoveMember { id: ReplicaID },
}

impl ConfigChange {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<ConfigChange> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn member_id(&self) -> ReplicaID {
        match self {
            ConfigChange::AddMember { id, .. } | ConfigChange::RemoveMember { id } => *id,
        }
    }
}

/// A configuration change sitting in the uncommitted part of the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingChange {
    pub index: u64,
    pub change: ConfigChange,
}

#[derive(Clone, Debug)]
pub struct Membership {
    members: BTreeMap<ReplicaID, ClusterMember>,
    pending: Option<PendingChange>,
}

impl Membership {
    pub fn new(members: Vec<ClusterMember>) -> Membership {
        let mut membership = Membership {
            members: BTreeMap::new(),
            pending: None,
        };
        membership.restore(members);
        membership
    }

    /// Replace the committed configuration, e.g. from a snapshot. Any pending
    /// change is dropped; the caller re-derives it from the log.
    pub fn restore(&mut self, members: Vec<ClusterMember>) {
        self.pending = None;
        self.members = members
            .into_iter()
            .map(|mut member| {
                member.status = MemberStatus::Active;
                (member.id, member)
            })
            .collect();
    }

    pub fn get(&self, id: ReplicaID) -> Option<&ClusterMember> {
        self.members.get(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = &ClusterMember> {
        self.members.values()
    }

    pub fn pending(&self) -> Option<&PendingChange> {
        self.pending.as_ref()
    }

    // Members of the committed configuration. Leaving members still count.
    pub fn voters(&self) -> Vec<ReplicaID> {
        self.members
            .values()
            .filter(|m| m.status != MemberStatus::Joining)
            .map(|m| m.id)
            .collect()
    }

    pub fn is_voter(&self, id: ReplicaID) -> bool {
        self.members
            .get(&id)
            .map_or(false, |m| m.status != MemberStatus::Joining)
    }

    pub fn quorum_size(&self) -> usize {
        self.voters().len() / 2 + 1
    }

    pub fn has_quorum(&self, ids: &BTreeSet<ReplicaID>) -> bool {
        let votes = ids.iter().filter(|id| self.is_voter(**id)).count();
        votes >= self.quorum_size()
    }

    /// Everyone the leader replicates to: voters plus a joining node.
    pub fn replication_targets(&self, self_id: ReplicaID) -> Vec<ReplicaID> {
        self.members
            .keys()
            .copied()
            .filter(|id| *id != self_id)
            .collect()
    }

    /// The committed configuration only, as stored in a snapshot.
    pub fn committed_members(&self) -> Vec<ClusterMember> {
        self.members
            .values()
            .filter(|m| m.status != MemberStatus::Joining)
            .map(|m| ClusterMember {
                status: MemberStatus::Active,
                ..m.clone()
            })
            .collect()
    }

    /// Check that a change makes sense against the current table before it
    /// is proposed.
    pub fn validate(&self, change: &ConfigChange) -> Result<()> {
        if let Some(pending) = &self.pending {
            return Err(Error::ConfigChangeInProgress {
                index: pending.index,
            });
        }

        match change {
            ConfigChange::AddMember { id, .. } if self.members.contains_key(id) => {
                Err(Error::AlreadyMember(*id))
            }
            ConfigChange::RemoveMember { id } if !self.members.contains_key(id) => {
                Err(Error::UnknownMember(*id))
            }
            _ => Ok(()),
        }
    }

    /// Track the uncommitted change found in the log tail, if any. The effect
    /// of the previous pending change is undone first, so this is safe to call
    /// after every log mutation, including truncation.
    pub fn set_pending(&mut self, pending: Option<PendingChange>) {
        if self.pending == pending {
            return;
        }

        if let Some(old) = self.pending.take() {
            match old.change {
                ConfigChange::AddMember { id, .. } => {
                    if self.members.get(&id).map(|m| m.status) == Some(MemberStatus::Joining) {
                        self.members.remove(&id);
                    }
                }
                ConfigChange::RemoveMember { id } => {
                    if let Some(member) = self.members.get_mut(&id) {
                        member.status = MemberStatus::Active;
                    }
                }
            }
        }

        if let Some(new) = &pending {
            match &new.change {
                ConfigChange::AddMember { id, address } => {
                    self.members.entry(*id).or_insert_with(|| ClusterMember {
                        id: *id,
                        address: address.clone(),
                        role: Role::Follower,
                        status: MemberStatus::Joining,
                    });
                }
                ConfigChange::RemoveMember { id } => {
                    if let Some(member) = self.members.get_mut(id) {
                        member.status = MemberStatus::Leaving;
                    }
                }
            }
        }

        self.pending = pending;
    }

    /// Make a committed change effective.
    pub fn commit(&mut self, index: u64, change: ConfigChange) {
        if self.pending.as_ref().map(|p| p.index) == Some(index) {
            self.pending = None;
        }

        match change {
            ConfigChange::AddMember { id, address } => {
                let member = self
                    .members
                    .entry(id)
                    .or_insert_with(|| ClusterMember::new(id, address));
                member.status = MemberStatus::Active;
            }
            ConfigChange::RemoveMember { id } => {
                self.members.remove(&id);
            }
        }
    }

    /// Record which node leads and what role the local node is in. Purely a
    /// read model for callers; it never affects quorum.
    pub fn observe_roles(&mut self, self_id: ReplicaID, self_role: Role, leader: Option<ReplicaID>) {
        for member in self.members.values_mut() {
            member.role = if Some(member.id) == leader {
                Role::Leader
            } else if member.id == self_id {
                self_role
            } else {
                Role::Follower
            };
        }
    }
}
