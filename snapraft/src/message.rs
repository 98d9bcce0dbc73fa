use crate::snapshot::Snapshot;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type ReplicaID = u64;

// EntryKind tells the replica what to do with an entry once it commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    // Opaque user command handed to the state machine.
    Command,
    // Encoded ConfigChange that mutates the membership table.
    ConfigChange,
    // Appended by a fresh leader to commit entries from earlier terms. Never
    // reaches the state machine.
    Noop,
}

// Entry is a single slot of the replicated log. Indices start at 1 and are
// contiguous; terms never decrease along the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub payload: Bytes,
}

impl Entry {
    pub fn command(index: u64, term: u64, payload: impl Into<Bytes>) -> Entry {
        Entry {
            index,
            term,
            kind: EntryKind::Command,
            payload: payload.into(),
        }
    }

    pub fn noop(index: u64, term: u64) -> Entry {
        Entry {
            index,
            term,
            kind: EntryKind::Noop,
            payload: Bytes::new(),
        }
    }
}

// Message describes messages that the replicas pass between each other to
// achieve consensus on the replicated log. Every reply carries the responder's
// term so that stale leaders and candidates learn they are behind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // RequestVote is used by Candidates to solicit votes for themselves.
    RequestVote {
        candidate_id: ReplicaID,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        from_id: ReplicaID,
        term: u64,
        vote_granted: bool,
    },
    // AppendEntries is used by Leaders to replicate entries. With no entries it
    // doubles as the heartbeat.
    AppendEntries {
        leader_id: ReplicaID,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
    },
    // On success match_hint is the highest index known to match the leader.
    // On failure it is the index the leader should retry from.
    AppendEntriesResponse {
        from_id: ReplicaID,
        term: u64,
        success: bool,
        match_hint: u64,
    },
    // InstallSnapshot ships a compacted state together with the contiguous log
    // tail that follows it, so a lagging follower catches up in one round trip.
    InstallSnapshot {
        leader_id: ReplicaID,
        term: u64,
        snapshot: Snapshot,
        trailing_entries: Vec<Entry>,
    },
    InstallSnapshotResponse {
        from_id: ReplicaID,
        term: u64,
        success: bool,
        match_index: u64,
    },
}

impl Message {
    pub fn term(&self) -> u64 {
        match self {
            Message::RequestVote { term, .. }
            | Message::RequestVoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesResponse { term, .. }
            | Message::InstallSnapshot { term, .. }
            | Message::InstallSnapshotResponse { term, .. } => *term,
        }
    }

    pub fn from_id(&self) -> ReplicaID {
        match self {
            Message::RequestVote { candidate_id, .. } => *candidate_id,
            Message::AppendEntries { leader_id, .. }
            | Message::InstallSnapshot { leader_id, .. } => *leader_id,
            Message::RequestVoteResponse { from_id, .. }
            | Message::AppendEntriesResponse { from_id, .. }
            | Message::InstallSnapshotResponse { from_id, .. } => *from_id,
        }
    }

    // Only a leader sends these, so receiving one tells us who leads the term.
    pub(crate) fn leader_id(&self) -> Option<ReplicaID> {
        match self {
            Message::AppendEntries { leader_id, .. }
            | Message::InstallSnapshot { leader_id, .. } => Some(*leader_id),
            _ => None,
        }
    }
}
