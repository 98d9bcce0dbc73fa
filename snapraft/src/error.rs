use crate::message::ReplicaID;
use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the replica, its log and its storage.
///
/// Stale protocol traffic (lower terms, superseded replies) is never reported
/// as an error; it is dropped where it is received.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Durable storage failed. Nothing that depends on the write has been
    /// made observable.
    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),

    /// A payload could not be encoded or decoded.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot payload does not match its checksum.
    #[error("corrupt snapshot at index {index}: expected checksum {expected}, computed {actual}")]
    CorruptSnapshot {
        index: u64,
        expected: String,
        actual: String,
    },

    /// Client requests must go to the leader.
    #[error("not the leader, leader hint is {leader_hint:?}")]
    NotLeader { leader_hint: Option<ReplicaID> },

    /// Only one membership change may be in flight at a time.
    #[error("membership change at index {index} has not committed yet")]
    ConfigChangeInProgress { index: u64 },

    #[error("node {0} is already a member")]
    AlreadyMember(ReplicaID),

    #[error("node {0} is not a member")]
    UnknownMember(ReplicaID),

    /// Appended entries must continue the log without gaps.
    #[error("entry {index} does not continue the log, expected index {expected}")]
    NonContiguous { index: u64, expected: u64 },

    /// Only committed entries may be compacted into a snapshot.
    #[error("cannot compact below {index}, commit index is {commit_index}")]
    CompactionBeyondCommit { index: u64, commit_index: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
