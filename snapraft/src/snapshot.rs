use crate::error::{Error, Result};
use crate::log::LogStore;
use crate::membership::ClusterMember;
use crate::message::{Message, ReplicaID};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Compacted state of the state machine as of `last_included_index`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Hex encoded SHA-256 of `state_payload`.
    pub checksum: String,
    /// RFC 3339 creation time.
    pub timestamp: String,
    pub state_payload: Bytes,
    /// Committed configuration at `last_included_index`.
    pub membership: Vec<ClusterMember>,
}

pub fn checksum(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

impl Snapshot {
    pub fn verify(&self) -> Result<()> {
        let actual = checksum(&self.state_payload);
        if actual != self.checksum {
            return Err(Error::CorruptSnapshot {
                index: self.last_included_index,
                expected: self.checksum.clone(),
                actual,
            });
        }

        Ok(())
    }
}

// SnapshotManager holds the latest snapshot a replica has taken or installed
// and knows how to package it for a lagging follower.
pub struct SnapshotManager {
    // Upper bound on entries shipped alongside a snapshot.
    max_trailing_entries: usize,
    current: Option<Snapshot>,
}

impl SnapshotManager {
    pub fn new(max_trailing_entries: usize, current: Option<Snapshot>) -> SnapshotManager {
        SnapshotManager {
            max_trailing_entries,
            current,
        }
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }

    pub fn last_included_index(&self) -> u64 {
        self.current.as_ref().map_or(0, |s| s.last_included_index)
    }

    pub(crate) fn set_current(&mut self, snapshot: Snapshot) {
        self.current = Some(snapshot);
    }

    /// Stamp a state machine payload taken as of `upto_index`.
    pub fn create_snapshot(
        &self,
        upto_index: u64,
        upto_term: u64,
        state_payload: Bytes,
        membership: Vec<ClusterMember>,
    ) -> Snapshot {
        Snapshot {
            last_included_index: upto_index,
            last_included_term: upto_term,
            checksum: checksum(&state_payload),
            timestamp: chrono::Utc::now().to_rfc3339(),
            state_payload,
            membership,
        }
    }

    /// Package `snapshot` with the log tail that follows it. When the tail
    /// would exceed the configured bound the snapshot goes alone and ordinary
    /// replication catches the follower up afterwards.
    pub fn build_install_message(
        &self,
        snapshot: &Snapshot,
        term: u64,
        leader_id: ReplicaID,
        log: &LogStore,
    ) -> Message {
        let tail = log.entries_from(snapshot.last_included_index + 1);
        let trailing_entries = if tail.len() <= self.max_trailing_entries {
            tail.to_vec()
        } else {
            Vec::new()
        };

        Message::InstallSnapshot {
            leader_id,
            term,
            snapshot: snapshot.clone(),
            trailing_entries,
        }
    }
}
