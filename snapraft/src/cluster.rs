use crate::{
    error::Result,
    message::{Message, ReplicaID},
};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

// ClientRequest is what the client-facing collaborator asks the cluster to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientRequest {
    Propose(Bytes),
    AddMember { id: ReplicaID, address: String },
    RemoveMember { id: ReplicaID },
}

// Cluster provides the means of communication of a replica with the rest of
// the cluster and the user.
pub trait Cluster {
    // Deliver a message to the target replica. The algorithm assumes that send
    // can silently fail, reorder, or duplicate.
    fn send(&mut self, to_id: ReplicaID, message: Message);

    // Wait up to `timeout` for the next inbound message.
    fn receive_timeout(&mut self, timeout: Duration) -> Option<Message>;

    // Client requests waiting to be handled. Polled by every replica; only a
    // leader can accept them, the rest reject them with NotLeader.
    fn pending_requests(&mut self) -> Vec<ClientRequest>;

    // Called with the outcome of every request returned by pending_requests:
    // the log index it was appended at, or why it was rejected.
    fn register_outcome(&mut self, _request: &ClientRequest, _outcome: &Result<u64>) {}

    // Called whenever the replica learns of a new leader, or loses track of it.
    fn register_leader(&mut self, leader_id: Option<ReplicaID>);

    fn halt(&self) -> bool;
}

// ChannelCluster connects replicas running on threads of one process through
// crossbeam channels.
pub struct ChannelCluster {
    id: ReplicaID,
    receiver: Receiver<Message>,
    transmitters: BTreeMap<ReplicaID, Sender<Message>>,
    requests: Receiver<ClientRequest>,
    leader: Option<ReplicaID>,
    halt: Arc<AtomicBool>,
}

impl ChannelCluster {
    pub fn new(
        id: ReplicaID,
        receiver: Receiver<Message>,
        transmitters: BTreeMap<ReplicaID, Sender<Message>>,
        requests: Receiver<ClientRequest>,
        halt: Arc<AtomicBool>,
    ) -> ChannelCluster {
        ChannelCluster {
            id,
            receiver,
            transmitters,
            requests,
            leader: None,
            halt,
        }
    }

    pub fn leader(&self) -> Option<ReplicaID> {
        self.leader
    }
}

impl Cluster for ChannelCluster {
    fn send(&mut self, to_id: ReplicaID, message: Message) {
        if let Some(transmitter) = self.transmitters.get(&to_id) {
            if transmitter.send(message).is_err() {
                debug!(from = self.id, to = to_id, "peer channel closed");
            }
        }
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Option<Message> {
        self.receiver.recv_timeout(timeout).ok()
    }

    fn pending_requests(&mut self) -> Vec<ClientRequest> {
        // Leave requests queued for whoever leads.
        if self.leader != Some(self.id) {
            return Vec::new();
        }
        self.requests.try_iter().collect()
    }

    fn register_leader(&mut self, leader_id: Option<ReplicaID>) {
        self.leader = leader_id;
    }

    fn halt(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }
}
