#![allow(dead_code)]

use bytes::Bytes;
use snapraft::{
    cluster::{ClientRequest, Cluster},
    config::RaftConfig,
    membership::ClusterMember,
    message::{Entry, Message, ReplicaID},
    replica::Replica,
    snapshot::Snapshot,
    state_machine::StateMachine,
    storage::{MemoryStorage, Storage},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

// Records every applied command with its index. The snapshot is the whole
// record, so two nodes agree on state exactly when their records match.
#[derive(Debug, Default)]
pub struct Recorder {
    pub applied: Vec<(u64, Vec<u8>)>,
}

impl StateMachine for Recorder {
    fn apply(&mut self, index: u64, command: &[u8]) {
        self.applied.push((index, command.to_vec()));
    }

    fn snapshot(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(&self.applied).expect("could not encode recorder"))
    }

    fn restore(&mut self, payload: &[u8]) {
        self.applied = serde_json::from_slice(payload).expect("could not decode recorder");
    }
}

impl Recorder {
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.applied.iter().map(|(_, c)| c.clone()).collect()
    }
}

// Cluster that only queues outbound messages. The simulation below moves
// them between replicas.
#[derive(Debug, Default)]
pub struct SimCluster {
    pub outbox: Vec<(ReplicaID, Message)>,
    pub leader: Option<ReplicaID>,
}

impl Cluster for SimCluster {
    fn send(&mut self, to_id: ReplicaID, message: Message) {
        self.outbox.push((to_id, message));
    }

    fn receive_timeout(&mut self, _timeout: Duration) -> Option<Message> {
        None
    }

    fn pending_requests(&mut self) -> Vec<ClientRequest> {
        Vec::new()
    }

    fn register_leader(&mut self, leader_id: Option<ReplicaID>) {
        self.leader = leader_id;
    }

    fn halt(&self) -> bool {
        true
    }
}

pub type SimReplica = Replica<Recorder, SimCluster>;

// Storage that starts failing every write once `fail` is set.
#[derive(Clone, Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    pub fail: Arc<AtomicBool>,
}

impl FailingStorage {
    fn check(&self) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::Other, "disk unavailable"))
        } else {
            Ok(())
        }
    }
}

impl Storage for FailingStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<ReplicaID>) -> io::Result<()> {
        self.check()?;
        self.inner.save_term_and_vote(term, voted_for)
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<ReplicaID>)> {
        self.inner.load_term_and_vote()
    }

    fn append_entries(&mut self, entries: &[Entry]) -> io::Result<()> {
        self.check()?;
        self.inner.append_entries(entries)
    }

    fn load_log(&self) -> io::Result<Vec<Entry>> {
        self.inner.load_log()
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.check()?;
        self.inner.truncate_log_from(from_index)
    }

    fn compact_log_below(&mut self, index: u64) -> io::Result<()> {
        self.check()?;
        self.inner.compact_log_below(index)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        self.check()?;
        self.inner.save_snapshot(snapshot)
    }

    fn load_snapshot(&self) -> io::Result<Option<Snapshot>> {
        self.inner.load_snapshot()
    }
}

pub fn members(ids: impl IntoIterator<Item = ReplicaID>) -> Vec<ClusterMember> {
    ids.into_iter()
        .map(|id| ClusterMember::new(id, format!("127.0.0.1:{}", 7000 + id)))
        .collect()
}

pub fn replica(
    id: ReplicaID,
    ids: impl IntoIterator<Item = ReplicaID>,
    storage: Box<dyn Storage>,
) -> SimReplica {
    Replica::new(
        id,
        members(ids),
        RaftConfig::default(),
        storage,
        Recorder::default(),
        SimCluster::default(),
    )
    .expect("could not create replica")
}

pub fn take_outbox(replica: &mut SimReplica) -> Vec<(ReplicaID, Message)> {
    std::mem::take(&mut replica.cluster_mut().outbox)
}

// In-process network of replicas. Messages sit in `in_flight` until delivered
// and are dropped when the link between sender and receiver is cut.
pub struct Sim {
    pub config: RaftConfig,
    pub nodes: BTreeMap<ReplicaID, SimReplica>,
    pub in_flight: Vec<(ReplicaID, ReplicaID, Message)>,
    cut: BTreeSet<(ReplicaID, ReplicaID)>,
}

impl Sim {
    pub fn new(n: u64) -> Sim {
        Sim::with_config(n, RaftConfig::default())
    }

    pub fn with_config(n: u64, config: RaftConfig) -> Sim {
        let mut sim = Sim {
            config,
            nodes: BTreeMap::new(),
            in_flight: Vec::new(),
            cut: BTreeSet::new(),
        };
        for id in 1..=n {
            sim.add_node(id, members(1..=n), Box::new(MemoryStorage::new()));
        }
        sim
    }

    pub fn add_node(&mut self, id: ReplicaID, bootstrap: Vec<ClusterMember>, storage: Box<dyn Storage>) {
        let replica = Replica::new(
            id,
            bootstrap,
            self.config.clone(),
            storage,
            Recorder::default(),
            SimCluster::default(),
        )
        .expect("could not create replica");
        self.nodes.insert(id, replica);
    }

    pub fn node(&self, id: ReplicaID) -> &SimReplica {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: ReplicaID) -> &mut SimReplica {
        self.nodes.get_mut(&id).expect("unknown node")
    }

    pub fn connected(&self, from: ReplicaID, to: ReplicaID) -> bool {
        !self.cut.contains(&(from, to))
    }

    pub fn cut(&mut self, a: ReplicaID, b: ReplicaID) {
        self.cut.insert((a, b));
        self.cut.insert((b, a));
    }

    pub fn isolate(&mut self, id: ReplicaID) {
        let others: Vec<ReplicaID> = self.nodes.keys().copied().filter(|o| *o != id).collect();
        for other in others {
            self.cut(id, other);
        }
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    // Move everything the replicas sent into flight.
    pub fn collect(&mut self) {
        let mut sent = Vec::new();
        for (from, node) in self.nodes.iter_mut() {
            for (to, message) in std::mem::take(&mut node.cluster_mut().outbox) {
                sent.push((*from, to, message));
            }
        }
        for (from, to, message) in sent {
            if self.connected(from, to) {
                self.in_flight.push((from, to, message));
            }
        }
    }

    pub fn deliver(&mut self, from: ReplicaID, to: ReplicaID, message: Message) {
        if !self.connected(from, to) {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&to) {
            node.step(message).expect("step failed");
        }
        self.collect();
    }

    // Deliver until the network is quiet.
    pub fn deliver_all(&mut self) {
        self.collect();
        for _ in 0..10_000 {
            if self.in_flight.is_empty() {
                return;
            }
            for (from, to, message) in std::mem::take(&mut self.in_flight) {
                self.deliver(from, to, message);
            }
        }
        panic!("network did not quiesce");
    }

    pub fn tick(&mut self, id: ReplicaID, millis: u64) {
        self.node_mut(id).tick(millis).expect("tick failed");
        self.collect();
    }

    pub fn heartbeat(&mut self, leader: ReplicaID) {
        let interval = self.config.heartbeat_interval;
        self.tick(leader, interval);
        self.deliver_all();
    }

    pub fn elect(&mut self, id: ReplicaID) {
        self.node_mut(id).campaign().expect("campaign failed");
        self.deliver_all();
        assert!(self.node(id).is_leader(), "node {} did not win the election", id);
    }

    pub fn propose(&mut self, id: ReplicaID, command: &[u8]) -> u64 {
        let index = self
            .node_mut(id)
            .propose(Bytes::copy_from_slice(command))
            .expect("proposal rejected");
        self.deliver_all();
        index
    }

    // The leader of the highest term, if any.
    pub fn leader(&self) -> Option<ReplicaID> {
        self.nodes
            .values()
            .filter(|n| n.is_leader())
            .max_by_key(|n| n.current_term())
            .map(|n| n.id())
    }
}
