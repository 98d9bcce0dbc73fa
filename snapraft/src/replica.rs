use crate::{
    cluster::{ClientRequest, Cluster},
    config::RaftConfig,
    error::{Error, Result},
    log::LogStore,
    membership::{ClusterMember, ConfigChange, Membership, PendingChange, Role},
    message::{Entry, EntryKind, Message, ReplicaID},
    replication::{Progress, ReplicationManager},
    snapshot::{Snapshot, SnapshotManager},
    state_machine::StateMachine,
    storage::Storage,
    timer::Timer,
};
use bytes::Bytes;
use std::{collections::BTreeSet, time::Instant};
use tracing::{debug, error, info, warn};

pub struct Replica<S, C>
where
    S: StateMachine,
    C: Cluster,
{
    // ID of this replica.
    id: ReplicaID,
    config: RaftConfig,
    // User-defined state machine that the cluster replicates.
    state_machine: S,
    // Interface a replica uses to communicate with the rest of the cluster and
    // the user.
    cluster: C,
    // Durable log, term and vote.
    log: LogStore,
    snapshots: SnapshotManager,
    membership: Membership,
    // Per-follower progress. Only populated on leaders.
    replication: ReplicationManager,
    current_term: u64,
    // Who the vote of the current term was cast for.
    voted_for: Option<ReplicaID>,
    role: Role,
    leader_id: Option<ReplicaID>,
    // ID of voters that granted us their vote this term.
    votes: BTreeSet<ReplicaID>,
    // Index of the highest entry applied to the state machine.
    last_applied: u64,
    election_timer: Timer,
    heartbeat_timer: Timer,
}

// Replica runs the consensus protocol for one node. It is a single-threaded
// actor: every inbound message, timer tick, and client request is processed to
// completion before the next one, and nothing outside the replica touches its
// log or membership table.
impl<S, C> Replica<S, C>
where
    S: StateMachine,
    C: Cluster,
{
    // Create a replica and restore whatever `storage` holds from a previous
    // run. `members` is the bootstrap configuration; a stored snapshot
    // overrides it.
    pub fn new(
        id: ReplicaID,
        members: Vec<ClusterMember>,
        config: RaftConfig,
        storage: Box<dyn Storage>,
        mut state_machine: S,
        cluster: C,
    ) -> Result<Replica<S, C>> {
        config.validate()?;

        let (current_term, voted_for) = storage.load_term_and_vote()?;
        let snapshot = storage.load_snapshot()?;
        let mut membership = Membership::new(members);
        if let Some(snapshot) = &snapshot {
            snapshot.verify()?;
            state_machine.restore(&snapshot.state_payload);
            membership.restore(snapshot.membership.clone());
        }

        let log = LogStore::open(
            storage,
            snapshot
                .as_ref()
                .map(|s| (s.last_included_index, s.last_included_term)),
        )?;
        let last_applied = log.commit_index();

        let mut replica = Replica {
            id,
            election_timer: Timer::randomized(config.election_timeout_min, config.election_timeout_max),
            heartbeat_timer: Timer::fixed(config.heartbeat_interval),
            snapshots: SnapshotManager::new(config.max_snapshot_tail, snapshot),
            config,
            state_machine,
            cluster,
            log,
            membership,
            replication: ReplicationManager::new(),
            current_term,
            voted_for,
            role: Role::Follower,
            leader_id: None,
            votes: BTreeSet::new(),
            last_applied,
        };
        replica.refresh_pending()?;

        info!(
            replica = id,
            term = current_term,
            last_index = replica.log.last_index(),
            snapshot_index = last_applied,
            "replica started"
        );
        Ok(replica)
    }

    pub fn id(&self) -> ReplicaID {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    // The leader as far as this replica knows, for redirecting clients.
    pub fn leader_hint(&self) -> Option<ReplicaID> {
        self.leader_id
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<ReplicaID> {
        self.voted_for
    }

    pub fn commit_index(&self) -> u64 {
        self.log.commit_index()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.current()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    // Read model of the cluster for dashboards and the like.
    pub fn members(&self) -> Vec<ClusterMember> {
        self.membership.members().cloned().collect()
    }

    pub fn progress(&self, peer_id: ReplicaID) -> Option<Progress> {
        self.replication.progress(peer_id)
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut C {
        &mut self.cluster
    }

    // This function drives the replica until the cluster asks it to halt. It
    // waits for messages at most one tick at a time, advances the logical
    // clock by the wall time that passed, and serves client requests.
    pub fn start(&mut self) {
        let tick = self.config.tick_duration();
        let mut last_tick = Instant::now();

        while !self.cluster.halt() {
            if let Some(message) = self.cluster.receive_timeout(tick) {
                if let Err(err) = self.step(message) {
                    error!(replica = self.id, error = %err, "failed to process message");
                }
            }

            let elapsed = last_tick.elapsed();
            if elapsed >= tick {
                last_tick = Instant::now();
                if let Err(err) = self.tick(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)) {
                    error!(replica = self.id, error = %err, "failed to advance clock");
                }
            }

            for request in self.cluster.pending_requests() {
                let outcome = self.handle_request(&request);
                if let Err(err) = &outcome {
                    debug!(replica = self.id, error = %err, "client request rejected");
                }
                self.cluster.register_outcome(&request, &outcome);
            }
        }

        info!(replica = self.id, "replica halted");
    }

    // Advance the logical clock. Followers and candidates start an election
    // when their randomized timeout runs out; leaders send heartbeats.
    pub fn tick(&mut self, millis: u64) -> Result<()> {
        match self.role {
            Role::Leader => {
                if self.heartbeat_timer.advance(millis) {
                    self.heartbeat_timer.renew();
                    self.broadcast_append();
                }
            }
            Role::Follower | Role::Candidate => {
                if self.election_timer.advance(millis) {
                    self.campaign()?;
                }
            }
        }

        Ok(())
    }

    // Process one inbound message. Errors are storage or encoding failures;
    // when one is returned no reply has been sent.
    pub fn step(&mut self, message: Message) -> Result<()> {
        if !self.accepts_from(&message) {
            debug!(
                replica = self.id,
                from = message.from_id(),
                term = message.term(),
                "ignoring message from outside the configuration"
            );
            return Ok(());
        }

        if message.term() > self.current_term {
            debug!(
                replica = self.id,
                term = self.current_term,
                new_term = message.term(),
                from = message.from_id(),
                "observed higher term"
            );
            self.become_follower(message.term(), message.leader_id())?;
        }

        match message {
            Message::RequestVote {
                candidate_id,
                term,
                last_log_index,
                last_log_term,
            } => self.handle_request_vote(candidate_id, term, last_log_index, last_log_term),
            Message::RequestVoteResponse {
                from_id,
                term,
                vote_granted,
            } => self.handle_vote_response(from_id, term, vote_granted),
            Message::AppendEntries {
                leader_id,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                leader_id,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            Message::AppendEntriesResponse {
                from_id,
                term,
                success,
                match_hint,
            } => self.handle_append_response(from_id, term, success, match_hint),
            Message::InstallSnapshot {
                leader_id,
                term,
                snapshot,
                trailing_entries,
            } => self.handle_install_snapshot(leader_id, term, snapshot, trailing_entries),
            Message::InstallSnapshotResponse {
                from_id,
                term,
                success,
                match_index,
            } => self.handle_install_response(from_id, term, success, match_index),
        }
    }

    // A node that is no longer in our table must not move our term. Vote
    // requests from it are dropped, and so are replies unless it is still
    // being told about its removal. Leader traffic is always let through, a
    // joining node may not know its leader yet.
    fn accepts_from(&mut self, message: &Message) -> bool {
        let from_id = message.from_id();
        if self.membership.get(from_id).is_some() {
            return true;
        }

        match message {
            Message::AppendEntries { .. } | Message::InstallSnapshot { .. } => true,
            Message::RequestVote { .. } => false,
            _ if !self.replication.is_retiring(from_id) => false,
            _ if message.term() > self.current_term => {
                // It has moved to a later term on its own and will not accept
                // anything from us anymore.
                debug!(replica = self.id, peer = from_id, "removed node went ahead, no longer replicating to it");
                self.replication.forget(from_id);
                false
            }
            _ => true,
        }
    }

    // -- client surface --

    pub fn handle_request(&mut self, request: &ClientRequest) -> Result<u64> {
        match request {
            ClientRequest::Propose(command) => self.propose(command.clone()),
            ClientRequest::AddMember { id, address } => self.add_member(*id, address.clone()),
            ClientRequest::RemoveMember { id } => self.remove_member(*id),
        }
    }

    // Append a command to the log. Returns the index it will commit at if this
    // replica stays leader long enough.
    pub fn propose(&mut self, command: impl Into<Bytes>) -> Result<u64> {
        self.ensure_leader()?;
        self.append_as_leader(EntryKind::Command, command.into())
    }

    pub fn add_member(&mut self, id: ReplicaID, address: impl Into<String>) -> Result<u64> {
        self.propose_config_change(ConfigChange::AddMember {
            id,
            address: address.into(),
        })
    }

    pub fn remove_member(&mut self, id: ReplicaID) -> Result<u64> {
        self.propose_config_change(ConfigChange::RemoveMember { id })
    }

    fn propose_config_change(&mut self, change: ConfigChange) -> Result<u64> {
        self.ensure_leader()?;
        self.membership.validate(&change)?;
        let index = self.append_as_leader(EntryKind::ConfigChange, change.encode()?)?;
        info!(replica = self.id, index, member = change.member_id(), "proposed membership change");
        Ok(index)
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.role == Role::Leader {
            Ok(())
        } else {
            Err(Error::NotLeader {
                leader_hint: self.leader_id,
            })
        }
    }

    // -- snapshots --

    // Snapshot the state machine at the last applied index and compact the
    // log below it. Returns None if nothing was applied since the previous
    // snapshot.
    pub fn create_snapshot(&mut self) -> Result<Option<Snapshot>> {
        let index = self.last_applied;
        if index <= self.log.offset() {
            return Ok(None);
        }
        let term = match self.log.term_at(index) {
            Some(term) => term,
            None => return Ok(None),
        };

        let snapshot = self.snapshots.create_snapshot(
            index,
            term,
            self.state_machine.snapshot(),
            self.membership.committed_members(),
        );
        self.log.save_snapshot(&snapshot)?;
        self.log.compact_below(index + 1)?;
        self.snapshots.set_current(snapshot.clone());

        info!(replica = self.id, index, term, checksum = %snapshot.checksum, "created snapshot");
        Ok(Some(snapshot))
    }

    // Install a snapshot received from the leader together with the log tail
    // that follows it. Returns the index up to which the log now matches the
    // leader. A corrupt snapshot, or a tail that does not continue it, is
    // rejected before anything is touched.
    pub fn apply_install(&mut self, snapshot: Snapshot, trailing_entries: Vec<Entry>) -> Result<u64> {
        snapshot.verify()?;

        let last_included_index = snapshot.last_included_index;
        for (expected, entry) in (last_included_index + 1..).zip(&trailing_entries) {
            if entry.index != expected {
                return Err(Error::NonContiguous {
                    index: entry.index,
                    expected,
                });
            }
        }
        let match_index = last_included_index + trailing_entries.len() as u64;

        if last_included_index <= self.log.commit_index() {
            // We already hold this prefix; only the tail can be new.
            debug!(
                replica = self.id,
                index = last_included_index,
                "snapshot covered by commit index, merging tail"
            );
            self.log.merge(trailing_entries)?;
        } else {
            self.log.save_snapshot(&snapshot)?;
            self.log
                .install_snapshot(last_included_index, snapshot.last_included_term)?;
            self.log.merge(trailing_entries)?;

            self.state_machine.restore(&snapshot.state_payload);
            self.last_applied = last_included_index;
            self.membership.restore(snapshot.membership.clone());
            info!(
                replica = self.id,
                index = last_included_index,
                term = snapshot.last_included_term,
                "installed snapshot"
            );
            self.snapshots.set_current(snapshot);
        }

        self.refresh_pending()?;
        Ok(match_index)
    }

    // -- role transitions --

    // Start an election for the next term. Nodes outside the committed
    // configuration never campaign.
    pub fn campaign(&mut self) -> Result<()> {
        if self.role == Role::Leader {
            return Ok(());
        }
        if !self.membership.is_voter(self.id) {
            debug!(replica = self.id, "not a voter, skipping election");
            self.election_timer.renew();
            return Ok(());
        }

        let term = self.current_term + 1;
        self.log.save_term_and_vote(term, Some(self.id))?;
        self.current_term = term;
        self.voted_for = Some(self.id);
        self.role = Role::Candidate;
        self.votes = BTreeSet::new();
        self.votes.insert(self.id);
        self.replication.clear();
        self.election_timer.renew();
        self.set_leader(None);
        info!(replica = self.id, term, "became candidate");

        if self.membership.has_quorum(&self.votes) {
            return self.become_leader();
        }

        let (last_log_index, last_log_term) = (self.log.last_index(), self.log.last_term());
        for peer_id in self.membership.voters() {
            if peer_id != self.id {
                self.cluster.send(
                    peer_id,
                    Message::RequestVote {
                        candidate_id: self.id,
                        term,
                        last_log_index,
                        last_log_term,
                    },
                );
            }
        }

        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        info!(replica = self.id, term = self.current_term, "became leader");
        self.role = Role::Leader;
        self.votes.clear();
        self.heartbeat_timer.renew();
        self.replication.reset(
            &self.membership.replication_targets(self.id),
            self.log.last_index() + 1,
        );
        self.set_leader(Some(self.id));

        // Entries from earlier terms only commit once an entry of this term
        // does, so get one into the log right away.
        self.append_as_leader(EntryKind::Noop, Bytes::new())?;
        Ok(())
    }

    fn become_follower(&mut self, term: u64, leader_id: Option<ReplicaID>) -> Result<()> {
        if term > self.current_term {
            self.log.save_term_and_vote(term, None)?;
            self.current_term = term;
            self.voted_for = None;
        }
        if self.role != Role::Follower {
            info!(replica = self.id, term, "became follower");
        }

        self.role = Role::Follower;
        self.votes.clear();
        self.replication.clear();
        self.election_timer.renew();
        self.set_leader(leader_id);
        Ok(())
    }

    fn set_leader(&mut self, leader_id: Option<ReplicaID>) {
        if self.leader_id != leader_id {
            self.leader_id = leader_id;
            self.cluster.register_leader(leader_id);
        }
        self.membership.observe_roles(self.id, self.role, self.leader_id);
    }

    // A valid AppendEntries or InstallSnapshot arrived for the current term.
    fn accept_leader(&mut self, leader_id: ReplicaID) -> Result<()> {
        if self.role == Role::Candidate {
            return self.become_follower(self.current_term, Some(leader_id));
        }
        self.election_timer.renew();
        self.set_leader(Some(leader_id));
        Ok(())
    }

    // -- vote handling --

    fn handle_request_vote(
        &mut self,
        candidate_id: ReplicaID,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<()> {
        let mut vote_granted = false;

        if term < self.current_term {
            debug!(replica = self.id, candidate = candidate_id, term, "stale vote request");
        } else if !self.membership.is_voter(candidate_id) {
            debug!(replica = self.id, candidate = candidate_id, term, "candidate is not a voter");
        } else {
            let can_vote = self.voted_for.map_or(true, |id| id == candidate_id);
            let up_to_date = (last_log_term, last_log_index) >= (self.log.last_term(), self.log.last_index());

            if can_vote && up_to_date {
                if self.voted_for != Some(candidate_id) {
                    self.log.save_term_and_vote(self.current_term, Some(candidate_id))?;
                    self.voted_for = Some(candidate_id);
                }
                self.election_timer.renew();
                vote_granted = true;
            }
        }

        debug!(
            replica = self.id,
            candidate = candidate_id,
            term = self.current_term,
            vote_granted,
            "answered vote request"
        );
        self.cluster.send(
            candidate_id,
            Message::RequestVoteResponse {
                from_id: self.id,
                term: self.current_term,
                vote_granted,
            },
        );
        Ok(())
    }

    fn handle_vote_response(&mut self, from_id: ReplicaID, term: u64, vote_granted: bool) -> Result<()> {
        if self.role != Role::Candidate || term != self.current_term {
            debug!(replica = self.id, from = from_id, term, "stale vote response");
            return Ok(());
        }

        if vote_granted && self.membership.is_voter(from_id) {
            self.votes.insert(from_id);
            if self.membership.has_quorum(&self.votes) {
                self.become_leader()?;
            }
        }

        Ok(())
    }

    // -- replication, follower side --

    fn handle_append_entries(
        &mut self,
        leader_id: ReplicaID,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
    ) -> Result<()> {
        if term < self.current_term {
            debug!(replica = self.id, leader = leader_id, term, "stale append");
            self.send_append_response(leader_id, false, self.log.last_index() + 1);
            return Ok(());
        }
        if self.role == Role::Leader {
            error!(replica = self.id, other = leader_id, term, "another leader claims this term, ignoring");
            return Ok(());
        }
        self.accept_leader(leader_id)?;

        // Anything at or below our snapshot is committed and therefore matches.
        let matched = prev_log_index < self.log.offset() || self.log.term_at(prev_log_index) == Some(prev_log_term);
        if !matched {
            let hint = match self.log.term_at(prev_log_index) {
                Some(conflict_term) => self.log.first_index_of_term(conflict_term, prev_log_index),
                None => self.log.last_index() + 1,
            };
            debug!(
                replica = self.id,
                prev_log_index,
                prev_log_term,
                hint,
                "log mismatch"
            );
            self.send_append_response(leader_id, false, hint);
            return Ok(());
        }

        let match_index = (prev_log_index + entries.len() as u64).max(self.log.offset());
        self.log.merge(entries)?;
        self.refresh_pending()?;

        if leader_commit > self.log.commit_index() {
            self.log.commit_to(leader_commit.min(match_index));
            self.apply_committed()?;
        }

        self.send_append_response(leader_id, true, match_index);
        Ok(())
    }

    fn send_append_response(&mut self, leader_id: ReplicaID, success: bool, match_hint: u64) {
        self.cluster.send(
            leader_id,
            Message::AppendEntriesResponse {
                from_id: self.id,
                term: self.current_term,
                success,
                match_hint,
            },
        );
    }

    fn handle_install_snapshot(
        &mut self,
        leader_id: ReplicaID,
        term: u64,
        snapshot: Snapshot,
        trailing_entries: Vec<Entry>,
    ) -> Result<()> {
        if term < self.current_term {
            debug!(replica = self.id, leader = leader_id, term, "stale snapshot");
            self.send_install_response(leader_id, false, 0);
            return Ok(());
        }
        if self.role == Role::Leader {
            error!(replica = self.id, other = leader_id, term, "another leader claims this term, ignoring");
            return Ok(());
        }
        self.accept_leader(leader_id)?;

        match self.apply_install(snapshot, trailing_entries) {
            Ok(match_index) => {
                self.send_install_response(leader_id, true, match_index);
                Ok(())
            }
            Err(Error::CorruptSnapshot {
                index,
                expected,
                actual,
            }) => {
                warn!(
                    replica = self.id,
                    leader = leader_id,
                    index,
                    %expected,
                    %actual,
                    "rejected corrupt snapshot"
                );
                self.send_install_response(leader_id, false, 0);
                Ok(())
            }
            Err(Error::NonContiguous { index, expected }) => {
                warn!(replica = self.id, leader = leader_id, index, expected, "rejected snapshot tail with a gap");
                self.send_install_response(leader_id, false, 0);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn send_install_response(&mut self, leader_id: ReplicaID, success: bool, match_index: u64) {
        self.cluster.send(
            leader_id,
            Message::InstallSnapshotResponse {
                from_id: self.id,
                term: self.current_term,
                success,
                match_index,
            },
        );
    }

    // -- replication, leader side --

    fn append_as_leader(&mut self, kind: EntryKind, payload: Bytes) -> Result<u64> {
        let entry = Entry {
            index: self.log.last_index() + 1,
            term: self.current_term,
            kind,
            payload,
        };
        let index = self.log.append(vec![entry])?;
        self.refresh_pending()?;
        self.broadcast_append();
        // A single voter commits on its own.
        self.advance_commit_index()?;
        Ok(index)
    }

    fn broadcast_append(&mut self) {
        for peer_id in self.replication.targets() {
            self.send_append(peer_id);
        }
    }

    // Send the follower whatever it is missing: entries from its next index,
    // or the snapshot if those entries were compacted away.
    fn send_append(&mut self, peer_id: ReplicaID) {
        let progress = match self.replication.progress(peer_id) {
            Some(progress) => progress,
            None => return,
        };
        let next_index = progress.next_index.min(self.log.last_index() + 1);
        let prev_log_index = next_index - 1;

        let message = match self.log.term_at(prev_log_index) {
            Some(prev_log_term) => Message::AppendEntries {
                leader_id: self.id,
                term: self.current_term,
                prev_log_index,
                prev_log_term,
                entries: self
                    .log
                    .entries_from(next_index)
                    .iter()
                    .take(self.config.max_append_entries)
                    .cloned()
                    .collect(),
                leader_commit: self.log.commit_index(),
            },
            None => match self.snapshots.current() {
                Some(snapshot) => {
                    debug!(
                        replica = self.id,
                        peer = peer_id,
                        next_index,
                        snapshot_index = snapshot.last_included_index,
                        "follower is behind the log, sending snapshot"
                    );
                    self.snapshots
                        .build_install_message(snapshot, self.current_term, self.id, &self.log)
                }
                None => {
                    warn!(replica = self.id, peer = peer_id, next_index, "no snapshot to send");
                    return;
                }
            },
        };

        self.cluster.send(peer_id, message);
    }

    fn handle_append_response(&mut self, from_id: ReplicaID, term: u64, success: bool, match_hint: u64) -> Result<()> {
        if self.role != Role::Leader || term != self.current_term {
            debug!(replica = self.id, from = from_id, term, "stale append response");
            return Ok(());
        }

        if success {
            if self.replication.record_success(from_id, match_hint) {
                self.advance_commit_index()?;
                self.send_if_behind(from_id);
            }
        } else {
            self.replication.record_failure(from_id, match_hint);
            self.send_append(from_id);
        }

        Ok(())
    }

    fn handle_install_response(&mut self, from_id: ReplicaID, term: u64, success: bool, match_index: u64) -> Result<()> {
        if self.role != Role::Leader || term != self.current_term {
            debug!(replica = self.id, from = from_id, term, "stale snapshot response");
            return Ok(());
        }

        if success {
            if self.replication.record_success(from_id, match_index) {
                self.advance_commit_index()?;
                self.send_if_behind(from_id);
            }
        } else {
            // The next heartbeat ships the snapshot again from scratch.
            warn!(replica = self.id, peer = from_id, "follower rejected snapshot");
        }

        Ok(())
    }

    fn send_if_behind(&mut self, peer_id: ReplicaID) {
        if let Some(progress) = self.replication.progress(peer_id) {
            if progress.next_index <= self.log.last_index() {
                self.send_append(peer_id);
            }
        }
    }

    // Move the commit index to the highest entry of the current term stored
    // on a majority of voters. Entries of earlier terms are committed
    // indirectly through it.
    fn advance_commit_index(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }

        let voters = self.membership.voters();
        let n = self
            .replication
            .quorum_match_index(&voters, self.id, self.log.last_index());
        if n <= self.log.commit_index() || self.log.term_at(n) != Some(self.current_term) {
            return Ok(());
        }

        self.log.commit_to(n);
        debug!(replica = self.id, term = self.current_term, commit_index = n, "advanced commit index");
        self.apply_committed()?;

        // Let followers learn the new commit index without waiting for the
        // next heartbeat.
        if self.role == Role::Leader {
            self.broadcast_append();
        }
        Ok(())
    }

    // -- applying committed entries --

    fn apply_committed(&mut self) -> Result<()> {
        while self.last_applied < self.log.commit_index() {
            let index = self.last_applied + 1;
            let entry = match self.log.entry(index) {
                Some(entry) => entry.clone(),
                None => break,
            };

            match entry.kind {
                EntryKind::Command => self.state_machine.apply(index, &entry.payload),
                EntryKind::ConfigChange => {
                    let change = ConfigChange::decode(&entry.payload)?;
                    self.apply_config_change(index, change);
                }
                EntryKind::Noop => {}
            }
            self.last_applied = index;
        }

        if let Some(threshold) = self.config.snapshot_threshold {
            if self.last_applied.saturating_sub(self.log.offset()) >= threshold {
                self.create_snapshot()?;
            }
        }

        Ok(())
    }

    fn apply_config_change(&mut self, index: u64, change: ConfigChange) {
        info!(replica = self.id, index, change = ?change, "membership change committed");
        let removed = match change {
            ConfigChange::RemoveMember { id } => Some(id),
            ConfigChange::AddMember { .. } => None,
        };
        let removed_self = removed == Some(self.id);
        self.membership.commit(index, change);

        if self.role == Role::Leader {
            if removed_self {
                // Followers still need to hear that the removal committed.
                self.broadcast_append();
                info!(replica = self.id, term = self.current_term, "removed from the cluster, stepping down");
                self.role = Role::Follower;
                self.replication.clear();
                self.set_leader(None);
            } else {
                if let Some(id) = removed {
                    // Keep it in the loop until it has the removal entry, or
                    // it would time out and campaign.
                    self.replication.retire(id, index);
                }
                self.replication.sync_targets(
                    &self.membership.replication_targets(self.id),
                    self.log.last_index() + 1,
                );
            }
        }
        self.membership.observe_roles(self.id, self.role, self.leader_id);
    }

    // Re-derive the in-flight membership change from the unapplied part of
    // the log. Called after every log mutation.
    fn refresh_pending(&mut self) -> Result<()> {
        let mut pending = None;
        for entry in self.log.entries_from(self.last_applied + 1) {
            if entry.kind == EntryKind::ConfigChange {
                pending = Some(PendingChange {
                    index: entry.index,
                    change: ConfigChange::decode(&entry.payload)?,
                });
            }
        }

        self.membership.set_pending(pending);
        if self.role == Role::Leader {
            self.replication.sync_targets(
                &self.membership.replication_targets(self.id),
                self.log.last_index() + 1,
            );
        }
        self.membership.observe_roles(self.id, self.role, self.leader_id);
        Ok(())
    }
}
