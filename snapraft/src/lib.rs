//! This crate is an implementation of the Raft distributed consensus protocol
//! with log compaction and online membership changes. By using this library,
//! you can run a replicated state machine in your own cluster and keep it
//! running while the log grows without bound and while nodes come and go.
//!
//! A lagging follower whose missing entries were compacted away is caught up
//! with a single InstallSnapshot message that carries the snapshot together
//! with the log entries that follow it, so the follower is current as soon as
//! it installs it. Membership changes one node at a time through
//! configuration entries that go through the log like any other command.
//!
//! As with any Raft library, it is up to the user how to move messages between
//! nodes, what to persist them to, and what state machine to replicate. The
//! [`cluster::Cluster`], [`storage::Storage`] and
//! [`state_machine::StateMachine`] traits are where those decisions plug in.
//! A [`replica::Replica`] can be driven either by calling
//! [`replica::Replica::step`] and [`replica::Replica::tick`] directly or by
//! handing it a thread with [`replica::Replica::start`].
pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub mod log;
pub mod membership;
pub mod message;
pub mod replica;
pub mod replication;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
mod timer;

pub use config::RaftConfig;
pub use error::{Error, Result};
pub use membership::{ClusterMember, ConfigChange, MemberStatus, Role};
pub use message::{Entry, EntryKind, Message, ReplicaID};
pub use replica::Replica;
pub use snapshot::Snapshot;
