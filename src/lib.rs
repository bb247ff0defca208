//! repliq - a Raft-based replicated state machine library
//!
//! Given a user-supplied state machine, a cluster configuration, and a
//! durable log, repliq elects a leader among the cluster members, replicates
//! submitted commands to a majority before applying them, and keeps every
//! replica's state machine deterministically in sync. Commands submitted to
//! a follower are forwarded to the leader; logs are compacted through
//! snapshots; membership changes go through joint consensus so no
//! configuration transition ever exposes a dual-majority window.

pub mod api;
pub mod cluster;
pub mod core;
pub mod events;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
