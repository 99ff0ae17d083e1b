//! Replicated ordered key-value store: a Raft-backed partition (spec §1-§4)
//! exposed over gRPC (spec §6), built on an embedded store and openraft.
//!
//! `main.rs` is the composition root; everything else lives here so it can
//! be exercised directly from integration tests without going through the
//! network.

pub mod client;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod event_pump;
pub mod grpc;
pub mod keycodec;
pub mod logstore;
pub mod metrics;
pub mod network;
pub mod raft_types;
pub mod snapshot;
pub mod state_machine;
pub mod store;
pub mod types;
