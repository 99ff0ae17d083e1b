//! `openraft` type configuration for the replicated store.
//!
//! Plays the role `raft.rs`'s `declare_raft_types!` block plays in the
//! teacher, generalized from the load-test's `LoadTestRequest`/
//! `LoadTestResponse` payload to this system's `UpdateRequest`/`Response`
//! (spec §6.3).

use std::io::Cursor;

use openraft::{BasicNode, Entry, TokioRuntime};

use crate::types::{Response, UpdateRequest};

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = UpdateRequest,
        R            = Response,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;
