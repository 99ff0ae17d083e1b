//! Byte key namespacing (spec §3, §4.1).
//!
//! One shared ordered keyspace holds Raft metadata, log entries, snapshot
//! descriptors, bootstrap records, and state-machine data. `RAFT_KEY` is the
//! top-level tag; the second byte selects the sub-namespace. All multi-byte
//! integers are big-endian so byte order matches numeric order — this is
//! what makes the store's ordered iteration usable as a range scan.
//!
//! Grounded in `original_source/raft/logdb.go`'s `newKey`/`parseKey` family
//! and `state_machine.go`'s `NewKey`/`ParseKey`, generalized into a single
//! sum type per the REDESIGN FLAGS (spec §9: "do not scatter byte slicing
//! through the state machine").

use crate::errors::KeyError;

pub const RAFT_KEY: u8 = b'r';

const TAG_ENTRY: u8 = 1;
const TAG_PERSISTENT_STATE: u8 = 2;
const TAG_MAX_INDEX: u8 = 3;
const TAG_NODE_INFO: u8 = 4;
const TAG_SNAPSHOT: u8 = 5;
const TAG_BOOTSTRAP: u8 = 6;
const TAG_ENTRY_BATCH: u8 = 7;
const TAG_STATE_MACHINE: u8 = 128;

/// A decoded key in any sub-namespace, per the table in spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Entry {
        cluster_id: u64,
        node_id: u64,
        index: u64,
    },
    PersistentState {
        cluster_id: u64,
        node_id: u64,
    },
    MaxIndex {
        cluster_id: u64,
        node_id: u64,
    },
    Snapshot {
        cluster_id: u64,
        node_id: u64,
        index: u64,
    },
    Bootstrap {
        cluster_id: u64,
        node_id: u64,
    },
    /// `user_key` is the raw suffix after `tag‖cluster_id` — callers must
    /// still strip the partition's own prefix via [`state_machine_user_key`].
    StateMachine {
        cluster_id: u64,
        user_key: Vec<u8>,
    },
}

fn partition_prefix(tag: u8, cluster_id: u64, node_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(18);
    key.push(RAFT_KEY);
    key.push(tag);
    key.extend_from_slice(&cluster_id.to_be_bytes());
    key.extend_from_slice(&node_id.to_be_bytes());
    key
}

fn parse_partition_prefix(tag: u8, key: &[u8]) -> Result<(u64, u64), KeyError> {
    if key.len() != 18 {
        return Err(KeyError::WrongLength {
            got: key.len(),
            want: 18,
        });
    }
    if key[0] != RAFT_KEY || key[1] != tag {
        return Err(KeyError::TagMismatch);
    }
    let cluster_id = u64::from_be_bytes(key[2..10].try_into().unwrap());
    let node_id = u64::from_be_bytes(key[10..18].try_into().unwrap());
    Ok((cluster_id, node_id))
}

pub fn new_entry_key(cluster_id: u64, node_id: u64, index: u64) -> Vec<u8> {
    let mut key = partition_prefix(TAG_ENTRY, cluster_id, node_id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

pub fn parse_entry_key(key: &[u8]) -> Result<(u64, u64, u64), KeyError> {
    if key.len() != 26 {
        return Err(KeyError::WrongLength {
            got: key.len(),
            want: 26,
        });
    }
    let (cluster_id, node_id) = parse_partition_prefix(TAG_ENTRY, &key[0..18])?;
    let index = u64::from_be_bytes(key[18..26].try_into().unwrap());
    Ok((cluster_id, node_id, index))
}

/// Lowest and one-past-highest possible entry keys for a partition — used to
/// bound a prefix scan.
pub fn entry_key_prefix(cluster_id: u64, node_id: u64) -> Vec<u8> {
    partition_prefix(TAG_ENTRY, cluster_id, node_id)
}

pub fn new_persistent_state_key(cluster_id: u64, node_id: u64) -> Vec<u8> {
    partition_prefix(TAG_PERSISTENT_STATE, cluster_id, node_id)
}

pub fn parse_persistent_state_key(key: &[u8]) -> Result<(u64, u64), KeyError> {
    parse_partition_prefix(TAG_PERSISTENT_STATE, key)
}

pub fn new_max_index_key(cluster_id: u64, node_id: u64) -> Vec<u8> {
    partition_prefix(TAG_MAX_INDEX, cluster_id, node_id)
}

pub fn parse_max_index_key(key: &[u8]) -> Result<(u64, u64), KeyError> {
    parse_partition_prefix(TAG_MAX_INDEX, key)
}

pub fn new_bootstrap_key(cluster_id: u64, node_id: u64) -> Vec<u8> {
    partition_prefix(TAG_BOOTSTRAP, cluster_id, node_id)
}

pub fn parse_bootstrap_key(key: &[u8]) -> Result<(u64, u64), KeyError> {
    parse_partition_prefix(TAG_BOOTSTRAP, key)
}

pub fn bootstrap_key_prefix() -> Vec<u8> {
    vec![RAFT_KEY, TAG_BOOTSTRAP]
}

pub fn new_snapshot_key(cluster_id: u64, node_id: u64, index: u64) -> Vec<u8> {
    let mut key = partition_prefix(TAG_SNAPSHOT, cluster_id, node_id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

pub fn parse_snapshot_key(key: &[u8]) -> Result<(u64, u64, u64), KeyError> {
    if key.len() != 26 {
        return Err(KeyError::WrongLength {
            got: key.len(),
            want: 26,
        });
    }
    let (cluster_id, node_id) = parse_partition_prefix(TAG_SNAPSHOT, &key[0..18])?;
    let index = u64::from_be_bytes(key[18..26].try_into().unwrap());
    Ok((cluster_id, node_id, index))
}

pub fn snapshot_key_prefix(cluster_id: u64, node_id: u64) -> Vec<u8> {
    partition_prefix(TAG_SNAPSHOT, cluster_id, node_id)
}

/// State-machine key: `tag ‖ cluster_id(8) ‖ user-key`. Unlike the other
/// namespaces this one is not also scoped by `node_id` — every replica of a
/// partition applies the identical deterministic keyspace, so `node_id`
/// plays no role in addressing a state-machine item.
///
/// The original Go `NewKey` helper corrupted the caller's key buffer instead
/// of writing into a fresh one (spec §9 Open Questions); this implementation
/// always allocates a new buffer, which is the only possible behavior in
/// safe Rust and also the behavior spec.md mandates.
pub fn new_state_machine_key(cluster_id: u64, user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(10 + user_key.len());
    key.push(RAFT_KEY);
    key.push(TAG_STATE_MACHINE);
    key.extend_from_slice(&cluster_id.to_be_bytes());
    key.extend_from_slice(user_key);
    key
}

/// The empty-user-key form of [`new_state_machine_key`] — the partition
/// prefix alone, used as an iteration prefix bound.
pub fn state_machine_key_prefix(cluster_id: u64) -> Vec<u8> {
    new_state_machine_key(cluster_id, &[])
}

/// Recovers the user-space key from a full state-machine key, verifying the
/// tag and the embedded `cluster_id` match this partition. Rejects keys
/// shorter than `2 + 8` bytes, per spec §4.1.
pub fn parse_state_machine_key(cluster_id: u64, key: &[u8]) -> Result<Vec<u8>, KeyError> {
    if key.len() < 10 {
        return Err(KeyError::WrongLength {
            got: key.len(),
            want: 10,
        });
    }
    if key[0] != RAFT_KEY || key[1] != TAG_STATE_MACHINE {
        return Err(KeyError::TagMismatch);
    }
    let got_cluster_id = u64::from_be_bytes(key[2..10].try_into().unwrap());
    if got_cluster_id != cluster_id {
        return Err(KeyError::ClusterMismatch);
    }
    Ok(key[10..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_key_roundtrip() {
        let key = new_entry_key(7, 3, 42);
        let (c, n, i) = parse_entry_key(&key).unwrap();
        assert_eq!((c, n, i), (7, 3, 42));
    }

    #[test]
    fn entry_key_ordering_matches_index_ordering() {
        let a = new_entry_key(1, 1, 10);
        let b = new_entry_key(1, 1, 11);
        assert!(a < b);
    }

    #[test]
    fn snapshot_key_roundtrip() {
        let key = new_snapshot_key(9, 9, 100);
        assert_eq!(parse_snapshot_key(&key).unwrap(), (9, 9, 100));
    }

    #[test]
    fn bootstrap_key_roundtrip() {
        let key = new_bootstrap_key(5, 6);
        assert_eq!(parse_bootstrap_key(&key).unwrap(), (5, 6));
    }

    #[test]
    fn state_machine_key_roundtrip() {
        let key = new_state_machine_key(11, b"hello");
        assert_eq!(
            parse_state_machine_key(11, &key).unwrap(),
            b"hello".to_vec()
        );
    }

    #[test]
    fn state_machine_key_rejects_wrong_cluster() {
        let key = new_state_machine_key(11, b"hello");
        assert!(matches!(
            parse_state_machine_key(12, &key),
            Err(KeyError::ClusterMismatch)
        ));
    }

    #[test]
    fn state_machine_key_rejects_short_keys() {
        let short = vec![RAFT_KEY, 128, 0, 0];
        assert!(matches!(
            parse_state_machine_key(0, &short),
            Err(KeyError::WrongLength { .. })
        ));
    }

    #[test]
    fn entry_key_rejects_length_mismatch() {
        let mut key = new_entry_key(1, 1, 1);
        key.push(0);
        assert!(matches!(
            parse_entry_key(&key),
            Err(KeyError::WrongLength { .. })
        ));
    }

    #[test]
    fn parse_rejects_wrong_tag() {
        let key = new_bootstrap_key(1, 1);
        assert!(matches!(
            parse_max_index_key(&key),
            Err(KeyError::TagMismatch)
        ));
    }
}
