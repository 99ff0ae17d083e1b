//! Wire messages for the replicated state machine (spec §6.3).
//!
//! Modeled as plain `serde`-derived structs rather than compiled `.proto`
//! messages: the retrieved pack carries no `.proto` source for this system,
//! and the teacher already JSON-encodes its own Raft payload type
//! (`LoadTestRequest`/`LoadTestResponse` in `raft.rs`) rather than feeding it
//! through `prost`. These types play the same role here: they are the `D`/`R`
//! associated types of `openraft::declare_raft_types!`.

use serde::{Deserialize, Serialize};

/// A single stored value plus its namespace key and optional expiry.
///
/// `expire` is a Unix millisecond timestamp; `0` means "no expiry", matching
/// the badger convention carried over from `original_source/raft/state_machine.go`'s
/// `toPBItem` (which normalizes `0 <-> MaxUint64` at the storage boundary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expire: u64,
}

/// Predicate used by `Query` to match candidate keys.
///
/// `eq`/`ne` match whole keys exactly; `prefix`/`contains`/`suffix` match
/// substrings; `st`/`ed` bound a range scan. See spec §4.4 for the full
/// matching semantics, including the corrected `ne` evaluation (this
/// implementation iterates `ne`, not `eq`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Condition {
    pub prefix: Option<Vec<u8>>,
    pub contains: Option<Vec<u8>>,
    pub suffix: Option<Vec<u8>>,
    #[serde(default)]
    pub eq: Vec<Vec<u8>>,
    #[serde(default)]
    pub ne: Vec<Vec<u8>>,
    pub st: Option<Vec<u8>>,
    pub ed: Option<Vec<u8>>,
}

impl Condition {
    pub fn is_empty(&self) -> bool {
        self.prefix.is_none()
            && self.contains.is_none()
            && self.suffix.is_none()
            && self.eq.is_empty()
            && self.ne.is_empty()
            && self.st.is_none()
            && self.ed.is_none()
    }
}

/// A read query: either a direct single-key lookup (`condition.eq` with one
/// entry and no range bounds) or a range/predicate scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    pub condition: Condition,
    pub limit: Option<u32>,
    #[serde(default)]
    pub reverse: bool,
    /// Key-only scan, skipping value reads — mirrors badger's
    /// `IteratorOptions.PrefetchValues = false`.
    #[serde(default)]
    pub keys_only: bool,
}

/// The three update actions a single `UpdateRequestEntry` may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateAction {
    Create,
    Update,
    Delete,
}

/// One mutation within an `UpdateRequest`'s transaction.
///
/// `rename_to`, when set, requires `query` to match exactly one existing
/// item (spec §4.4); matching zero or more than one is an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequestEntry {
    pub action: UpdateAction,
    pub query: Query,
    pub value: Option<Vec<u8>>,
    pub expire: Option<u64>,
    pub rename_to: Option<Vec<u8>>,
}

/// The `D` associated type of `TypeConfig`: every proposed log entry is one
/// batch of entries applied atomically in a single store transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub entries: Vec<UpdateRequestEntry>,
}

/// A lookup request applied via openraft's read-index path (not through the
/// log) — see `Cluster::lookup` (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    pub query: Query,
    #[serde(default)]
    pub response: ResponseField,
}

/// Request-level echo mask (spec §6.3): which fields of each returned `Item`
/// the caller actually wants back. Defaults to echoing everything, so a
/// caller that omits `response` entirely sees the same `Item`s as before
/// this field existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseField {
    pub key: bool,
    pub value: bool,
    pub expire: bool,
}

impl Default for ResponseField {
    fn default() -> Self {
        ResponseField { key: true, value: true, expire: true }
    }
}

impl ResponseField {
    /// Zeroes out the fields this mask excludes. `expire: 0` doubles as
    /// "omitted" here, since a real no-TTL item is already normalized to
    /// `u64::MAX` before reaching this point (see `state_machine.rs`).
    pub fn mask(&self, mut item: Item) -> Item {
        if !self.key {
            item.key.clear();
        }
        if !self.value {
            item.value.clear();
        }
        if !self.expire {
            item.expire = 0;
        }
        item
    }
}

/// Result payload carried by `Response`, distinguishing a query read from an
/// update write (spec §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    Items(Vec<Item>),
    Updated(u32),
}

/// The `R` associated type of `TypeConfig`.
///
/// `index` mirrors the original's sentinel convention: `-2` on lookup
/// success, the 1-based position of the first failing sub-request on update
/// failure, and the full applied log index is available separately via
/// `openraft`'s own `ClientWriteResponse`. `error` carries a caller-facing
/// message; infrastructure faults are never smuggled in here (see
/// `StateMachineError` in `errors.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub index: i64,
    pub data: Option<ResponseData>,
    pub error: Option<String>,
}

impl Response {
    pub const LOOKUP_SUCCESS: i64 = -2;
    pub const DECODE_FAILURE: i64 = -1;

    pub fn lookup_ok(items: Vec<Item>) -> Self {
        Response {
            index: Self::LOOKUP_SUCCESS,
            data: Some(ResponseData::Items(items)),
            error: None,
        }
    }

    pub fn update_ok(updated: u32) -> Self {
        Response {
            index: Self::LOOKUP_SUCCESS,
            data: Some(ResponseData::Updated(updated)),
            error: None,
        }
    }

    pub fn failed(index: i64, message: impl Into<String>) -> Self {
        Response {
            index,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Per-partition bootstrap record (spec §3 Bootstrap entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bootstrap {
    pub join: bool,
    pub members: Vec<(u64, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_roundtrip() {
        let req = UpdateRequest {
            entries: vec![UpdateRequestEntry {
                action: UpdateAction::Create,
                query: Query {
                    condition: Condition {
                        eq: vec![b"a".to_vec()],
                        ..Default::default()
                    },
                    ..Default::default()
                },
                value: Some(b"v".to_vec()),
                expire: None,
                rename_to: None,
            }],
        };
        let encoded = serde_json::to_vec(&req).unwrap();
        let decoded: UpdateRequest = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.entries.len(), 1);
    }

    #[test]
    fn condition_is_empty_detects_empty() {
        assert!(Condition::default().is_empty());
        let mut c = Condition::default();
        c.prefix = Some(b"x".to_vec());
        assert!(!c.is_empty());
    }

    #[test]
    fn response_lookup_ok_sentinel() {
        let r = Response::lookup_ok(vec![]);
        assert_eq!(r.index, Response::LOOKUP_SUCCESS);
    }
}
