//! `StateMachine` (spec §4.4): the replicated key-value data plane applied
//! from the Raft log.
//!
//! Grounded in `original_source/raft/state_machine.go`. Implements
//! `openraft`'s `RaftStateMachine` + `RaftSnapshotBuilder` directly against
//! [`crate::store::Store`]. Carries forward three corrected behaviors from
//! the original (spec §9 Open Questions):
//!
//! 1. `ne[]` is matched against `ne[]`, not `eq[]` (the original's `match()`
//!    iterates `condition.Eq` inside the `len(condition.Ne) != 0` guard).
//! 2. Building a state-machine key always allocates a fresh buffer
//!    (`keycodec::new_state_machine_key`); the original's `NewKey` corrupted
//!    the caller's own key slice.
//! 3. CREATE only succeeds when the key is absent, UPDATE only when present,
//!    DELETE only when present — applied consistently, where the original
//!    had the checks inverted in places.

use std::sync::{Arc, Mutex};

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    EntryPayload, LogId, RaftLogId, Snapshot, SnapshotMeta, StorageError, StorageIOError,
    StoredMembership,
};
use tracing::debug;

use crate::errors::StateMachineError;
use crate::event_pump::{EventBatch, EventPump};
use crate::keycodec;
use crate::raft_types::{NodeId, TypeConfig};
use crate::snapshot::{SnapshotReader, SnapshotWriter};
use crate::store::{IterOptions, Reader, Store, Txn};
use crate::types::{
    Condition, Item, LookupRequest, Query, Response, ResponseData, UpdateAction, UpdateRequest,
    UpdateRequestEntry,
};

/// `redb` has no native TTL, so a stored expiry of `0` means "no TTL"
/// internally; the wire convention (spec §6.2/§6.3) is the opposite —
/// `expire == u64::MAX` means "no TTL", `0` is never sent over the wire.
/// These two helpers are the only place that boundary gets crossed.
fn normalize_expire_out(stored: u64) -> u64 {
    if stored == 0 {
        u64::MAX
    } else {
        stored
    }
}

fn denormalize_expire_in(wire: u64) -> u64 {
    if wire == u64::MAX {
        0
    } else {
        wire
    }
}

/// `expire == 1` on a `CREATE`/`UPDATE` entry is an explicit delete signal
/// (spec §3, §4.4; `state_machine.go:700`), equivalent to `action == DELETE`
/// against the same match set.
const DELETE_SIGNAL_EXPIRE: u64 = 1;

fn storage_err(e: impl std::error::Error + Send + Sync + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::write(&e),
    }
}

/// Matches a user-space key against a `Condition` (spec §4.4). `st`/`ed`
/// bound the scan itself and are not re-checked here.
fn match_condition(condition: &Condition, key: &[u8]) -> bool {
    if let Some(prefix) = &condition.prefix {
        if !key.starts_with(prefix.as_slice()) {
            return false;
        }
    }
    if let Some(contains) = &condition.contains {
        if !contains.is_empty() && !key.windows(contains.len()).any(|w| w == contains.as_slice()) {
            return false;
        }
    }
    if let Some(suffix) = &condition.suffix {
        if !key.ends_with(suffix.as_slice()) {
            return false;
        }
    }
    if !condition.eq.is_empty() && !condition.eq.iter().any(|e| e.as_slice() == key) {
        return false;
    }
    if !condition.ne.is_empty() && condition.ne.iter().any(|n| n.as_slice() == key) {
        return false;
    }
    true
}

#[derive(Clone)]
pub struct StateMachine {
    store: Store,
    cluster_id: u64,
    node_id: u64,
    event_pump: Arc<EventPump>,
    last_applied: Arc<Mutex<Option<LogId<NodeId>>>>,
    last_membership: Arc<Mutex<StoredMembership<NodeId, openraft::BasicNode>>>,
}

impl StateMachine {
    pub fn new(store: Store, cluster_id: u64, node_id: u64, event_pump: Arc<EventPump>) -> Self {
        StateMachine {
            store,
            cluster_id,
            node_id,
            event_pump,
            last_applied: Arc::new(Mutex::new(None)),
            last_membership: Arc::new(Mutex::new(StoredMembership::default())),
        }
    }

    /// Executes a read-only `Query` against the state machine (spec §4.4
    /// `lookupEntry`/`query`). Returns `Response::lookup_ok`.
    ///
    /// A single `eq` entry with no other predicate takes the short,
    /// point-get path (`lookupEntry`'s direct-key branch in the original);
    /// everything else iterates the partition's keyspace.
    pub fn lookup(&self, query: &Query) -> Result<Response, StateMachineError> {
        let items = self.run_query(&self.store, query)?;
        Ok(Response::lookup_ok(items))
    }

    /// `lookup` plus the request-level `{key, value, expire}` echo mask
    /// (spec §6.3 `ResponseField`).
    pub fn lookup_with_mask(&self, request: &LookupRequest) -> Result<Response, StateMachineError> {
        let mut response = self.lookup(&request.query)?;
        if let Some(ResponseData::Items(items)) = response.data.take() {
            let masked = items.into_iter().map(|item| request.response.mask(item)).collect();
            response.data = Some(ResponseData::Items(masked));
        }
        Ok(response)
    }

    /// Stops the event pump's consumer and waits for it to drain and exit
    /// (spec §4.5, §5 graceful shutdown).
    pub async fn close_event_pump(&self) {
        self.event_pump.close().await;
    }

    /// Runs a `Query` against `source` — either the bare `Store` (plain
    /// reads) or an in-flight [`Txn`] (reads that see that transaction's own
    /// uncommitted writes, so later sub-requests in the same `update()` batch
    /// observe earlier ones).
    fn run_query(&self, source: &impl Reader, query: &Query) -> Result<Vec<Item>, StateMachineError> {
        let condition = &query.condition;

        if condition.eq.len() == 1
            && condition.prefix.is_none()
            && condition.contains.is_none()
            && condition.suffix.is_none()
            && condition.ne.is_empty()
            && condition.st.is_none()
            && condition.ed.is_none()
        {
            let user_key = &condition.eq[0];
            let key = keycodec::new_state_machine_key(self.cluster_id, user_key);
            return match source.get_with_expire(&key)? {
                Some((value, expire)) => Ok(vec![Item {
                    key: user_key.clone(),
                    value: if query.keys_only { Vec::new() } else { value },
                    expire: normalize_expire_out(expire),
                }]),
                None => Ok(Vec::new()),
            };
        }

        // Spec §4.4 step 2: with no `eq` candidates, at least one of
        // `st`/`ed`/`limit>0` must be present, or the scan has no bound at
        // all and the whole partition would be returned.
        if condition.st.is_none() && condition.ed.is_none() && query.limit.unwrap_or(0) == 0 {
            return Err(StateMachineError::QueryKeyConditionMissing);
        }

        let prefix = keycodec::state_machine_key_prefix(self.cluster_id);
        let seek = match &condition.st {
            Some(st) => keycodec::new_state_machine_key(self.cluster_id, st),
            None => prefix.clone(),
        };
        let rows = source.scan(&IterOptions {
            prefix: Some(prefix.clone()),
            seek: Some(seek),
            reverse: query.reverse,
            ..Default::default()
        })?;

        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let mut items = Vec::new();
        for (key, value, expire) in rows {
            let user_key = keycodec::parse_state_machine_key(self.cluster_id, &key)?;
            if let Some(ed) = &condition.ed {
                if user_key.as_slice() >= ed.as_slice() {
                    continue;
                }
            }
            if !match_condition(condition, &user_key) {
                continue;
            }
            items.push(Item {
                key: user_key,
                value: if query.keys_only { Vec::new() } else { value },
                expire: normalize_expire_out(expire),
            });
            if items.len() >= limit {
                break;
            }
        }
        Ok(items)
    }

    /// Applies one `UpdateRequest`'s sub-requests atomically (spec §4.4
    /// `Update`): a single store read-write transaction wraps every
    /// sub-request, committed only once all of them succeed. On the first
    /// sub-request that fails, the transaction is dropped without
    /// committing — discarding any writes already made by earlier
    /// sub-requests in the same batch — and `Response.index` carries the
    /// 1-based position of the failing entry (`response.Index =
    /// int32(index)` in the original); success commits once and returns the
    /// success sentinel plus the count of rows touched.
    pub async fn update(&self, request: &UpdateRequest) -> Result<Response, StateMachineError> {
        let txn = self.store.begin_txn()?;
        let mut batch = self.event_pump.batch();
        let mut updated = 0u32;

        for (i, entry) in request.entries.iter().enumerate() {
            match self.apply_one(&txn, entry, &mut batch) {
                Ok(()) => updated += 1,
                Err(e) => {
                    // Dropping `txn` here discards every write made by the
                    // sub-requests that already succeeded.
                    return Ok(Response::failed(i as i64 + 1, e.to_string()));
                }
            }
        }

        txn.commit()?;
        batch.commit().await;
        Ok(Response::update_ok(updated))
    }

    /// Applies the action policy in spec §4.4: `CREATE` only if absent,
    /// `UPDATE`/`DELETE` only if present. A mismatch is **not** an error —
    /// it is a no-op that still reports overall success with nothing
    /// touched and no event emitted (spec §8 scenario 2: re-`CREATE`ing an
    /// existing key returns `error = ""`, `index = -2`, zero items, no
    /// event). Only an ambiguous rename (more than one match) is a hard
    /// error. `entry.expire == 1` is an explicit delete signal on
    /// `CREATE`/`UPDATE`, equivalent to `action == DELETE` against the same
    /// match set (spec §3, §4.4).
    fn apply_one(
        &self,
        txn: &Txn<'_>,
        entry: &UpdateRequestEntry,
        batch: &mut EventBatch<'_>,
    ) -> Result<(), StateMachineError> {
        let matches = self.run_query(txn, &entry.query)?;
        let delete_signaled = entry.expire == Some(DELETE_SIGNAL_EXPIRE);

        if entry.rename_to.is_some() && matches.len() != 1 {
            return Err(StateMachineError::MultipleItemsUpdate);
        }

        match entry.action {
            UpdateAction::Create if !delete_signaled => {
                if !matches.is_empty() {
                    return Ok(());
                }
                let user_key = single_eq_key(&entry.query.condition)?;
                self.put_item(txn, &user_key, entry, None, batch)
            }
            UpdateAction::Update if !delete_signaled => {
                if matches.is_empty() {
                    return Ok(());
                }
                for old in matches {
                    let target_key = entry.rename_to.clone().unwrap_or_else(|| old.key.clone());
                    self.put_item(txn, &target_key, entry, Some(old), batch)?;
                }
                Ok(())
            }
            UpdateAction::Delete | UpdateAction::Create | UpdateAction::Update => {
                if matches.is_empty() {
                    return Ok(());
                }
                for old in matches {
                    let key = keycodec::new_state_machine_key(self.cluster_id, &old.key);
                    txn.delete(&key)?;
                    batch.add(None, Some(old));
                }
                Ok(())
            }
        }
    }

    fn put_item(
        &self,
        txn: &Txn<'_>,
        user_key: &[u8],
        entry: &UpdateRequestEntry,
        old: Option<Item>,
        batch: &mut EventBatch<'_>,
    ) -> Result<(), StateMachineError> {
        let value = entry.value.clone().unwrap_or_default();
        let expire = denormalize_expire_in(entry.expire.unwrap_or(u64::MAX));

        // No-op idempotence check: skip the write (and the event) entirely
        // when nothing would actually change, mirroring
        // `updateEntryOne`'s pre-write comparison in the original.
        if let Some(old) = &old {
            if old.key == user_key && old.value == value && old.expire == normalize_expire_out(expire) {
                return Ok(());
            }
        }

        if entry.rename_to.is_some() {
            if let Some(old) = &old {
                if old.key != user_key {
                    let old_key = keycodec::new_state_machine_key(self.cluster_id, &old.key);
                    txn.delete(&old_key)?;
                }
            }
        }

        let key = keycodec::new_state_machine_key(self.cluster_id, user_key);
        txn.set(&key, &value, expire)?;

        let new_item = Item {
            key: user_key.to_vec(),
            value,
            expire: normalize_expire_out(expire),
        };
        batch.add(Some(new_item), old);
        Ok(())
    }
}

fn single_eq_key(condition: &Condition) -> Result<Vec<u8>, StateMachineError> {
    if condition.eq.len() == 1 {
        Ok(condition.eq[0].clone())
    } else {
        Err(StateMachineError::QueryKeyConditionMissing)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let prefix = keycodec::state_machine_key_prefix(self.cluster_id);
        let rows = self
            .store
            .scan(&IterOptions {
                prefix: Some(prefix.clone()),
                ..Default::default()
            })
            .map_err(storage_err)?;

        let mut writer = SnapshotWriter::new(Vec::new());
        for (key, value, expire) in rows {
            let user_key = keycodec::parse_state_machine_key(self.cluster_id, &key)
                .map_err(|e| storage_err(e.clone()))?;
            writer
                .write_item(&Item {
                    key: user_key,
                    value,
                    expire: normalize_expire_out(expire),
                })
                .map_err(storage_err)?;
        }
        let data = writer.finish().map_err(storage_err)?;

        let last_applied = *self.last_applied.lock().unwrap();
        let last_membership = self.last_membership.lock().unwrap().clone();
        let snapshot_id = last_applied
            .map(|l| format!("{}-{}", l.leader_id, l.index))
            .unwrap_or_else(|| "0".to_string());

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: last_applied,
                last_membership,
                snapshot_id,
            },
            snapshot: Box::new(std::io::Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<NodeId>>, StoredMembership<NodeId, openraft::BasicNode>),
        StorageError<NodeId>,
    > {
        Ok((
            *self.last_applied.lock().unwrap(),
            self.last_membership.lock().unwrap().clone(),
        ))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + Send,
    {
        let mut responses = Vec::new();
        for entry in entries {
            *self.last_applied.lock().unwrap() = Some(*entry.get_log_id());

            match entry.payload {
                EntryPayload::Blank => responses.push(Response::update_ok(0)),
                EntryPayload::Normal(req) => {
                    let resp = self.update(&req).await.unwrap_or_else(|e| {
                        Response::failed(Response::DECODE_FAILURE, e.to_string())
                    });
                    responses.push(resp);
                }
                EntryPayload::Membership(m) => {
                    *self.last_membership.lock().unwrap() =
                        StoredMembership::new(Some(*entry.get_log_id()), m);
                    responses.push(Response::update_ok(0));
                }
            }
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<std::io::Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(std::io::Cursor::new(Vec::new())))
    }

    /// Recovers state from an installed snapshot (spec §4.4
    /// `RecoverFromSnapshot`): a single read-write transaction both deletes
    /// the partition's existing keyspace and replays every framed `Item`
    /// from `snapshot` (spec §8 scenario 6: "either all rows land or
    /// none").
    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, openraft::BasicNode>,
        snapshot: Box<std::io::Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let prefix = keycodec::state_machine_key_prefix(self.cluster_id);
        let rows = self
            .store
            .scan(&IterOptions {
                prefix: Some(prefix.clone()),
                ..Default::default()
            })
            .map_err(storage_err)?;

        let txn = self.store.begin_txn().map_err(storage_err)?;
        for (key, _, _) in rows {
            txn.delete(&key).map_err(storage_err)?;
        }

        let mut reader = SnapshotReader::new(snapshot.into_inner().as_slice());
        while let Some(item) = reader.read_item().map_err(storage_err)? {
            let key = keycodec::new_state_machine_key(self.cluster_id, &item.key);
            txn.set(&key, &item.value, denormalize_expire_in(item.expire))
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;

        *self.last_applied.lock().unwrap() = meta.last_log_id;
        *self.last_membership.lock().unwrap() = meta.last_membership.clone();
        debug!(
            cluster_id = self.cluster_id,
            node_id = self.node_id,
            "recovered state machine from snapshot"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_machine() -> (StateMachine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sm.redb");
        let store = Store::open(path.to_str().unwrap(), 64 * 1024 * 1024).unwrap();
        let pump = Arc::new(EventPump::start(1, 1, None));
        (StateMachine::new(store, 1, 1, pump), dir)
    }

    fn create_entry(key: &[u8], value: &[u8]) -> UpdateRequestEntry {
        UpdateRequestEntry {
            action: UpdateAction::Create,
            query: Query {
                condition: Condition {
                    eq: vec![key.to_vec()],
                    ..Default::default()
                },
                ..Default::default()
            },
            value: Some(value.to_vec()),
            expire: None,
            rename_to: None,
        }
    }

    #[tokio::test]
    async fn create_then_lookup() {
        let (sm, _dir) = test_machine();
        let req = UpdateRequest {
            entries: vec![create_entry(b"a", b"1")],
        };
        let resp = sm.update(&req).await.unwrap();
        assert_eq!(resp.index, Response::LOOKUP_SUCCESS);

        let lookup = sm
            .lookup(&Query {
                condition: Condition {
                    eq: vec![b"a".to_vec()],
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
        match lookup.data.unwrap() {
            ResponseData::Items(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].value, b"1");
            }
            _ => panic!("expected items"),
        }
    }

    /// Spec §8 scenario 2: re-`CREATE`ing an existing key (even with a
    /// different value) is a no-op success, not an error — no event fires
    /// and the stored value is untouched.
    #[tokio::test]
    async fn create_twice_is_a_no_op_success() {
        let (sm, _dir) = test_machine();
        sm.update(&UpdateRequest { entries: vec![create_entry(b"a", b"1")] })
            .await
            .unwrap();
        let resp = sm
            .update(&UpdateRequest { entries: vec![create_entry(b"a", b"2")] })
            .await
            .unwrap();
        assert!(resp.error.is_none());
        assert_eq!(resp.index, Response::LOOKUP_SUCCESS);

        let lookup = sm
            .lookup(&Query {
                condition: Condition { eq: vec![b"a".to_vec()], ..Default::default() },
                ..Default::default()
            })
            .unwrap();
        match lookup.data.unwrap() {
            ResponseData::Items(items) => assert_eq!(items[0].value, b"1"),
            _ => panic!("expected items"),
        }
    }

    /// `UPDATE` of a key that does not exist is likewise a no-op success
    /// per the action policy in spec §4.4.
    #[tokio::test]
    async fn update_nonexistent_is_a_no_op_success() {
        let (sm, _dir) = test_machine();
        let mut entry = create_entry(b"a", b"1");
        entry.action = UpdateAction::Update;
        let resp = sm.update(&UpdateRequest { entries: vec![entry] }).await.unwrap();
        assert!(resp.error.is_none());

        let lookup = sm
            .lookup(&Query {
                condition: Condition { eq: vec![b"a".to_vec()], ..Default::default() },
                ..Default::default()
            })
            .unwrap();
        match lookup.data.unwrap() {
            ResponseData::Items(items) => assert!(items.is_empty()),
            _ => panic!("expected items"),
        }
    }

    #[tokio::test]
    async fn delete_removes_item() {
        let (sm, _dir) = test_machine();
        sm.update(&UpdateRequest { entries: vec![create_entry(b"a", b"1")] })
            .await
            .unwrap();

        let mut del = create_entry(b"a", b"1");
        del.action = UpdateAction::Delete;
        let resp = sm.update(&UpdateRequest { entries: vec![del] }).await.unwrap();
        assert!(resp.error.is_none());

        let lookup = sm
            .lookup(&Query {
                condition: Condition { eq: vec![b"a".to_vec()], ..Default::default() },
                ..Default::default()
            })
            .unwrap();
        match lookup.data.unwrap() {
            ResponseData::Items(items) => assert!(items.is_empty()),
            _ => panic!("expected items"),
        }
    }

    #[tokio::test]
    async fn rename_requires_single_match() {
        let (sm, _dir) = test_machine();
        sm.update(&UpdateRequest { entries: vec![create_entry(b"a", b"1")] })
            .await
            .unwrap();
        sm.update(&UpdateRequest { entries: vec![create_entry(b"b", b"2")] })
            .await
            .unwrap();

        // Matching both keys via a prefix + rename_to should fail: more than
        // one match.
        let entry = UpdateRequestEntry {
            action: UpdateAction::Update,
            query: Query {
                condition: Condition {
                    prefix: Some(Vec::new()),
                    ..Default::default()
                },
                ..Default::default()
            },
            value: None,
            expire: None,
            rename_to: Some(b"c".to_vec()),
        };
        let resp = sm.update(&UpdateRequest { entries: vec![entry] }).await.unwrap();
        assert!(resp.error.is_some());
    }

    #[test]
    fn ne_condition_excludes_listed_keys() {
        let condition = Condition {
            ne: vec![b"skip".to_vec()],
            ..Default::default()
        };
        assert!(!match_condition(&condition, b"skip"));
        assert!(match_condition(&condition, b"keep"));
    }

    #[test]
    fn eq_and_ne_are_evaluated_independently() {
        // Regression guard for the corrected bug: `ne` must never be checked
        // against `eq`'s contents.
        let condition = Condition {
            eq: vec![b"a".to_vec()],
            ne: vec![b"b".to_vec()],
            ..Default::default()
        };
        assert!(match_condition(&condition, b"a"));
        assert!(!match_condition(&condition, b"b"));
    }
}
