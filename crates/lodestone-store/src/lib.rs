//! # lodestone-store: the transactional system keyspace
//!
//! The distributor's only shared resource is an ordered, transactional
//! key-value store holding system metadata: the shard map, data-move
//! records, audit rows, tenant indexes, and the move-keys lock. This crate
//! provides that collaborator as an in-process store with the contract the
//! control plane relies on:
//!
//! - snapshot reads at a read version,
//! - buffered writes with read-your-writes,
//! - optimistic conflict detection at commit (serializable),
//! - a retry loop ([`run_transaction`]) that absorbs transient commit
//!   failures,
//! - key watches that fire when a later commit modifies a key.
//!
//! Transaction bodies are synchronous; suspension happens between
//! transactions (retry backoff, watches), never inside one. Mutators that
//! can observe [`StoreError::CommitUnknown`] must be idempotent.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use lodestone_types::KeyRange;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

pub mod keys;

mod error;

pub use error::{Result, StoreError};

/// How many committed generations of mutation spans are retained for
/// conflict checking. Transactions older than the window abort with
/// `TransactionTooOld`.
const CONFLICT_WINDOW: usize = 1024;

/// Initial retry backoff for [`run_transaction`].
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(2);

/// Backoff cap for [`run_transaction`].
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(500);

// ============================================================================
// Store
// ============================================================================

struct CommittedMutation {
    version: u64,
    spans: Vec<KeyRange>,
}

struct StoreInner {
    data: BTreeMap<Bytes, Bytes>,
    /// Version of the most recent commit.
    version: u64,
    /// Recent commits, newest last, for read-set validation.
    log: VecDeque<CommittedMutation>,
    /// Version of the oldest entry still in `log`.
    oldest_logged: u64,
    /// Per-key change broadcasts backing [`SystemStore::watch`].
    watches: HashMap<Bytes, watch::Sender<u64>>,
    /// Test hook: report the next commit as lost in transit after applying it.
    fail_next_commit_unknown: bool,
}

/// Shared handle to the system keyspace.
///
/// Cloning is cheap; all clones address the same store.
#[derive(Clone)]
pub struct SystemStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for SystemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                data: BTreeMap::new(),
                version: 0,
                log: VecDeque::new(),
                oldest_logged: 1,
                watches: HashMap::new(),
                fail_next_commit_unknown: false,
            })),
        }
    }

    /// Begins a transaction at the current read version.
    pub fn begin(&self) -> Transaction {
        let inner = self.inner.lock().expect("store poisoned");
        Transaction {
            store: self.clone(),
            read_version: inner.version,
            read_spans: Vec::new(),
            sets: BTreeMap::new(),
            range_clears: Vec::new(),
            versionstamp_keys: Vec::new(),
        }
    }

    /// Subscribes to changes of `key`. The receiver yields the commit
    /// version of each subsequent modification; a value observed at
    /// subscription time reflects the key's last change so far.
    pub fn watch(&self, key: impl Into<Bytes>) -> watch::Receiver<u64> {
        let key = key.into();
        let mut inner = self.inner.lock().expect("store poisoned");
        let version = inner.version;
        inner
            .watches
            .entry(key)
            .or_insert_with(|| watch::channel(version).0)
            .subscribe()
    }

    /// Current commit version.
    pub fn version(&self) -> u64 {
        self.inner.lock().expect("store poisoned").version
    }

    /// Test hook: the next commit applies but reports [`StoreError::CommitUnknown`].
    pub fn fail_next_commit_with_unknown(&self) {
        self.inner.lock().expect("store poisoned").fail_next_commit_unknown = true;
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// An optimistic transaction over the system keyspace.
///
/// Reads record conflict spans; `commit` validates that no other commit has
/// touched a read span since this transaction's read version, then applies
/// all buffered mutations atomically.
pub struct Transaction {
    store: SystemStore,
    read_version: u64,
    read_spans: Vec<KeyRange>,
    /// Buffered point writes; `None` clears the key.
    sets: BTreeMap<Bytes, Option<Bytes>>,
    range_clears: Vec<KeyRange>,
    /// Keys whose value is replaced with the commit version at commit time.
    versionstamp_keys: Vec<Bytes>,
}

fn point_span(key: &Bytes) -> KeyRange {
    let mut end = Vec::with_capacity(key.len() + 1);
    end.extend_from_slice(key);
    end.push(0);
    KeyRange::new(key.clone(), end)
}

impl Transaction {
    /// Reads a key, observing this transaction's own writes first.
    pub fn get(&mut self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let key = key.into();
        self.read_spans.push(point_span(&key));
        Ok(self.read_overlay(&key))
    }

    /// Reads up to `limit` key-value pairs in `range`, ascending.
    pub fn get_range(&mut self, range: &KeyRange, limit: usize) -> Result<Vec<(Bytes, Bytes)>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        self.read_spans.push(range.clone());
        let inner = self.store.inner.lock().expect("store poisoned");
        let mut out = Vec::new();
        // Merge the committed snapshot with this transaction's overlay.
        for (k, v) in inner.data.range(range.begin.clone()..range.end.clone()) {
            if self.locally_cleared(k) {
                continue;
            }
            out.push((k.clone(), v.clone()));
        }
        drop(inner);
        for (k, v) in self.sets.range(range.begin.clone()..range.end.clone()) {
            if let Some(v) = v {
                match out.binary_search_by(|(ok, _)| ok.cmp(k)) {
                    Ok(i) => out[i].1 = v.clone(),
                    Err(i) => out.insert(i, (k.clone(), v.clone())),
                }
            }
        }
        out.truncate(limit);
        Ok(out)
    }

    /// True if `range` holds no data visible to this transaction.
    pub fn range_is_empty(&mut self, range: &KeyRange) -> Result<bool> {
        Ok(self.get_range(range, 1)?.is_empty())
    }

    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.sets.insert(key.into(), Some(value.into()));
    }

    pub fn clear(&mut self, key: impl Into<Bytes>) {
        self.sets.insert(key.into(), None);
    }

    pub fn clear_range(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        // Drop buffered writes the clear supersedes.
        let doomed: Vec<Bytes> = self
            .sets
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            self.sets.remove(&k);
        }
        self.range_clears.push(range.clone());
    }

    /// Writes the commit version (big-endian `u64`) to `key` at commit time.
    pub fn set_versionstamp(&mut self, key: impl Into<Bytes>) {
        self.versionstamp_keys.push(key.into());
    }

    /// Adds an explicit read-conflict span without reading.
    pub fn add_read_conflict_range(&mut self, range: &KeyRange) {
        self.read_spans.push(range.clone());
    }

    /// Reads and postcard-decodes a key.
    pub fn get_typed<T: DeserializeOwned>(&mut self, key: impl Into<Bytes>) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(
                postcard::from_bytes(&raw).map_err(|e| StoreError::Codec(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Postcard-encodes and writes a value.
    pub fn set_typed<T: Serialize>(&mut self, key: impl Into<Bytes>, value: &T) -> Result<()> {
        let raw = postcard::to_allocvec(value).map_err(|e| StoreError::Codec(e.to_string()))?;
        self.set(key, raw);
        Ok(())
    }

    /// Validates the read set and applies buffered mutations atomically.
    ///
    /// Returns the commit version.
    pub fn commit(self) -> Result<u64> {
        let store = self.store.clone();
        let mut inner = store.inner.lock().expect("store poisoned");

        if self.read_version < inner.oldest_logged.saturating_sub(1) {
            return Err(StoreError::TransactionTooOld);
        }
        for committed in &inner.log {
            if committed.version <= self.read_version {
                continue;
            }
            for span in &committed.spans {
                if self.read_spans.iter().any(|r| r.intersects(span)) {
                    return Err(StoreError::NotCommitted);
                }
            }
        }

        let version = inner.version + 1;
        inner.version = version;

        let mut spans = Vec::new();
        let mut touched: Vec<Bytes> = Vec::new();

        for range in &self.range_clears {
            let doomed: Vec<Bytes> = inner
                .data
                .range(range.begin.clone()..range.end.clone())
                .map(|(k, _)| k.clone())
                .collect();
            for k in doomed {
                inner.data.remove(&k);
                touched.push(k);
            }
            spans.push(range.clone());
        }
        for (key, value) in self.sets {
            spans.push(point_span(&key));
            match value {
                Some(v) => {
                    inner.data.insert(key.clone(), v);
                }
                None => {
                    inner.data.remove(&key);
                }
            }
            touched.push(key);
        }
        for key in self.versionstamp_keys {
            spans.push(point_span(&key));
            inner
                .data
                .insert(key.clone(), Bytes::copy_from_slice(&version.to_be_bytes()));
            touched.push(key);
        }

        inner.log.push_back(CommittedMutation { version, spans });
        while inner.log.len() > CONFLICT_WINDOW {
            let popped = inner.log.pop_front().expect("log non-empty");
            inner.oldest_logged = popped.version + 1;
        }

        for key in touched {
            if let Some(tx) = inner.watches.get(&key) {
                // Ignore lagging receivers; a dropped subscription is fine.
                let _ = tx.send(version);
            }
        }

        if inner.fail_next_commit_unknown {
            inner.fail_next_commit_unknown = false;
            return Err(StoreError::CommitUnknown);
        }
        Ok(version)
    }

    fn locally_cleared(&self, key: &Bytes) -> bool {
        self.range_clears.iter().any(|r| r.contains_key(key))
            || matches!(self.sets.get(key), Some(None))
    }

    fn read_overlay(&self, key: &Bytes) -> Option<Bytes> {
        if let Some(buffered) = self.sets.get(key) {
            return buffered.clone();
        }
        if self.range_clears.iter().any(|r| r.contains_key(key)) {
            return None;
        }
        let inner = self.store.inner.lock().expect("store poisoned");
        inner.data.get(key).cloned()
    }
}

// ============================================================================
// Retry Loop
// ============================================================================

/// Error types usable in a [`run_transaction`] body.
///
/// The retry loop needs to distinguish transient store failures wrapped in a
/// domain error from definitive domain errors.
pub trait TransactionalError: From<StoreError> {
    /// The transient store error wrapped by this error, if any.
    fn retryable_store_error(&self) -> Option<&StoreError>;
}

impl TransactionalError for StoreError {
    fn retryable_store_error(&self) -> Option<&StoreError> {
        self.is_retryable().then_some(self)
    }
}

/// Runs `body` inside a transaction, retrying on transient commit failures
/// with capped exponential backoff.
///
/// The body may run multiple times and, after [`StoreError::CommitUnknown`],
/// may re-run against a state in which its previous attempt already applied.
/// Mutators must therefore be idempotent. Non-retryable errors surface to
/// the caller unchanged.
pub async fn run_transaction<T, E, F>(store: &SystemStore, mut body: F) -> std::result::Result<T, E>
where
    E: TransactionalError,
    F: FnMut(&mut Transaction) -> std::result::Result<T, E>,
{
    let mut backoff = RETRY_BACKOFF_INITIAL;
    loop {
        let mut tx = store.begin();
        let result = body(&mut tx).and_then(|out| tx.commit().map(|_| out).map_err(E::from));
        match result {
            Ok(out) => return Ok(out),
            Err(err) => {
                if let Some(transient) = err.retryable_store_error() {
                    tracing::trace!(error = %transient, "transaction retry");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                } else {
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
