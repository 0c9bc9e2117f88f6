//! Memory: a typed façade over [`Store`] for the engine's three logical
//! namespaces (`call`, `value`, `pending_returns`), plus the bounded CAS
//! retry loop every conditional write runs under (spec §4.4).

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use memo_codec::{Call, Codec, CodecError};
use memo_store::{Key, Store, StoreError};

/// How many times `with_cas` retries a `CompareMismatch` before giving up.
pub const DEFAULT_CAS_RETRY_LIMIT: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("call/return codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("pending_returns record encoding error: {0}")]
    RecordEncoding(String),

    /// `setValue` lost a race to a concurrent duplicate execution of the
    /// same call. Not a failure — the caller discards its own result and
    /// keeps the value that won.
    #[error("value already exists for this memo key")]
    KeyAlreadyExists,

    /// `with_cas` exhausted its retry budget — pathological contention.
    #[error("exceeded CAS retry limit")]
    CasRetryLimit,

    /// The `schedule_job` callback passed to `add_pending_return` failed.
    /// The callback runs at the engine layer (it can raise `SpawnLimit`,
    /// a queue fault, etc. — concerns this crate has no vocabulary for),
    /// so the structured error is stashed by the caller and this variant
    /// only marks *that* it happened, terminating the retry loop without
    /// being mistaken for a retryable `CompareMismatch`.
    #[error("schedule_job callback failed")]
    ScheduleFailed,

    /// The `wake` callback passed to `with_pending_returns_remove` failed
    /// for at least one parent. Same stash-and-signal shape as
    /// `ScheduleFailed`: the real error lives at the engine layer, this
    /// variant only aborts the CAS loop *before* the `pending_returns`
    /// record is deleted, so a parent that lost its re-enqueue is not
    /// also stripped of the bookkeeping that would let it be recovered.
    #[error("wake callback failed")]
    WakeFailed,
}

/// The persisted `pending_returns` record: the set of parent memo keys
/// waiting on a child, plus the "has a queue message already been sent
/// for this child" flag. `returns` is a `BTreeSet` so re-encoding is
/// always byte-canonical ahead of a CAS compare (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingReturnsRecord {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub returns: BTreeSet<String>,
}

impl PendingReturnsRecord {
    fn encode(&self) -> Result<Vec<u8>, RuntimeError> {
        bincode::serialize(self).map_err(|e| RuntimeError::RecordEncoding(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, RuntimeError> {
        bincode::deserialize(bytes).map_err(|e| RuntimeError::RecordEncoding(e.to_string()))
    }
}

/// The persisted `call` record: `{taskName, callBytes}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CallRecord {
    task_name: String,
    call_bytes: Vec<u8>,
}

/// Typed façade over a [`Store`], scoped to the engine's three namespaces.
pub struct Memory {
    store: Arc<dyn Store>,
    codec: Arc<dyn Codec>,
    cas_retry_limit: u32,
}

impl Memory {
    pub fn new(store: Arc<dyn Store>, codec: Arc<dyn Codec>) -> Self {
        Self {
            store,
            codec,
            cas_retry_limit: DEFAULT_CAS_RETRY_LIMIT,
        }
    }

    pub fn with_cas_retry_limit(mut self, limit: u32) -> Self {
        self.cas_retry_limit = limit;
        self
    }

    /// Delegates to the codec to build a `Call` from `(taskName, args)`.
    pub fn make_call(&self, task_name: &str, args: serde_json::Value) -> Call {
        self.codec.create_call(task_name, args)
    }

    pub async fn has_call(&self, call: &Call) -> Result<bool, RuntimeError> {
        Ok(self.store.has(&Key::call(&call.memo_key)).await?)
    }

    /// Idempotent: the record is a pure function of the memo key, so an
    /// unconditional overwrite is always a no-op in practice.
    pub async fn set_call(&self, call: &Call) -> Result<(), RuntimeError> {
        let call_bytes = self.codec.encode_value(&call.args)?;
        let record = CallRecord {
            task_name: call.task_name.clone(),
            call_bytes,
        };
        let bytes =
            bincode::serialize(&record).map_err(|e| RuntimeError::RecordEncoding(e.to_string()))?;
        self.store.set(&Key::call(&call.memo_key), bytes).await?;
        Ok(())
    }

    /// Loads and splits a stored call record into `(taskName, payload)`.
    pub async fn get_call_bytes(&self, memo_key: &str) -> Result<(String, Vec<u8>), RuntimeError> {
        let bytes = self.store.get(&Key::call(memo_key)).await?;
        let record: CallRecord =
            bincode::deserialize(&bytes).map_err(|e| RuntimeError::RecordEncoding(e.to_string()))?;
        Ok((record.task_name, record.call_bytes))
    }

    /// Reads the cached return for `call`, if any.
    pub async fn get_value(&self, memo_key: &str) -> Result<Vec<u8>, RuntimeError> {
        Ok(self.store.get(&Key::value(memo_key)).await?)
    }

    /// Atomically bumps the per-root spawn counter, returning the
    /// post-increment value. A disjoint namespace from `call`/`value`/
    /// `pending_returns` (spec §4.2).
    pub async fn incr_spawn_count(&self, root_id: &str) -> Result<i64, RuntimeError> {
        Ok(self.store.incr(&Key::count(root_id)).await?)
    }

    /// Stores the return bytes for a freshly-completed call.
    ///
    /// `setNewValue` under the `value` namespace; a `CompareMismatch`
    /// means a concurrent worker ran the same call and got there first —
    /// that is reported as [`RuntimeError::KeyAlreadyExists`], which the
    /// worker loop swallows rather than retrying (this is *not* routed
    /// through `with_cas`: the race is resolved by discarding the loser,
    /// not by retrying the write).
    pub async fn set_value(&self, memo_key: &str, bytes: Vec<u8>) -> Result<(), RuntimeError> {
        match self.store.set_new_value(&Key::value(memo_key), bytes).await {
            Ok(()) => Ok(()),
            Err(StoreError::CompareMismatch(_)) => Err(RuntimeError::KeyAlreadyExists),
            Err(e) => Err(RuntimeError::Store(e)),
        }
    }

    /// Runs `op` up to `CAS_RETRY_LIMIT` times, retrying on
    /// `CompareMismatch` and propagating every other error immediately.
    pub async fn with_cas<F, Fut, T>(&self, mut op: F) -> Result<T, RuntimeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        for attempt in 0..self.cas_retry_limit {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RuntimeError::Store(StoreError::CompareMismatch(key))) => {
                    trace!(%key, attempt, "CAS mismatch, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(RuntimeError::CasRetryLimit)
    }

    /// Registers `parent_key` as a waiter on `child_memo_key` (spec §4.4.1).
    ///
    /// `schedule_job` enqueues the *child's* queue message; it runs at
    /// most once per completion cycle, the first time `scheduled_at` is
    /// observed empty.
    ///
    /// Returns `true` if, by the time registration finished, the child's
    /// value was already present — the caller must then re-enqueue the
    /// parent directly rather than count on a wakeup that already
    /// happened (the stranded-late-waiter edge case from spec §9).
    pub async fn add_pending_return<F, Fut>(
        &self,
        child_memo_key: &str,
        parent_key: &str,
        schedule_job: F,
    ) -> Result<bool, RuntimeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), RuntimeError>>,
    {
        let key = Key::pending_returns(child_memo_key);
        self.with_cas(|| async {
            let (mut record, baseline): (PendingReturnsRecord, Option<Vec<u8>>) =
                match self.store.get(&key).await {
                    Ok(bytes) => (PendingReturnsRecord::decode(&bytes)?, Some(bytes)),
                    Err(StoreError::NotFound(_)) => (PendingReturnsRecord::default(), None),
                    Err(e) => return Err(RuntimeError::Store(e)),
                };

            let baseline = match baseline {
                Some(bytes) => bytes,
                None => {
                    record.returns.insert(parent_key.to_string());
                    let bytes = record.encode()?;
                    self.store.set_new_value(&key, bytes.clone()).await?;
                    bytes
                }
            };

            let mut should_store_again = false;
            if !record.returns.contains(parent_key) {
                record.returns.insert(parent_key.to_string());
                should_store_again = true;
            }

            if record.scheduled_at.is_none() {
                schedule_job().await?;
                record.scheduled_at = Some(Utc::now());
                should_store_again = true;
            }

            if should_store_again {
                let new_bytes = record.encode()?;
                self.store
                    .compare_and_set(&key, new_bytes, &baseline)
                    .await?;
            }

            Ok(())
        })
        .await?;

        // §9 edge case: a late waiter may register after the child has
        // already completed and its pending_returns record been deleted
        // and recreated out from under us. Check directly rather than
        // trust that the child's (re-)execution will drain this record.
        let child_already_done = self
            .store
            .has(&Key::value(child_memo_key))
            .await
            .unwrap_or(false);
        if child_already_done {
            debug!(child_memo_key, parent_key, "child already complete, waking parent directly");
        }
        Ok(child_already_done)
    }

    /// Atomically hands off and deletes the waiter set for a just-completed
    /// child (spec §4.4.2). `wake` is invoked with the *delta* of
    /// newly-observed parent keys on every attempt — parents already
    /// woken on an earlier, CAS-losing attempt are never handed to `wake`
    /// again.
    ///
    /// If `wake` fails, the `pending_returns` record is left in place —
    /// `compare_and_delete` is never reached — so the un-woken parents'
    /// recovery bookkeeping survives and the error propagates to the
    /// caller instead of being discarded.
    pub async fn with_pending_returns_remove<F, Fut>(
        &self,
        child_memo_key: &str,
        mut wake: F,
    ) -> Result<(), RuntimeError>
    where
        F: FnMut(BTreeSet<String>) -> Fut,
        Fut: Future<Output = Result<(), RuntimeError>>,
    {
        let key = Key::pending_returns(child_memo_key);
        let mut handled: BTreeSet<String> = BTreeSet::new();

        for attempt in 0..self.cas_retry_limit {
            match self.store.get(&key).await {
                Err(StoreError::NotFound(_)) => {
                    wake(BTreeSet::new()).await?;
                    return Ok(());
                }
                Err(e) => return Err(RuntimeError::Store(e)),
                Ok(bytes) => {
                    let record = PendingReturnsRecord::decode(&bytes)?;
                    let fresh: BTreeSet<String> =
                        record.returns.difference(&handled).cloned().collect();
                    wake(fresh.clone()).await?;
                    match self.store.compare_and_delete(&key, &bytes).await {
                        Ok(()) => return Ok(()),
                        Err(StoreError::CompareMismatch(_)) => {
                            trace!(child_memo_key, attempt, "pending_returns changed during removal, retrying");
                            handled.extend(fresh);
                            continue;
                        }
                        Err(e) => return Err(RuntimeError::Store(e)),
                    }
                }
            }
        }
        Err(RuntimeError::CasRetryLimit)
    }
}
