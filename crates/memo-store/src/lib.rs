//! The Store contract (spec §4.2, §6).
//!
//! A remote, possibly-contended key-value store. Only the conditional
//! primitives below need be linearizable *per key*; there is no
//! cross-key transaction requirement. Concrete adapters (Redis, DynamoDB,
//! in-memory) are out of scope here — see `memo-testkit` for the
//! in-process stand-in used by this workspace's own tests.

use async_trait::async_trait;

/// The three logical namespaces a `Call`'s memo key is stored under, plus
/// the disjoint counter namespace used by the spawn-limit guard.
pub mod namespace {
    pub const CALL: &str = "call";
    pub const VALUE: &str = "value";
    pub const PENDING_RETURNS: &str = "pending_returns";
    pub const COUNT: &str = "count";
}

/// A typed `(namespace, id)` pair, rendered as `namespace/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    pub fn new(namespace: &str, id: &str) -> Self {
        Self(format!("{namespace}/{id}"))
    }

    pub fn call(memo_key: &str) -> Self {
        Self::new(namespace::CALL, memo_key)
    }

    pub fn value(memo_key: &str) -> Self {
        Self::new(namespace::VALUE, memo_key)
    }

    pub fn pending_returns(memo_key: &str) -> Self {
        Self::new(namespace::PENDING_RETURNS, memo_key)
    }

    pub fn count(root_id: &str) -> Self {
        Self::new(namespace::COUNT, root_id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key has no value (unconditional `get`).
    #[error("key not found: {0}")]
    NotFound(Key),

    /// A conditional write's expectation about the current value did not
    /// hold. Always transient from the caller's point of view — retried
    /// by `Memory::with_cas`.
    #[error("compare mismatch on {0}")]
    CompareMismatch(Key),

    /// Adapter-level failure (network, serialization, backend outage).
    /// The contract itself never raises this; a real adapter does.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A remote key-value store, linearizable per key for the conditional
/// operations. Keys are opaque UTF-8 strings built via [`Key`].
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Unconditional existence check.
    async fn has(&self, key: &Key) -> Result<bool, StoreError>;

    /// Unconditional read. `Err(StoreError::NotFound)` if absent.
    async fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError>;

    /// Unconditional write, always succeeds (barring backend failure).
    async fn set(&self, key: &Key, value: Vec<u8>) -> Result<(), StoreError>;

    /// Unconditional delete. A delete of an absent key is not an error.
    async fn delete(&self, key: &Key) -> Result<(), StoreError>;

    /// Succeeds iff `key` is currently absent, else `CompareMismatch`.
    async fn set_new_value(&self, key: &Key, value: Vec<u8>) -> Result<(), StoreError>;

    /// Succeeds iff the current value equals `expected`, else
    /// `CompareMismatch`.
    async fn compare_and_set(
        &self,
        key: &Key,
        new: Vec<u8>,
        expected: &[u8],
    ) -> Result<(), StoreError>;

    /// Succeeds iff the current value equals `expected`, else
    /// `CompareMismatch`.
    async fn compare_and_delete(&self, key: &Key, expected: &[u8]) -> Result<(), StoreError>;

    /// Atomic increment of a counter key (a namespace disjoint from
    /// `call`/`value`/`pending_returns`), returning the post-increment
    /// value.
    async fn incr(&self, counter_key: &Key) -> Result<i64, StoreError>;
}
