//! The Queue contract (spec §4.3, §6).
//!
//! A point-to-point message channel of opaque UTF-8 strings, here used to
//! carry `rootId/memoKey` bodies. Delivery is at-least-once; reorders are
//! tolerated — the pending-returns scheduling gate and memoization absorb
//! duplicates. Concrete adapters (Redis `BLPOP`-backed, etc.) are out of
//! scope; see `memo-testkit` for the in-process stand-in used by tests.

use async_trait::async_trait;
use std::time::Duration;

/// Default bounded wait for a blocking receive before returning `Empty`.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The bounded wait elapsed with no message available. Transient —
    /// the worker loop re-polls.
    #[error("queue poll timed out with no message")]
    Empty,

    /// The queue has been durably closed; no further messages will ever
    /// arrive. Terminal — the worker loop exits cleanly.
    #[error("queue is closed")]
    Closed,

    /// Adapter-level failure.
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Observability snapshot; never used for control flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub length: usize,
}

/// A multi-producer, multi-consumer message channel. A `get_message`
/// should deliver each enqueued body to exactly one consumer under normal
/// operation; duplicates are tolerated but not desired.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Enqueue a message body.
    async fn put_message(&self, body: String) -> Result<(), QueueError>;

    /// Blocking receive with an implementation-chosen bounded wait.
    /// Returns `Err(QueueError::Empty)` if the wait elapses with nothing
    /// to receive, `Err(QueueError::Closed)` once the queue is closed and
    /// drained.
    async fn get_message(&self) -> Result<String, QueueError>;

    /// Observability only — never used for control flow.
    async fn get_info(&self) -> QueueInfo;

    /// Durable signal that no further messages will be produced. Pending
    /// and future receivers unblock with `Closed`.
    async fn close(&self);
}
