//! The engine's fault taxonomy.
//!
//! `Defer` is deliberately absent from this enum — per the redesign away
//! from exceptions-as-control-flow, a deferral is a plain return value
//! ([`crate::task::Outcome::Missing`] / [`crate::task::Defer`]), never an
//! `Err` a caller has to filter out. Likewise `ValueNotFound` and
//! `KeyAlreadyExists` never reach a caller of this crate: the former is
//! absorbed into `Outcome::Missing` at the point `Task::invoke` reads the
//! cache, the latter is swallowed inside the worker loop's success path
//! (a concurrent duplicate execution losing the race to persist its
//! result is expected, not exceptional).

use memo_codec::CodecError;
use memo_queue::QueueError;
use memo_runtime::RuntimeError;
use memo_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A Scheduler/Worker operation was attempted before the engine had
    /// a Store and Queue wired up.
    #[error("engine used before setup")]
    NotSetup,

    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("task name must not be empty")]
    InvalidTaskName,

    #[error("no task registered under name '{0}'")]
    TaskNotFound(String),

    /// Memory's bounded CAS retry loop gave up — pathological contention.
    #[error("exceeded CAS retry limit")]
    CasRetryLimit,

    /// The queue has been durably closed; the worker loop's caller sees
    /// this only if it chooses to propagate rather than exit quietly.
    #[error("queue is closed")]
    QueueClosed,

    /// `putJob` tripped the per-root spawn counter. The current worker
    /// turn aborts; all durable state up to this point is intact, so
    /// raising the configured limit and re-running resumes cleanly.
    #[error("spawn limit exceeded for root workflow")]
    SpawnLimit,

    /// A second concurrent `Worker::run` was attempted against the same
    /// engine instance.
    #[error("a worker is already running for this engine")]
    WorkerAlreadyRunning,

    /// A queue message body was not in `rootId/memoKey` form.
    #[error("malformed queue message: {0:?}")]
    MalformedMessage(String),

    #[error("failed to convert task arguments or return value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Every `RuntimeError` not given its own variant above (`Store`,
    /// `Codec`, `RecordEncoding`) folds in here. Call sites that need to
    /// treat `RuntimeError::KeyAlreadyExists` as a no-op must match on
    /// the `RuntimeError` itself *before* converting — once it becomes
    /// an `EngineError` that distinction is gone.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
