//! The worker loop ("Wrrrker" in the source) — the heart of the
//! concurrency protocol (spec §4.7).

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use memo_queue::QueueError;

use crate::context::ExecutionContext;
use crate::engine::{split_message, Engine};
use crate::error::EngineError;
use crate::task::TaskError;

/// Drains `engine`'s queue, executing one dequeued call at a time.
/// Acquires the engine's worker singleton for its lifetime — a second
/// concurrent `Worker` against the same `Engine` fails immediately with
/// `WorkerAlreadyRunning`.
pub struct Worker {
    engine: Arc<Engine>,
}

impl Worker {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Runs until the queue closes, a fatal error occurs, or `shutdown`
    /// signals true. Termination semantics: the engine has no intrinsic
    /// "workflow complete" signal — a workflow is done when its root
    /// value exists; callers that need early shutdown drive it through
    /// `shutdown` or by closing the queue from within a task body.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let _slot = self.engine.acquire_worker_slot()?;
        info!("worker loop started");

        loop {
            if *shutdown.borrow() {
                info!("worker loop shutting down (signal received)");
                return Ok(());
            }

            tokio::select! {
                message = self.engine.queue().get_message() => {
                    match message {
                        Ok(body) => {
                            if let Err(e) = self.process_one(&body).await {
                                error!(error = %e, "worker loop terminating on unrecoverable error");
                                return Err(e);
                            }
                        }
                        Err(QueueError::Empty) => {
                            debug!("queue poll empty, continuing");
                            continue;
                        }
                        Err(QueueError::Closed) => {
                            info!("queue closed, worker loop exiting cleanly");
                            return Ok(());
                        }
                        Err(QueueError::Backend(msg)) => {
                            error!(backend_error = %msg, "queue backend error, worker loop terminating");
                            return Err(EngineError::Queue(QueueError::Backend(msg)));
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("worker loop shutting down (signal received)");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Runs until the queue closes or a fatal error occurs, with no
    /// shutdown channel — for callers that only ever terminate via
    /// `QueueClosed` (e.g. most of §8's end-to-end scenarios).
    pub async fn run_until_closed(&self) -> Result<(), EngineError> {
        let (_tx, rx) = watch::channel(false);
        self.run(rx).await
    }

    async fn process_one(&self, message: &str) -> Result<(), EngineError> {
        let (root_id, memo_key) = split_message(message)?;
        debug!(root_id = %root_id, memo_key = %memo_key, "dequeued message");

        let (task_name, payload_bytes) = self.engine.memory().get_call_bytes(&memo_key).await?;
        let erased = self.engine.lookup(&task_name)?;
        let args_value = self.engine.codec().decode_value(&payload_bytes)?;

        let ctx = ExecutionContext::Worker {
            engine: self.engine.clone(),
            root_id: root_id.clone(),
            message: message.to_string(),
        };

        match erased(args_value, ctx).await {
            Ok(value) => self.handle_success(&memo_key, value).await,
            Err(TaskError::Defer(defer)) => self.handle_defer(&root_id, message, defer).await,
            Err(TaskError::Failed(e)) => Err(e),
        }
    }

    async fn handle_success(
        &self,
        memo_key: &str,
        value: serde_json::Value,
    ) -> Result<(), EngineError> {
        let bytes = self.engine.codec().encode_value(&value)?;
        match self.engine.memory().set_value(memo_key, bytes).await {
            Ok(()) => {}
            Err(memo_runtime::RuntimeError::KeyAlreadyExists) => {
                debug!(memo_key, "value already set by a concurrent duplicate execution, discarding");
            }
            Err(e) => return Err(e.into()),
        }

        info!(memo_key, "call completed, waking waiting parents");
        let engine = self.engine.clone();
        // A failed re-enqueue (spawn limit tripped, Store/Queue fault) is
        // fatal for this turn per spec §7 — it must abort the wake before
        // `with_pending_returns_remove` deletes the pending_returns record,
        // or the un-woken parent's only recovery path is lost with it. The
        // real `EngineError` is stashed here and signaled out through
        // `RuntimeError::WakeFailed`, the same shape `schedule_call_nested`
        // uses for `ScheduleFailed`.
        let captured_error: Arc<std::sync::Mutex<Option<EngineError>>> =
            Arc::new(std::sync::Mutex::new(None));
        let captured_for_closure = captured_error.clone();
        let result = self
            .engine
            .memory()
            .with_pending_returns_remove(memo_key, move |parents| {
                let engine = engine.clone();
                let captured_error = captured_for_closure.clone();
                async move {
                    for parent_message in parents {
                        let (parent_root, parent_memo_key) = match split_message(&parent_message) {
                            Ok(parts) => parts,
                            Err(e) => {
                                *captured_error.lock().unwrap() = Some(e);
                                return Err(memo_runtime::RuntimeError::WakeFailed);
                            }
                        };
                        if let Err(e) = engine.put_job(&parent_memo_key, &parent_root).await {
                            *captured_error.lock().unwrap() = Some(e);
                            return Err(memo_runtime::RuntimeError::WakeFailed);
                        }
                    }
                    Ok(())
                }
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(memo_runtime::RuntimeError::WakeFailed) => Err(captured_error
                .lock()
                .unwrap()
                .take()
                .expect("WakeFailed always paired with a captured EngineError")),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_defer(
        &self,
        root_id: &str,
        parent_message: &str,
        defer: crate::task::Defer,
    ) -> Result<(), EngineError> {
        debug!(root_id, children = defer.calls.len(), "task deferred on children");
        for child_call in defer.calls {
            self.engine
                .schedule_call_nested(child_call, root_id, parent_message)
                .await?;
        }
        Ok(())
    }
}
