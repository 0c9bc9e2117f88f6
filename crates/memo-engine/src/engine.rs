//! The Scheduler API ("Brrr" in the source) and its configuration.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine as _;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use memo_codec::{Codec, JsonCodec};
use memo_queue::Queue;
use memo_runtime::{Memory, DEFAULT_CAS_RETRY_LIMIT};
use memo_store::Store;

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::task::{ErasedTaskFn, Task, TaskError};

/// Tunables the source hardcodes as module-level constants; here they're
/// fields so tests can shrink them to exercise boundary behaviors
/// deterministically (e.g. a small `spawn_limit` to hit `SpawnLimit`
/// without building a huge call graph).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-root-workflow cap on successful `put_job` calls.
    pub spawn_limit: i64,
    /// `Memory::with_cas`'s retry budget.
    pub cas_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            spawn_limit: 500,
            cas_retry_limit: DEFAULT_CAS_RETRY_LIMIT,
        }
    }
}

/// The engine: task registry plus the Store/Queue-backed scheduler
/// operations. Shared via `Arc` between the client that schedules work
/// and the worker loop(s) that drain it.
pub struct Engine {
    config: EngineConfig,
    memory: Memory,
    queue: Arc<dyn Queue>,
    codec: Arc<dyn Codec>,
    registry: DashMap<String, Arc<ErasedTaskFn>>,
    worker_running: AtomicBool,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn Queue>, config: EngineConfig) -> Arc<Self> {
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec::new());
        let memory = Memory::new(store, codec.clone()).with_cas_retry_limit(config.cas_retry_limit);
        Arc::new(Self {
            config,
            memory,
            queue,
            codec,
            registry: DashMap::new(),
            worker_running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn memory(&self) -> &Memory {
        &self.memory
    }

    pub(crate) fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub(crate) fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// Registers a task body under `name` (or, if `None`, a name the
    /// caller must supply some other way — unlike the source's dynamic
    /// language, Rust closures have no runtime-introspectable name, so
    /// omitting `name` here is simply `InvalidTaskName` rather than a
    /// reflective fallback).
    pub fn task<A, R, F, Fut>(
        self: &Arc<Self>,
        name: Option<&str>,
        body: F,
    ) -> Result<Task<A, R>, EngineError>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(A, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
    {
        let name = name.unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(EngineError::InvalidTaskName);
        }
        if self.registry.contains_key(&name) {
            return Err(EngineError::DuplicateTask(name));
        }
        let erased = Task::<A, R>::erase(body);
        self.registry.insert(name.clone(), erased.clone());
        debug!(task = %name, "task registered");
        Ok(Task::new(self.clone(), name, erased))
    }

    pub(crate) fn lookup(&self, name: &str) -> Result<Arc<ErasedTaskFn>, EngineError> {
        self.registry
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| EngineError::TaskNotFound(name.to_string()))
    }

    /// Client-side entry point: starts a new root workflow. Short-circuits
    /// if the call is already known (in progress or complete).
    pub async fn schedule<A: Serialize>(
        self: &Arc<Self>,
        task_name: &str,
        args: A,
    ) -> Result<(), EngineError> {
        let args_value = serde_json::to_value(args)?;
        let call = self.memory.make_call(task_name, args_value);
        if self.memory.has_call(&call).await? {
            debug!(memo_key = %call.memo_key, "schedule: call already known, short-circuiting");
            return Ok(());
        }
        let root_id = new_root_id();
        self.memory.set_call(&call).await?;
        self.put_job(&call.memo_key, &root_id).await?;
        info!(memo_key = %call.memo_key, root_id = %root_id, task = task_name, "scheduled root workflow");
        Ok(())
    }

    /// Called by the worker when a parent defers on `child_call`.
    /// Persists the child's call record and registers `parent_message`
    /// (the full `rootId/parentMemoKey` string) as a waiter.
    ///
    /// If the child turns out to already be complete by the time
    /// registration finishes (the §9 stranded-waiter edge case), the
    /// parent is re-enqueued directly here rather than left to wait on a
    /// wakeup that already happened.
    pub(crate) async fn schedule_call_nested(
        self: &Arc<Self>,
        child_call: memo_codec::Call,
        root_id: &str,
        parent_message: &str,
    ) -> Result<(), EngineError> {
        self.memory.set_call(&child_call).await?;
        let child_memo_key = child_call.memo_key.clone();
        let root_id_owned = root_id.to_string();
        let engine = self.clone();
        // `schedule_job`'s errors (SpawnLimit, queue faults) belong to
        // this crate's error type, not memo_runtime's — stash the real
        // error here and let `RuntimeError::ScheduleFailed` carry only
        // the fact that it happened through the CAS loop.
        let captured_error: Arc<std::sync::Mutex<Option<EngineError>>> =
            Arc::new(std::sync::Mutex::new(None));
        let captured_for_closure = captured_error.clone();
        let result = self
            .memory
            .add_pending_return(&child_memo_key, parent_message, move || {
                let engine = engine.clone();
                let child_memo_key = child_memo_key.clone();
                let root_id_owned = root_id_owned.clone();
                let captured_error = captured_for_closure.clone();
                async move {
                    match engine.put_job(&child_memo_key, &root_id_owned).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            *captured_error.lock().unwrap() = Some(e);
                            Err(memo_runtime::RuntimeError::ScheduleFailed)
                        }
                    }
                }
            })
            .await;

        let stranded = match result {
            Ok(stranded) => stranded,
            Err(memo_runtime::RuntimeError::ScheduleFailed) => {
                return Err(captured_error
                    .lock()
                    .unwrap()
                    .take()
                    .expect("ScheduleFailed always paired with a captured EngineError"));
            }
            Err(e) => return Err(e.into()),
        };

        if stranded {
            let (parent_root, parent_memo_key) = split_message(parent_message)?;
            debug!(parent = %parent_memo_key, "waking stranded late waiter directly");
            self.put_job(&parent_memo_key, &parent_root).await?;
        }
        Ok(())
    }

    /// `incr(count/<rootId>)`; over `spawn_limit` raises `SpawnLimit`,
    /// otherwise enqueues `rootId/memoKey`.
    pub(crate) async fn put_job(&self, memo_key: &str, root_id: &str) -> Result<(), EngineError> {
        let count = self
            .memory
            .incr_spawn_count(root_id)
            .await?;
        if count > self.config.spawn_limit {
            warn!(root_id, count, limit = self.config.spawn_limit, "spawn limit exceeded");
            return Err(EngineError::SpawnLimit);
        }
        self.queue.put_message(format!("{root_id}/{memo_key}")).await?;
        Ok(())
    }

    /// Client-side lookup of a completed call's result.
    pub async fn read<A: Serialize, R: DeserializeOwned>(
        &self,
        task_name: &str,
        args: A,
    ) -> Result<R, EngineError> {
        let args_value = serde_json::to_value(args)?;
        let call = self.memory.make_call(task_name, args_value);
        let bytes = self.memory.get_value(&call.memo_key).await?;
        let value = self.codec.decode_value(&bytes)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Acquires the per-engine worker singleton. Returns
    /// `WorkerAlreadyRunning` if one is already acquired; release happens
    /// when the returned guard drops.
    pub(crate) fn acquire_worker_slot(&self) -> Result<WorkerSlotGuard<'_>, EngineError> {
        if self
            .worker_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::WorkerAlreadyRunning);
        }
        Ok(WorkerSlotGuard { engine: self })
    }
}

pub(crate) struct WorkerSlotGuard<'a> {
    engine: &'a Engine,
}

impl Drop for WorkerSlotGuard<'_> {
    fn drop(&mut self) {
        self.engine.worker_running.store(false, Ordering::SeqCst);
    }
}

/// Splits a `rootId/memoKey` message on the *first* `/` only — the
/// memo key half is free to contain further slashes (spec §9).
pub(crate) fn split_message(body: &str) -> Result<(String, String), EngineError> {
    body.split_once('/')
        .map(|(root, key)| (root.to_string(), key.to_string()))
        .ok_or_else(|| EngineError::MalformedMessage(body.to_string()))
}

/// A fresh 128-bit root identifier, base64url without padding — by
/// construction free of `/`, satisfying the message-grammar requirement
/// that only the memo-key half may contain one (spec §9).
fn new_root_id() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
