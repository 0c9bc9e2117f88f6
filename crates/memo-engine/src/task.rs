//! Task handles, the `Outcome`/`Defer` redesign, and `gather`.
//!
//! Per the source specification's own design note: recursive dependency
//! discovery is not modeled as an exception. `Task::invoke` returns a
//! sum type instead of raising, and `gather` reduces a batch of those
//! sums into either "everything is ready" or "here is everything still
//! missing".

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use memo_codec::Call;

use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::error::EngineError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The result of attempting to read a call's cached value: either it was
/// already there, or it's missing and the worker must schedule it.
#[derive(Debug, Clone)]
pub enum Outcome<R> {
    Ready(R),
    Missing(Call),
}

impl<R> Outcome<R> {
    /// Collapses `Ready(r)` to `Ok(r)`, `Missing(c)` to a single-child
    /// [`Defer`]. The usual way a task body surfaces one missing
    /// dependency: `task.invoke(args, ctx).await?.ready()?`.
    pub fn ready(self) -> Result<R, Defer> {
        match self {
            Outcome::Ready(r) => Ok(r),
            Outcome::Missing(call) => Err(Defer { calls: vec![call] }),
        }
    }
}

/// Carries every child call a task body still needs before it can
/// produce a result. Never a single call in isolation once it has
/// passed through [`gather`] — fan-out discovers all missing children
/// in one parent execution.
#[derive(Debug, Clone)]
pub struct Defer {
    pub calls: Vec<Call>,
}

/// Reduces a batch of [`Outcome`]s the way a task body's fan-out does:
/// every outcome is inspected (never short-circuiting on the first
/// `Missing`), so a parent discovers *all* of its currently-missing
/// children in one execution rather than one per re-run.
pub fn gather<R>(outcomes: Vec<Outcome<R>>) -> Result<Vec<R>, Defer> {
    let mut ready = Vec::with_capacity(outcomes.len());
    let mut missing = Vec::new();
    for outcome in outcomes {
        match outcome {
            Outcome::Ready(r) => ready.push(r),
            Outcome::Missing(call) => missing.push(call),
        }
    }
    if missing.is_empty() {
        Ok(ready)
    } else {
        Err(Defer { calls: missing })
    }
}

/// What a task body's future resolves to: either its return value, or a
/// signal that belongs to the worker loop rather than to normal error
/// handling. `?` converts both `EngineError` (genuine faults) and
/// `Defer` (scheduling directives) into this via the `From` impls below,
/// so task bodies read like ordinary fallible Rust.
#[derive(Debug)]
pub enum TaskError {
    Defer(Defer),
    Failed(EngineError),
}

impl From<Defer> for TaskError {
    fn from(defer: Defer) -> Self {
        TaskError::Defer(defer)
    }
}

impl From<EngineError> for TaskError {
    fn from(err: EngineError) -> Self {
        TaskError::Failed(err)
    }
}

/// The erased form every registered task reduces to: JSON arguments in,
/// `Result<Value, TaskError>` out. The registry only ever stores these —
/// type information lives solely in the [`Task<A, R>`] handles user code
/// holds.
pub(crate) type ErasedTaskFn =
    dyn Fn(Value, ExecutionContext) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync;

/// A registered task: `(engine, name, body)`. Cloning is cheap — it
/// shares the engine handle and the body closure.
pub struct Task<A, R> {
    engine: Arc<Engine>,
    name: String,
    erased: Arc<ErasedTaskFn>,
    _marker: std::marker::PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for Task<A, R> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            name: self.name.clone(),
            erased: self.erased.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<A, R> Task<A, R>
where
    A: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(engine: Arc<Engine>, name: String, erased: Arc<ErasedTaskFn>) -> Self {
        Self {
            engine,
            name,
            erased,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wraps a typed task body into the `Value`-in-`Value`-out shape the
    /// registry stores. `Direct` execution runs `body` with no
    /// serialization round-trip at all — `invoke` only serializes args
    /// when it actually needs a memo key (worker context).
    pub(crate) fn erase<F, Fut>(body: F) -> Arc<ErasedTaskFn>
    where
        F: Fn(A, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
    {
        Arc::new(move |args_value: Value, ctx: ExecutionContext| {
            let body_result = serde_json::from_value::<A>(args_value)
                .map_err(EngineError::from)
                .map_err(TaskError::from);
            let fut = body(
                match body_result {
                    Ok(a) => a,
                    Err(e) => return Box::pin(async move { Err(e) }),
                },
                ctx,
            );
            Box::pin(async move {
                let r = fut.await?;
                serde_json::to_value(r)
                    .map_err(EngineError::from)
                    .map_err(TaskError::from)
            })
        })
    }

    /// Behaves differently by context (spec §4.5):
    /// - [`ExecutionContext::Direct`]: runs the registered body
    ///   synchronously, no Store I/O. Enables unit testing task bodies
    ///   without an engine.
    /// - [`ExecutionContext::Worker`]: never runs the body. Builds the
    ///   `Call`, reads `value/memoKey`; present → `Ready`, absent →
    ///   `Missing(call)`.
    pub async fn invoke(&self, args: A, ctx: &ExecutionContext) -> Result<Outcome<R>, EngineError> {
        match ctx {
            ExecutionContext::Direct => {
                let args_value = serde_json::to_value(&args)?;
                let result = (self.erased)(args_value, ctx.clone()).await;
                match result {
                    Ok(value) => Ok(Outcome::Ready(serde_json::from_value(value)?)),
                    Err(TaskError::Failed(e)) => Err(e),
                    Err(TaskError::Defer(_)) => {
                        unreachable!("direct execution never defers: there is no worker context to defer to")
                    }
                }
            }
            ExecutionContext::Worker { .. } => {
                let args_value = serde_json::to_value(&args)?;
                let call = self.engine.memory().make_call(&self.name, args_value);
                match self.engine.memory().get_value(&call.memo_key).await {
                    Ok(bytes) => {
                        let value = self.engine.codec().decode_value(&bytes)?;
                        Ok(Outcome::Ready(serde_json::from_value(value)?))
                    }
                    Err(memo_runtime::RuntimeError::Store(memo_store::StoreError::NotFound(_))) => {
                        Ok(Outcome::Missing(call))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// `task.map(argsLists)`: invokes once per argument list and reduces
    /// the results through [`gather`].
    pub async fn map(&self, arg_lists: Vec<A>, ctx: &ExecutionContext) -> Result<Vec<R>, TaskError>
    where
        A: Clone,
    {
        let mut outcomes = Vec::with_capacity(arg_lists.len());
        for args in arg_lists {
            outcomes.push(self.invoke(args, ctx).await?);
        }
        Ok(gather(outcomes)?)
    }
}
