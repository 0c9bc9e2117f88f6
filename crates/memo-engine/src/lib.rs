//! Task registry, scheduler ("Brrr"), and worker loop ("Wrrrker") for the
//! recursive task-execution runtime. Built on `memo-codec`, `memo-store`,
//! `memo-queue`, and `memo-runtime`.

mod context;
mod engine;
mod error;
mod task;
mod worker;

pub use context::ExecutionContext;
pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use task::{gather, Defer, Outcome, Task, TaskError};
pub use worker::Worker;

pub use memo_codec::Call;
