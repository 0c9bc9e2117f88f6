//! Explicit execution context, replacing the source's mutable worker
//! singleton (spec §9, "Worker context detection"): `Task::invoke`
//! dispatches on a value passed to it, never on hidden global state.

use std::sync::Arc;

use crate::engine::Engine;

/// Where a task body is currently running.
#[derive(Clone)]
pub enum ExecutionContext {
    /// A direct client-side call (`Task::invoke` outside a worker).
    /// Task bodies run synchronously to completion; recursive calls
    /// never defer.
    Direct,

    /// Inside the worker loop, dispatched from a dequeued message.
    Worker {
        engine: Arc<Engine>,
        root_id: String,
        /// The full `rootId/memoKey` message body this task body is
        /// running on behalf of — this is the identity registered as a
        /// waiter in `pending_returns` when a child is deferred.
        message: String,
    },
}

impl ExecutionContext {
    pub fn is_worker(&self) -> bool {
        matches!(self, ExecutionContext::Worker { .. })
    }
}
