//! End-to-end scenario: a recursive task invoked directly, with no engine
//! plumbing involved at all (spec §8, scenario 1). Direct invocation runs
//! the body synchronously and must never touch the Store or Queue, so any
//! `Store`/`Queue` passed to `Engine::new` here exists only to satisfy the
//! constructor — it is never read from or written to.

use std::sync::{Arc, OnceLock};

use memo_engine::{Engine, EngineConfig, ExecutionContext, Outcome, Task};
use memo_store::Store as _;
use memo_testkit::{ChannelQueue, MapStore};

#[tokio::test]
async fn triangular_sum_direct_invocation_runs_synchronously() {
    let engine = Engine::new(
        Arc::new(MapStore::new()),
        Arc::new(ChannelQueue::new()),
        EngineConfig::default(),
    );

    // `triangular_sum` recurses on itself, so the closure needs a handle to
    // its own `Task` before that `Task` exists. Stash it behind a
    // `OnceLock` set immediately after registration, same trick used in
    // the other scenario tests.
    let self_ref: Arc<OnceLock<Task<i64, i64>>> = Arc::new(OnceLock::new());
    let self_for_body = self_ref.clone();
    let triangular_sum = engine
        .task(Some("triangular_sum"), move |n: i64, ctx: ExecutionContext| {
            let self_ref = self_for_body.clone();
            async move {
                if n == 0 {
                    return Ok(0);
                }
                let this = self_ref.get().expect("registered before invocation").clone();
                let rest = this.invoke(n - 1, &ctx).await?.ready()?;
                Ok(n + rest)
            }
        })
        .unwrap();
    self_ref.set(triangular_sum.clone()).ok();

    let outcome = triangular_sum
        .invoke(3, &ExecutionContext::Direct)
        .await
        .unwrap();
    match outcome {
        Outcome::Ready(value) => assert_eq!(value, 6),
        Outcome::Missing(_) => panic!("direct invocation must never defer"),
    }
}

#[tokio::test]
async fn direct_invocation_performs_no_store_io() {
    let store = Arc::new(MapStore::new());
    let engine = Engine::new(store.clone(), Arc::new(ChannelQueue::new()), EngineConfig::default());

    let double = engine
        .task(Some("double"), |n: i64, _ctx: ExecutionContext| async move {
            Ok::<i64, memo_engine::TaskError>(n * 2)
        })
        .unwrap();

    let outcome = double.invoke(21, &ExecutionContext::Direct).await.unwrap();
    assert!(matches!(outcome, Outcome::Ready(42)));

    // No call/value/pending_returns record was ever written for this
    // invocation — direct execution bypasses Memory entirely.
    assert!(!store.has(&memo_store::Key::call("anything")).await.unwrap());
}
