//! End-to-end scenario: a task closes the queue from within its own body
//! once a chosen argument is reached — the way test harnesses terminate a
//! worker loop, since the engine has no intrinsic "workflow complete"
//! signal (spec §4.7, §8 scenario 2).
//!
//! `foo(a) = a == 0 ? 0 : (let r = foo(a - 1) in (if a == 3 { close() }; r))`

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use memo_engine::{Engine, EngineConfig, ExecutionContext, Task, Worker};
use memo_testkit::{ChannelQueue, MapStore};

#[tokio::test]
async fn closing_the_queue_mid_defer_still_lets_every_ancestor_finish() {
    let queue = Arc::new(ChannelQueue::new().with_poll_timeout(Duration::from_millis(50)));
    let engine = Engine::new(Arc::new(MapStore::new()), queue.clone(), EngineConfig::default());

    let counts: Arc<Mutex<HashMap<i64, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let self_ref: Arc<OnceLock<Task<i64, i64>>> = Arc::new(OnceLock::new());

    let counts_body = counts.clone();
    let queue_body = queue.clone();
    let self_for_body = self_ref.clone();
    let foo = engine
        .task(Some("foo"), move |a: i64, ctx: ExecutionContext| {
            let counts = counts_body.clone();
            let queue = queue_body.clone();
            let self_ref = self_for_body.clone();
            async move {
                *counts.lock().unwrap().entry(a).or_insert(0) += 1;
                if a == 0 {
                    return Ok(0);
                }
                let this = self_ref.get().expect("registered before scheduling").clone();
                let rest = this.invoke(a - 1, &ctx).await?.ready()?;
                if a == 3 {
                    queue.close().await;
                }
                Ok(rest)
            }
        })
        .unwrap();
    self_ref.set(foo.clone()).ok();

    engine.schedule("foo", 3i64).await.unwrap();

    let worker = Worker::new(engine.clone());
    worker.run_until_closed().await.unwrap();

    let value: i64 = engine.read("foo", 3i64).await.unwrap();
    assert_eq!(value, 0);

    // foo(0) is the leaf: it never defers, so it runs exactly once.
    // foo(1), foo(2), foo(3) each defer once (discovering the missing
    // child) and then re-run exactly once more after being woken.
    let snapshot = counts.lock().unwrap().clone();
    assert_eq!(snapshot.get(&0).copied().unwrap_or(0), 1);
    assert_eq!(snapshot.get(&1).copied().unwrap_or(0), 2);
    assert_eq!(snapshot.get(&2).copied().unwrap_or(0), 2);
    assert_eq!(snapshot.get(&3).copied().unwrap_or(0), 2);
}
