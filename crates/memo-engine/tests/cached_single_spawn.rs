//! End-to-end scenario: fanning out more identical calls than the
//! configured spawn limit never trips `SpawnLimit`, because memoization
//! collapses every duplicate to a single scheduled child before the spawn
//! counter ever sees them (spec §8, scenario 6).
//!
//! `many() = sum(same(1) for _ in 0..(spawn_limit + 5))`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memo_engine::{Engine, EngineConfig, ExecutionContext, TaskError, Worker};
use memo_testkit::{ChannelQueue, MapStore};

#[tokio::test]
async fn fanout_past_the_spawn_limit_still_runs_the_shared_child_once() {
    const SPAWN_LIMIT: i64 = 5;
    const FANOUT: usize = SPAWN_LIMIT as usize + 5;

    let queue = Arc::new(ChannelQueue::new().with_poll_timeout(Duration::from_millis(50)));
    let config = EngineConfig {
        spawn_limit: SPAWN_LIMIT,
        ..EngineConfig::default()
    };
    let engine = Engine::new(Arc::new(MapStore::new()), queue.clone(), config);

    let same_calls = Arc::new(AtomicUsize::new(0));
    let same_calls_body = same_calls.clone();
    let same = engine
        .task(Some("same"), move |n: i64, _ctx: ExecutionContext| {
            let same_calls = same_calls_body.clone();
            async move {
                same_calls.fetch_add(1, Ordering::SeqCst);
                Ok::<i64, TaskError>(n)
            }
        })
        .unwrap();

    let queue_body = queue.clone();
    let same_for_many = same.clone();
    let many = engine
        .task(Some("many"), move |(): (), ctx: ExecutionContext| {
            let queue = queue_body.clone();
            let same = same_for_many.clone();
            async move {
                let args: Vec<i64> = std::iter::repeat(1).take(FANOUT).collect();
                let results = same.map(args, &ctx).await?;
                let total: i64 = results.into_iter().sum();
                queue.close().await;
                Ok::<i64, TaskError>(total)
            }
        })
        .unwrap();

    engine.schedule("many", ()).await.unwrap();

    let worker = Worker::new(engine.clone());
    worker.run_until_closed().await.unwrap();

    let value: i64 = engine.read("many", ()).await.unwrap();
    assert_eq!(value, FANOUT as i64);
    assert_eq!(
        same_calls.load(Ordering::SeqCst),
        1,
        "all {FANOUT} fan-out copies of same(1) must collapse to a single execution"
    );
}
