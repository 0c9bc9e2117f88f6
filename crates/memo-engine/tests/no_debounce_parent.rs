//! End-to-end scenario: a parent fans out to 50 *distinct* children. Unlike
//! the debounce scenario, nothing collapses here — each child is its own
//! memo key, so each runs exactly once, and the parent itself re-runs once
//! per child completion on top of its initial deferring execution
//! (spec §8, scenario 4).
//!
//! `foo(a) = sum(one(i) for i in 0..a)`, `one(i) = 1`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use memo_engine::{Engine, EngineConfig, ExecutionContext, TaskError, Worker};
use memo_testkit::{ChannelQueue, MapStore};

const SPREAD: i64 = 50;

#[tokio::test]
async fn fifty_distinct_children_each_run_once_and_the_parent_wakes_fifty_times() {
    let queue = Arc::new(ChannelQueue::new().with_poll_timeout(Duration::from_millis(50)));
    let engine = Engine::new(Arc::new(MapStore::new()), queue, EngineConfig::default());

    let one_calls = Arc::new(AtomicUsize::new(0));
    let foo_calls = Arc::new(AtomicUsize::new(0));

    let one_calls_body = one_calls.clone();
    let one = engine
        .task(Some("one"), move |_i: i64, _ctx: ExecutionContext| {
            let one_calls = one_calls_body.clone();
            async move {
                one_calls.fetch_add(1, Ordering::SeqCst);
                Ok::<i64, TaskError>(1)
            }
        })
        .unwrap();

    let foo_calls_body = foo_calls.clone();
    let one_for_foo = one.clone();
    let foo = engine
        .task(Some("foo"), move |a: i64, ctx: ExecutionContext| {
            let foo_calls = foo_calls_body.clone();
            let one = one_for_foo.clone();
            async move {
                foo_calls.fetch_add(1, Ordering::SeqCst);
                let args: Vec<i64> = (0..a).collect();
                let results = one.map(args, &ctx).await?;
                Ok::<i64, TaskError>(results.into_iter().sum())
            }
        })
        .unwrap();

    engine.schedule("foo", SPREAD).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Worker::new(engine.clone());
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let value: i64 = loop {
        match engine.read("foo", SPREAD).await {
            Ok(v) => break v,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    shutdown_tx.send(true).unwrap();
    worker_handle.await.unwrap().unwrap();

    assert_eq!(value, SPREAD);
    assert_eq!(one_calls.load(Ordering::SeqCst), SPREAD as usize);
    assert_eq!(foo_calls.load(Ordering::SeqCst), SPREAD as usize + 1);
}
