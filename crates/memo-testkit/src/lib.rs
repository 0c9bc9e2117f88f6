//! In-process `Store` and `Queue` stand-ins.
//!
//! These exist only so `memo-engine`'s own test suite can drive the full
//! protocol end to end without a real backend. They are not production
//! adapters: `MapStore` holds everything in a `DashMap` for the life of
//! the process, and `ChannelQueue` is a single-process FIFO. Neither
//! persists anything or talks to a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

use memo_queue::{Queue, QueueError, QueueInfo, DEFAULT_POLL_TIMEOUT};
use memo_store::{Key, Store, StoreError};

/// A `DashMap`-backed `Store`. Conditional writes are correct because
/// `DashMap`'s per-shard entry API gives us a single point of mutual
/// exclusion per key for the compare step and the write.
#[derive(Default)]
pub struct MapStore {
    data: DashMap<String, Vec<u8>>,
    counters: DashMap<String, AtomicI64>,
}

impl MapStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MapStore {
    async fn has(&self, key: &Key) -> Result<bool, StoreError> {
        Ok(self.data.contains_key(key.as_str()))
    }

    async fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError> {
        self.data
            .get(key.as_str())
            .map(|v| v.clone())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn set(&self, key: &Key, value: Vec<u8>) -> Result<(), StoreError> {
        self.data.insert(key.as_str().to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.data.remove(key.as_str());
        Ok(())
    }

    async fn set_new_value(&self, key: &Key, value: Vec<u8>) -> Result<(), StoreError> {
        match self.data.entry(key.as_str().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::CompareMismatch(key.clone())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    async fn compare_and_set(
        &self,
        key: &Key,
        new: Vec<u8>,
        expected: &[u8],
    ) -> Result<(), StoreError> {
        match self.data.entry(key.as_str().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().as_slice() == expected {
                    slot.insert(new);
                    Ok(())
                } else {
                    Err(StoreError::CompareMismatch(key.clone()))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Err(StoreError::CompareMismatch(key.clone())),
        }
    }

    async fn compare_and_delete(&self, key: &Key, expected: &[u8]) -> Result<(), StoreError> {
        match self.data.entry(key.as_str().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(slot) => {
                if slot.get().as_slice() == expected {
                    slot.remove();
                    Ok(())
                } else {
                    Err(StoreError::CompareMismatch(key.clone()))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Err(StoreError::CompareMismatch(key.clone())),
        }
    }

    async fn incr(&self, counter_key: &Key) -> Result<i64, StoreError> {
        let counter = self
            .counters
            .entry(counter_key.as_str().to_string())
            .or_insert_with(|| AtomicI64::new(0));
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// A single-process FIFO `Queue`. `get_message` waits on a [`Notify`] up
/// to `DEFAULT_POLL_TIMEOUT`, returning `Empty` on expiry and `Closed`
/// once [`ChannelQueue::close`] has been called and the backlog drained.
pub struct ChannelQueue {
    messages: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
    poll_timeout: Duration,
}

impl ChannelQueue {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

impl Default for ChannelQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for ChannelQueue {
    async fn put_message(&self, body: String) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.messages.lock().await.push_back(body);
        self.notify.notify_one();
        Ok(())
    }

    async fn get_message(&self) -> Result<String, QueueError> {
        loop {
            {
                let mut messages = self.messages.lock().await;
                if let Some(body) = messages.pop_front() {
                    return Ok(body);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }
            match tokio::time::timeout(self.poll_timeout, self.notify.notified()).await {
                Ok(()) => continue,
                Err(_) => {
                    trace!("queue poll timed out");
                    return Err(QueueError::Empty);
                }
            }
        }
    }

    async fn get_info(&self) -> QueueInfo {
        QueueInfo {
            length: self.messages.lock().await.len(),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_new_value_rejects_existing_key() {
        let store = MapStore::new();
        let key = Key::value("m");
        store.set_new_value(&key, b"1".to_vec()).await.unwrap();
        let err = store.set_new_value(&key, b"2".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::CompareMismatch(_)));
    }

    #[tokio::test]
    async fn incr_is_monotonic_per_key() {
        let store = MapStore::new();
        let key = Key::count("root-1");
        assert_eq!(store.incr(&key).await.unwrap(), 1);
        assert_eq!(store.incr(&key).await.unwrap(), 2);
        assert_eq!(store.incr(&key).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn queue_round_trips_a_message() {
        let queue = ChannelQueue::new();
        queue.put_message("root-1/memo-key".to_string()).await.unwrap();
        assert_eq!(queue.get_message().await.unwrap(), "root-1/memo-key");
    }

    #[tokio::test]
    async fn queue_reports_closed_after_close_and_drain() {
        let queue = ChannelQueue::new();
        queue.put_message("m".to_string()).await.unwrap();
        queue.close().await;
        assert_eq!(queue.get_message().await.unwrap(), "m");
        assert!(matches!(queue.get_message().await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn queue_times_out_when_empty() {
        let queue = ChannelQueue::new().with_poll_timeout(Duration::from_millis(20));
        assert!(matches!(queue.get_message().await, Err(QueueError::Empty)));
    }
}
