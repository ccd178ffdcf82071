//! Bounded async FIFO with selectable overflow behavior
//!
//! Streams absorb network jitter through these queues; the policy decides
//! what happens when the consumer falls behind.

use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use std::sync::Arc;
use thiserror::Error;

/// What `put` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Silently discard the new item
    Drop,
    /// Discard the oldest item, then enqueue
    Pop,
    /// Discard the oldest half of the queue, then enqueue
    DrainOldest,
    /// Suspend until a slot is free
    Block,
    /// Fail the caller with [`QueueError::Full`]
    Raise,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("queue empty")]
    Empty,
    #[error("queue closed")]
    Closed,
}

/// Bounded FIFO shared between producers and consumers.
///
/// Cloning is cheap and clones observe the same queue.
pub struct BackPressureQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    policy: OverflowPolicy,
    // Serializes drains so two full-queue producers cannot interleave
    drain_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<T> Clone for BackPressureQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
            policy: self.policy,
            drain_lock: self.drain_lock.clone(),
        }
    }
}

impl<T> BackPressureQueue<T> {
    /// Create a queue holding at most `capacity` items (at least 1)
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            policy,
            drain_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Enqueue an item, applying the overflow policy when full.
    ///
    /// Only the `Block` policy suspends on a full queue; `Drop`, `Pop` and
    /// `DrainOldest` absorb the overflow and report success.
    pub async fn put(&self, item: T) -> Result<(), QueueError> {
        match self.policy {
            OverflowPolicy::Drop => match self.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("queue full, dropping item");
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
            },
            OverflowPolicy::Raise => self.tx.try_send(item).map_err(|err| match err {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Closed(_) => QueueError::Closed,
            }),
            OverflowPolicy::Pop => self.pop_then_put(item),
            OverflowPolicy::DrainOldest => {
                if self.tx.is_full() {
                    self.drain_oldest().await;
                }
                self.tx.send(item).await.map_err(|_| QueueError::Closed)
            }
            OverflowPolicy::Block => self.tx.send(item).await.map_err(|_| QueueError::Closed),
        }
    }

    /// Non-suspending enqueue for synchronous callers (device callbacks).
    ///
    /// `Drop` and `Pop` behave as in [`put`](Self::put); the suspending
    /// policies report [`QueueError::Full`] instead of waiting.
    pub fn try_put(&self, item: T) -> Result<(), QueueError> {
        match self.policy {
            OverflowPolicy::Drop => match self.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Ok(()),
                Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
            },
            OverflowPolicy::Pop => self.pop_then_put(item),
            _ => self.tx.try_send(item).map_err(|err| match err {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Closed(_) => QueueError::Closed,
            }),
        }
    }

    fn pop_then_put(&self, item: T) -> Result<(), QueueError> {
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(rejected)) => {
                    item = rejected;
                    if self.rx.try_recv().is_ok() {
                        tracing::debug!("queue full, discarded oldest item");
                    }
                }
                Err(TrySendError::Closed(_)) => return Err(QueueError::Closed),
            }
        }
    }

    async fn drain_oldest(&self) {
        let _guard = self.drain_lock.lock().await;
        let mut drained = 0;
        for _ in 0..self.capacity / 2 {
            if self.rx.try_recv().is_ok() {
                drained += 1;
            }
        }
        tracing::debug!("drained {drained} oldest items from full queue");
    }

    /// Dequeue, suspending until an item is available
    pub async fn get(&self) -> Result<T, QueueError> {
        self.rx.recv().await.map_err(|_| QueueError::Closed)
    }

    /// Dequeue without suspending
    pub fn try_get(&self) -> Result<T, QueueError> {
        self.rx.try_recv().map_err(|err| match err {
            TryRecvError::Empty => QueueError::Empty,
            TryRecvError::Closed => QueueError::Closed,
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the queue; pending and future operations fail with `Closed`
    pub fn close(&self) -> bool {
        self.tx.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain_all(queue: &BackPressureQueue<u32>) -> Vec<u32> {
        let mut items = Vec::new();
        while let Ok(item) = queue.try_get() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BackPressureQueue::new(4, OverflowPolicy::Block);
        for i in 0..4 {
            queue.put(i).await.unwrap();
        }
        assert_eq!(drain_all(&queue).await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_drop_policy_discards_newest() {
        let queue = BackPressureQueue::new(2, OverflowPolicy::Drop);
        for i in 0..5 {
            queue.put(i).await.unwrap();
        }
        assert_eq!(drain_all(&queue).await, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_pop_policy_discards_oldest() {
        let queue = BackPressureQueue::new(2, OverflowPolicy::Pop);
        for i in 0..5 {
            queue.put(i).await.unwrap();
        }
        assert_eq!(drain_all(&queue).await, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_raise_policy_fails_caller() {
        let queue = BackPressureQueue::new(1, OverflowPolicy::Raise);
        queue.put(1).await.unwrap();
        assert_eq!(queue.put(2).await, Err(QueueError::Full));
        assert_eq!(drain_all(&queue).await, vec![1]);
    }

    #[tokio::test]
    async fn test_drain_oldest_discards_half() {
        let queue = BackPressureQueue::new(10, OverflowPolicy::DrainOldest);
        for i in 0..10 {
            queue.put(i).await.unwrap();
        }
        for i in 10..14 {
            queue.put(i).await.unwrap();
        }
        assert_eq!(
            drain_all(&queue).await,
            vec![5, 6, 7, 8, 9, 10, 11, 12, 13]
        );
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let queue = BackPressureQueue::new(1, OverflowPolicy::Block);
        queue.put(1).await.unwrap();

        let consumer = queue.clone();
        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            consumer.get().await.unwrap()
        });

        tokio::time::timeout(Duration::from_secs(1), queue.put(2))
            .await
            .expect("blocked put should resume once a slot frees")
            .unwrap();
        assert_eq!(reader.await.unwrap(), 1);
        assert_eq!(queue.try_get(), Ok(2));
    }

    #[tokio::test]
    async fn test_get_waits_for_item() {
        let queue = BackPressureQueue::new(1, OverflowPolicy::Block);
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.put(7).await.unwrap();
        });
        let item = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, 7);
    }

    #[tokio::test]
    async fn test_try_get_empty() {
        let queue: BackPressureQueue<u32> = BackPressureQueue::new(1, OverflowPolicy::Drop);
        assert_eq!(queue.try_get(), Err(QueueError::Empty));
    }

    #[tokio::test]
    async fn test_closed_queue_fails() {
        let queue = BackPressureQueue::new(1, OverflowPolicy::Block);
        queue.close();
        assert_eq!(queue.put(1).await, Err(QueueError::Closed));
        assert_eq!(queue.get().await, Err(QueueError::Closed));
    }
}
