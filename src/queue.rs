//! Bounded FIFO buffer between connector fetch loops and the worker pool.
//!
//! The queue is the only synchronization point between fetch and processing.
//! It holds no business logic and does no deduplication; that belongs to the
//! connectors and the processing engine. Capacity is the backpressure
//! mechanism: `enqueue` waits for a slot, `try_enqueue` fails fast with
//! `QueueError::Full`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use metrics::gauge;
use tokio::sync::mpsc;

use crate::error::QueueError;
use crate::event::{QueuedEvent, RawEvent};

pub struct EventQueue {
    capacity: usize,
    // Taken (set to None) on close so producers see `Closed` and the
    // receiver drains to completion once in-flight items are consumed.
    tx: Mutex<Option<mpsc::Sender<QueuedEvent>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<QueuedEvent>>,
    next_seq: AtomicU64,
    depth: Arc<AtomicUsize>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            next_seq: AtomicU64::new(0),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently buffered (accepted, not yet dequeued; includes a
    /// producer waiting for a slot).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn set_depth_gauge(d: usize) {
        gauge!("queue_depth").set(d as f64);
    }

    fn sender(&self) -> Result<mpsc::Sender<QueuedEvent>, QueueError> {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .cloned()
            .ok_or(QueueError::Closed)
    }

    fn wrap(&self, raw: RawEvent) -> QueuedEvent {
        QueuedEvent {
            sequence: self.next_seq.fetch_add(1, Ordering::Relaxed),
            enqueued_at: Utc::now(),
            raw,
        }
    }

    /// Enqueue, waiting for a free slot when at capacity. Fails only after
    /// shutdown closed the queue.
    ///
    /// Depth is incremented before the send: a dequeue can only observe an
    /// item whose increment already happened, so the counter never dips
    /// below zero.
    pub async fn enqueue(&self, raw: RawEvent) -> Result<u64, QueueError> {
        let tx = self.sender()?;
        let item = self.wrap(raw);
        let seq = item.sequence;
        let d = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        Self::set_depth_gauge(d);
        if tx.send(item).await.is_err() {
            let d = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
            Self::set_depth_gauge(d);
            return Err(QueueError::Closed);
        }
        Ok(seq)
    }

    /// Non-blocking enqueue for producers that prefer an explicit `Full`
    /// signal over waiting.
    pub fn try_enqueue(&self, raw: RawEvent) -> Result<u64, QueueError> {
        let tx = self.sender()?;
        let item = self.wrap(raw);
        let seq = item.sequence;
        let d = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        Self::set_depth_gauge(d);
        if let Err(e) = tx.try_send(item) {
            let d = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
            Self::set_depth_gauge(d);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            });
        }
        Ok(seq)
    }

    /// Wait for the next item. Each item is delivered to exactly one caller,
    /// even with many workers dequeuing concurrently. Returns `None` once the
    /// queue is closed and fully drained.
    pub async fn dequeue(&self) -> Option<QueuedEvent> {
        let mut rx = self.rx.lock().await;
        let item = rx.recv().await?;
        let d = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
        Self::set_depth_gauge(d);
        Some(item)
    }

    /// Non-blocking dequeue, used by the shutdown drain accounting.
    pub fn try_dequeue(&self) -> Option<QueuedEvent> {
        let mut rx = self.rx.try_lock().ok()?;
        let item = rx.try_recv().ok()?;
        let d = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
        Self::set_depth_gauge(d);
        Some(item)
    }

    /// Signal shutdown: reject all further enqueues. Items already buffered
    /// remain dequeueable until the channel drains.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceType;
    use std::collections::BTreeMap;

    fn raw(id: &str) -> RawEvent {
        RawEvent::new("c1", id, SourceType::Mail, BTreeMap::new())
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = EventQueue::new(8);
        q.enqueue(raw("a")).await.unwrap();
        q.enqueue(raw("b")).await.unwrap();
        let a = q.dequeue().await.unwrap();
        let b = q.dequeue().await.unwrap();
        assert_eq!(a.raw.source_id, "a");
        assert_eq!(b.raw.source_id, "b");
        assert!(a.sequence < b.sequence);
    }

    #[tokio::test]
    async fn try_enqueue_reports_full() {
        let q = EventQueue::new(1);
        q.try_enqueue(raw("a")).unwrap();
        match q.try_enqueue(raw("b")) {
            Err(QueueError::Full { capacity }) => assert_eq!(capacity, 1),
            other => panic!("expected Full, got {other:?}"),
        }
        // Dequeuing frees the slot.
        q.dequeue().await.unwrap();
        q.try_enqueue(raw("b")).unwrap();
    }

    #[tokio::test]
    async fn enqueue_blocks_until_slot_frees() {
        let q = Arc::new(EventQueue::new(1));
        q.enqueue(raw("a")).await.unwrap();

        let q2 = q.clone();
        let pending = tokio::spawn(async move { q2.enqueue(raw("b")).await });

        // The enqueue cannot finish while the queue is full.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        q.dequeue().await.unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(q.dequeue().await.unwrap().raw.source_id, "b");
    }

    #[tokio::test]
    async fn close_rejects_enqueue_but_drains() {
        let q = EventQueue::new(4);
        q.enqueue(raw("a")).await.unwrap();
        q.close();
        assert_eq!(q.enqueue(raw("b")).await, Err(QueueError::Closed));
        assert_eq!(q.dequeue().await.unwrap().raw.source_id, "a");
        assert!(q.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn depth_never_underflows_under_concurrent_load() {
        let q = Arc::new(EventQueue::new(4));
        let producer = {
            let q = q.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    q.enqueue(raw(&format!("m{i}"))).await.unwrap();
                }
            })
        };
        for _ in 0..100 {
            q.dequeue().await.unwrap();
            // Underflow would read as usize::MAX here.
            assert!(q.depth() <= 5);
        }
        producer.await.unwrap();
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn rejected_enqueue_leaves_depth_unchanged() {
        let q = EventQueue::new(1);
        q.try_enqueue(raw("a")).unwrap();
        assert!(q.try_enqueue(raw("b")).is_err());
        assert_eq!(q.depth(), 1);
    }

    #[tokio::test]
    async fn depth_tracks_buffered_items() {
        let q = EventQueue::new(4);
        assert_eq!(q.depth(), 0);
        q.enqueue(raw("a")).await.unwrap();
        q.enqueue(raw("b")).await.unwrap();
        assert_eq!(q.depth(), 2);
        q.dequeue().await.unwrap();
        assert_eq!(q.depth(), 1);
    }
}
