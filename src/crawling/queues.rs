//! # Work Queues
//!
//! FIFO queues connecting the pipeline stages. Besides enqueue and dequeue a
//! queue tracks unfinished work: every enqueued item stays unfinished until a
//! consumer calls [`WorkQueue::task_done`], and [`WorkQueue::join`] waits for
//! that count to reach zero.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Queue operation errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue '{0}' is closed")]
    Closed(&'static str),
}

/// Multi-producer, multi-consumer FIFO with join support
pub struct WorkQueue<T> {
    name: &'static str,

    sender: mpsc::UnboundedSender<T>,

    /// Consumers take turns on the receiver, which keeps delivery FIFO
    receiver: Mutex<mpsc::UnboundedReceiver<T>>,

    /// Items enqueued but not yet dequeued
    pending: AtomicUsize,

    /// Items enqueued but not yet marked done
    unfinished: watch::Sender<usize>,

    /// Free slots when the queue is bounded
    capacity: Option<Arc<Semaphore>>,

    closed: AtomicBool,

    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
    /// Largest pending length observed
    peak_len: AtomicUsize,
}

impl<T: Send> WorkQueue<T> {
    #[must_use]
    pub fn unbounded(name: &'static str) -> Self {
        Self::with_capacity(name, None)
    }

    #[must_use]
    pub fn bounded(name: &'static str, capacity: usize) -> Self {
        Self::with_capacity(name, Some(capacity.max(1)))
    }

    /// `0` means unbounded
    #[must_use]
    pub fn from_capacity(name: &'static str, capacity: usize) -> Self {
        if capacity == 0 {
            Self::unbounded(name)
        } else {
            Self::bounded(name, capacity)
        }
    }

    fn with_capacity(name: &'static str, capacity: Option<usize>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (unfinished, _) = watch::channel(0);
        Self {
            name,
            sender,
            receiver: Mutex::new(receiver),
            pending: AtomicUsize::new(0),
            unfinished,
            capacity: capacity.map(|permits| Arc::new(Semaphore::new(permits))),
            closed: AtomicBool::new(false),
            total_enqueued: AtomicU64::new(0),
            total_dequeued: AtomicU64::new(0),
            peak_len: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Adds an item, waiting for a free slot when the queue is bounded
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.name));
        }
        if let Some(capacity) = &self.capacity {
            capacity
                .acquire()
                .await
                .map_err(|_| QueueError::Closed(self.name))?
                .forget();
        }

        self.unfinished.send_modify(|count| *count += 1);
        let len = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if self.sender.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.task_done();
            return Err(QueueError::Closed(self.name));
        }

        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.peak_len.fetch_max(len, Ordering::Relaxed);
        Ok(())
    }

    /// Takes the oldest item, or `None` once `cancel` fires
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<T> {
        let mut receiver = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            receiver = self.receiver.lock() => receiver,
        };
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            item = receiver.recv() => item?,
        };
        drop(receiver);

        self.pending.fetch_sub(1, Ordering::AcqRel);
        if let Some(capacity) = &self.capacity {
            capacity.add_permits(1);
        }
        self.total_dequeued.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Marks one previously dequeued item as fully processed
    pub fn task_done(&self) {
        self.unfinished.send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Items waiting to be dequeued
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items enqueued and not yet marked done
    #[must_use]
    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }

    /// Resolves once every item enqueued so far has been marked done
    pub async fn join(&self) {
        let mut unfinished = self.unfinished.subscribe();
        // the sender lives as long as the queue, so this cannot fail
        let _ = unfinished.wait_for(|count| *count == 0).await;
    }

    /// Rejects further enqueues and wakes producers waiting for a slot
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(capacity) = &self.capacity {
            capacity.close();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            name: self.name,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_dequeued: self.total_dequeued.load(Ordering::Relaxed),
            peak_len: self.peak_len.load(Ordering::Relaxed),
        }
    }
}

/// Traffic through one queue over its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub name: &'static str,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    /// Largest pending length observed; shows how far backpressure let the
    /// record queue grow
    pub peak_len: usize,
}
