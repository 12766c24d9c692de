// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, blocking hand-off between pollers and the downstream consumer.
//!
//! `push` waits while the queue is full. That wait is the backpressure that
//! throttles polling: the poll loop does not issue its next request until every
//! record of the current batch has been accepted.

use crate::errors::QueueClosed;
use crate::record::Record;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

#[async_trait]
pub trait Queue: Send + Sync {
    /// Hands a record downstream, waiting for room when the queue is full.
    async fn push(&self, record: Record) -> Result<(), QueueClosed>;

    /// Records currently waiting to be consumed.
    fn size(&self) -> usize;

    fn capacity(&self) -> usize;

    /// Producers currently parked in [`Queue::push`].
    fn blocked_producers(&self) -> usize;
}

/// Producer side of the bounded queue; cheap to clone, one per poller.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Record>,
    capacity: usize,
    blocked: Arc<AtomicUsize>,
}

/// Consumer side of the bounded queue.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<Record>,
}

pub struct BoundedQueue;

impl BoundedQueue {
    /// Creates a queue holding at most `capacity` records (at least one).
    #[allow(clippy::new_ret_no_self)]
    #[must_use]
    pub fn new(capacity: usize) -> (QueueHandle, QueueReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let handle = QueueHandle {
            tx,
            capacity,
            blocked: Arc::new(AtomicUsize::new(0)),
        };
        (handle, QueueReceiver { rx })
    }
}

/// Keeps the blocked-producer gauge right even when a parked push is cancelled.
struct BlockedGuard<'a>(&'a AtomicUsize);

impl<'a> BlockedGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Queue for QueueHandle {
    async fn push(&self, record: Record) -> Result<(), QueueClosed> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(QueueClosed),
            Err(TrySendError::Full(record)) => {
                let _guard = BlockedGuard::enter(&self.blocked);
                self.tx.send(record).await.map_err(|_| QueueClosed)
            }
        }
    }

    fn size(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn blocked_producers(&self) -> usize {
        self.blocked.load(Ordering::Relaxed)
    }
}

impl QueueReceiver {
    /// Waits for the next record; `None` once every producer is gone and the queue drained.
    pub async fn recv(&mut self) -> Option<Record> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Record> {
        self.rx.try_recv().ok()
    }

    /// Stops accepting new records; pushes fail with [`QueueClosed`] afterwards.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
