//! Bounded per-session outbound queue.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// What happens when a producer finds the queue full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the new frame and keep going.
    #[default]
    DropNewest,
    /// Wait for room. The producer stalls with the consumer.
    Block,
    /// Treat a full queue as a fatal slow consumer.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("outbound queue closed")]
    Closed,

    #[error("outbound queue full")]
    Overflow,
}

/// Producer side. Shared by the pumps of one session.
pub struct OutboundQueue {
    tx: mpsc::Sender<String>,
    closed: watch::Sender<bool>,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

/// Consumer side, owned by the outbound pump.
pub struct QueueReceiver {
    rx: mpsc::Receiver<String>,
    closed: watch::Receiver<bool>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, closed_rx) = watch::channel(false);
        let queue = Self {
            tx,
            closed,
            policy,
            dropped: AtomicU64::new(0),
        };
        (
            queue,
            QueueReceiver {
                rx,
                closed: closed_rx,
            },
        )
    }

    pub async fn enqueue(&self, frame: String) -> Result<Enqueued, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        match self.policy {
            OverflowPolicy::DropNewest => match self.tx.try_send(frame) {
                Ok(()) => Ok(Enqueued::Queued),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(Enqueued::Dropped)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
            },
            OverflowPolicy::Disconnect => match self.tx.try_send(frame) {
                Ok(()) => Ok(Enqueued::Queued),
                Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::Overflow),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
            },
            OverflowPolicy::Block => {
                let mut closed = self.closed.subscribe();
                tokio::select! {
                    res = self.tx.send(frame) => res
                        .map(|()| Enqueued::Queued)
                        .map_err(|_| QueueError::Closed),
                    _ = closed.wait_for(|closed| *closed) => Err(QueueError::Closed),
                }
            }
        }
    }

    /// Close the queue. Returns true only for the call that closed it.
    ///
    /// Frames already queued are still handed to the consumer.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Frames discarded under [`OverflowPolicy::DropNewest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl QueueReceiver {
    /// Next frame in enqueue order, or `None` once the queue is closed and drained.
    pub async fn next(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.wait_for(|closed| *closed) => self.rx.try_recv().ok(),
        }
    }
}
