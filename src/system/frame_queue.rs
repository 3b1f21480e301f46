//! Bounded frame queue with drop-oldest backpressure.
//!
//! When the queue is full, `push` evicts the oldest pending entry and enqueues
//! the new one, so the queue always holds the most recently pushed values.
//! An `outstanding` counter tracks values pushed but not yet reported done by
//! the consumer, which lets callers wait for the pipeline to go idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    DroppedOldest,
    Disconnected,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dropped_oldest: AtomicU64,
    outstanding: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dropped_oldest: u64,
}

pub struct FrameSender<T> {
    tx: Sender<T>,
    drop_rx: Receiver<T>,
    counters: Arc<QueueCounters>,
}

impl<T> FrameSender<T> {
    pub fn push(&self, value: T) -> PushOutcome {
        self.counters.outstanding.fetch_add(1, Ordering::SeqCst);
        let mut value = value;
        let mut evicted = false;
        loop {
            match self.tx.try_send(value) {
                Ok(()) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    return if evicted {
                        PushOutcome::DroppedOldest
                    } else {
                        PushOutcome::Enqueued
                    };
                }
                Err(TrySendError::Full(back)) => {
                    value = back;
                    match self.drop_rx.try_recv() {
                        Ok(_) => {
                            evicted = true;
                            self.counters.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                            self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
                        }
                        // The consumer drained between `Full` and the eviction; retry.
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => {
                            self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
                            return PushOutcome::Disconnected;
                        }
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
                    return PushOutcome::Disconnected;
                }
            }
        }
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Values pushed and neither evicted nor finished by the consumer.
    pub fn outstanding(&self) -> usize {
        self.counters.outstanding.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped_oldest: self.counters.dropped_oldest.load(Ordering::Relaxed),
        }
    }
}

pub struct FrameReceiver<T> {
    rx: Receiver<T>,
    counters: Arc<QueueCounters>,
}

impl<T> FrameReceiver<T> {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }

    /// Report one received value as fully handled.
    pub fn done(&self) {
        self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn frame_queue<T>(capacity: usize) -> (FrameSender<T>, FrameReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let counters = Arc::new(QueueCounters::default());
    let sender = FrameSender {
        tx,
        drop_rx: rx.clone(),
        counters: Arc::clone(&counters),
    };
    (sender, FrameReceiver { rx, counters })
}
