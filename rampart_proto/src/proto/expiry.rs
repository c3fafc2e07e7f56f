//! The timer wheel backing per-request deadlines.
//!
//! Deadline registration must be cheap and cancellation idempotent: a
//! request that completes normally cancels a timer that may be firing on
//! the wheel's task at that very moment, and both sides must tolerate the
//! other winning. The wheel therefore runs as its own polled worker fed by
//! a command channel, so registrations and cancellations never contend on
//! the queue itself.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::task::{Context, Poll};
use futures::Stream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::time::delay_queue::{DelayQueue, Key};

use crate::error::NetworkError;

/// A deadline callback. Runs at most once, on the wheel worker's task.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one registered deadline. Cancelling through a stale handle
/// is a no-op.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerHandle {
    key: u64,
}

impl TimerHandle {
    pub fn new(key: u64) -> Self {
        Self { key }
    }

    pub fn key(&self) -> u64 {
        self.key
    }
}

/// A source of one-shot deadlines
pub trait TimerWheel: Send + Sync + 'static {
    /// Schedules `callback` to run once `delay` has elapsed
    fn register(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
    /// Deregisters a deadline. Idempotent; a handle whose callback already
    /// fired is silently ignored.
    fn cancel(&self, handle: &TimerHandle);
}

enum WheelCommand {
    Register {
        key: u64,
        delay: Duration,
        callback: TimerCallback,
    },
    Cancel {
        key: u64,
    },
    Shutdown,
}

/// Cheaply-cloneable handle to a [`DelayQueueWheelWorker`]
#[derive(Clone)]
pub struct DelayQueueWheel {
    tx: UnboundedSender<WheelCommand>,
    next_key: Arc<AtomicU64>,
}

impl DelayQueueWheel {
    /// Creates the wheel and its worker. The worker must be spawned onto
    /// the runtime for any deadline to fire.
    pub fn new() -> (Self, DelayQueueWheelWorker) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let wheel = Self {
            tx,
            next_key: Arc::new(AtomicU64::new(0)),
        };
        let worker = DelayQueueWheelWorker {
            entries: HashMap::new(),
            expirations: DelayQueue::new(),
            rx,
        };

        (wheel, worker)
    }

    /// Stops the worker. Pending deadlines are dropped without firing.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WheelCommand::Shutdown);
    }
}

impl TimerWheel for DelayQueueWheel {
    fn register(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        if self
            .tx
            .send(WheelCommand::Register {
                key,
                delay,
                callback,
            })
            .is_err()
        {
            log::warn!(target: "rampart", "Timer wheel worker is gone; deadline {key} will never fire");
        }

        TimerHandle { key }
    }

    fn cancel(&self, handle: &TimerHandle) {
        let _ = self.tx.send(WheelCommand::Cancel { key: handle.key });
    }
}

/// The polled half of the wheel. Drains commands, then fires whatever has
/// expired; completes when shut down or when every wheel handle is dropped.
pub struct DelayQueueWheelWorker {
    entries: HashMap<u64, (TimerCallback, Key)>,
    expirations: DelayQueue<u64>,
    rx: UnboundedReceiver<WheelCommand>,
}

impl Stream for DelayQueueWheelWorker {
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(WheelCommand::Register {
                    key,
                    delay,
                    callback,
                })) => {
                    let queue_key = this.expirations.insert(key, delay);
                    this.entries.insert(key, (callback, queue_key));
                }

                Poll::Ready(Some(WheelCommand::Cancel { key })) => {
                    if let Some((_callback, queue_key)) = this.entries.remove(&key) {
                        let _ = this.expirations.try_remove(&queue_key);
                    }
                }

                Poll::Ready(Some(WheelCommand::Shutdown)) | Poll::Ready(None) => {
                    return Poll::Ready(None)
                }

                Poll::Pending => break,
            }
        }

        while let Poll::Ready(Some(expired)) = this.expirations.poll_expired(cx) {
            let key = expired.into_inner();
            if let Some((callback, _queue_key)) = this.entries.remove(&key) {
                log::trace!(target: "rampart", "Deadline {key} elapsed; running its callback");
                callback();
            }
        }

        Poll::Pending
    }
}

impl Future for DelayQueueWheelWorker {
    type Output = Result<(), NetworkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match futures::ready!(Pin::new(&mut *self).poll_next(cx)) {
            Some(_) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            None => Poll::Ready(Ok(())),
        }
    }
}
