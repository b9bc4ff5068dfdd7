use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::message::Message;
use crate::sender::SenderManager;

const DEFAULT_CAPACITY: usize = 50;
const DEFAULT_WORKERS: usize = 2;

type Queue = Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>;

/// Outcome of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Queue at capacity
    Full,
    /// Intake closed by `stop`
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of the dispatcher counters
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: usize,
    pub workers: usize,
    pub accepted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Bounded intake queue drained by a fixed pool of workers.
///
/// `submit` never blocks: a full or closed queue drops the message and
/// counts it. Each worker hands messages to the [`SenderManager`] one at a
/// time, so messages taken by the same worker keep their enqueue order.
/// Ordering across workers is undefined.
pub struct Dispatcher {
    intake: Mutex<Option<mpsc::Sender<Message>>>,
    queue: Queue,
    manager: Arc<SenderManager>,
    capacity: usize,
    workers: usize,
    tracker: TaskTracker,
    counters: Arc<Counters>,
}

impl Dispatcher {
    /// Zero `capacity` or `workers` fall back to 50 and 2.
    pub fn new(capacity: usize, workers: usize, manager: Arc<SenderManager>) -> Self {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        let (tx, rx) = mpsc::channel(capacity);

        Self {
            intake: Mutex::new(Some(tx)),
            queue: Arc::new(tokio::sync::Mutex::new(rx)),
            manager,
            capacity,
            workers,
            tracker: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn from_config(config: &DispatcherConfig, manager: Arc<SenderManager>) -> Self {
        Self::new(config.capacity(), config.workers(), manager)
    }

    /// Launch the worker pool. Workers exit when `cancel` fires or the
    /// queue is closed and drained.
    pub fn start(&self, cancel: CancellationToken) {
        for id in 0..self.workers {
            self.tracker.spawn(worker(
                id,
                self.queue.clone(),
                self.manager.clone(),
                cancel.clone(),
                self.counters.clone(),
            ));
        }
        info!(
            workers = self.workers,
            capacity = self.capacity,
            "Dispatcher started"
        );
    }

    /// Enqueue without waiting. Drops the message when the queue is full or closed.
    pub fn submit(&self, message: Message) -> Submission {
        let intake = lock(&self.intake);
        let Some(tx) = intake.as_ref() else {
            return self.dropped(&message, DropReason::Closed);
        };

        match tx.try_send(message) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Submission::Queued
            }
            Err(TrySendError::Full(message)) => self.dropped(&message, DropReason::Full),
            Err(TrySendError::Closed(message)) => self.dropped(&message, DropReason::Closed),
        }
    }

    fn dropped(&self, message: &Message, reason: DropReason) -> Submission {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            platform = %message.platform,
            excerpt = message.excerpt(),
            reason = ?reason,
            "Message dropped"
        );
        Submission::Dropped(reason)
    }

    /// Close intake, then wait for every worker to drain the queue and exit.
    /// Safe to call again if an earlier call was abandoned (e.g. by a timeout).
    pub async fn stop(&self) {
        lock(&self.intake).take();
        self.tracker.close();
        self.tracker.wait().await;
        info!(stats = ?self.stats(), "Dispatcher stopped");
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            workers: self.workers,
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn worker(
    id: usize,
    queue: Queue,
    manager: Arc<SenderManager>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        // The queue lock is released before delivery starts.
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            message = async { queue.lock().await.recv().await } => message,
        };
        let Some(message) = next else {
            debug!(worker = id, "Dispatcher worker exiting");
            return;
        };

        debug!(
            worker = id,
            platform = %message.platform,
            excerpt = message.excerpt(),
            "Dispatching message"
        );

        match manager.send(&message, &cancel).await {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                info!(worker = id, platform = %message.platform, "Message sent");
            }
            Err(e) if e.is_cancelled() && cancel.is_cancelled() => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker = id,
                    platform = %message.platform,
                    excerpt = message.excerpt(),
                    "Delivery abandoned at shutdown"
                );
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker = id,
                    platform = %message.platform,
                    excerpt = message.excerpt(),
                    error = %e,
                    "Failed to send message"
                );
            }
        }
    }
}
