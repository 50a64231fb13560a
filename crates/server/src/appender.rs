//! Persistence appender
//!
//! Routed messages are handed to a fixed pool of workers through bounded
//! queues. A job is sharded to a worker by its conversation key, so appends
//! to one conversation are applied in submission order while different
//! conversations proceed in parallel. Every worker queue holds the full
//! configured capacity. Submitting never waits: a full queue drops the
//! append and counts it.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{ConversationKey, Message};
use crate::store::ConversationStore;

#[derive(Debug, Clone, Copy)]
pub struct AppenderConfig {
    /// Number of workers, each owning one queue
    pub workers: usize,
    /// Queued appends each worker holds before new ones for its
    /// conversations are dropped
    pub queue_capacity: usize,
}

impl Default for AppenderConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

struct AppendJob {
    key: ConversationKey,
    message: Message,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    // queued or currently being written
    pending: AtomicUsize,
}

/// Point-in-time view of the appender counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppenderSnapshot {
    pub submitted: u64,
    pub persisted: u64,
    pub failed: u64,
    pub dropped: u64,
    pub backlog: usize,
}

pub struct Appender {
    queues: RwLock<Option<Vec<mpsc::Sender<AppendJob>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Appender {
    /// Spawn the worker pool. Must be called from within a Tokio runtime.
    pub fn start(store: Arc<dyn ConversationStore>, config: AppenderConfig) -> Self {
        let worker_count = config.workers.max(1);
        let per_queue = config.queue_capacity.max(1);
        let counters = Arc::new(Counters::default());

        let mut queues = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(per_queue);
            queues.push(tx);
            workers.push(tokio::spawn(run_worker(
                index,
                rx,
                store.clone(),
                counters.clone(),
            )));
        }

        info!(
            "[Appender] Started {} worker(s) with {} queued append(s) each",
            worker_count, per_queue
        );

        Self {
            queues: RwLock::new(Some(queues)),
            workers: Mutex::new(workers),
            counters,
        }
    }

    /// Queue `message` for appending to `key`. Returns `false` when the
    /// append was dropped (queue full or appender shut down).
    pub fn submit(&self, key: ConversationKey, message: Message) -> bool {
        let queues = self.queues.read();
        let Some(queues) = queues.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[Appender] Shut down, dropping append for {} from {}",
                key,
                message.sender()
            );
            return false;
        };

        let shard = shard_for(&key, queues.len());
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        match queues[shard].try_send(AppendJob { key, message }) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[Appender] Queue {} unavailable, dropping append for {} from {}",
                    shard,
                    job.key,
                    job.message.sender()
                );
                false
            }
        }
    }

    pub fn snapshot(&self) -> AppenderSnapshot {
        AppenderSnapshot {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            backlog: self.counters.pending.load(Ordering::SeqCst),
        }
    }

    /// Wait until every accepted append has been written or has failed.
    pub async fn wait_idle(&self) {
        while self.counters.pending.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop accepting appends and wait for the workers to drain their queues.
    pub async fn shutdown(&self) {
        // dropping the senders lets each worker finish its backlog and exit
        let queues = self.queues.write().take();
        drop(queues);

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!("[Appender] Worker ended abnormally: {}", e);
            }
        }

        let snapshot = self.snapshot();
        info!(
            "[Appender] Drained: {} persisted, {} failed, {} dropped",
            snapshot.persisted, snapshot.failed, snapshot.dropped
        );
    }
}

fn shard_for(key: &ConversationKey, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<AppendJob>,
    store: Arc<dyn ConversationStore>,
    counters: Arc<Counters>,
) {
    while let Some(job) = rx.recv().await {
        match store.append(&job.key, &job.message).await {
            Ok(()) => {
                counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    "[Appender] Failed to persist message from {} to {}: {}",
                    job.message.sender(),
                    job.key,
                    e
                );
            }
        }
        counters.pending.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("[Appender] Worker {} stopped", index);
}
