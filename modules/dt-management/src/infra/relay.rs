//! Bounded queue drained by a fixed pool of workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Processes one relayed item.
#[async_trait]
pub trait RelayHandler<T>: Send + Sync + 'static {
    async fn handle(&self, item: T);
}

/// Non-blocking producer side over a bounded queue and `workers` consumers.
///
/// Items offered while the queue is full are dropped and counted. Workers only run after
/// [`BoundedRelay::start`]; until then offered items just fill the queue.
pub struct BoundedRelay<T> {
    name: &'static str,
    tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    handler: Arc<dyn RelayHandler<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

impl<T: Send + 'static> BoundedRelay<T> {
    #[must_use]
    pub fn new(
        name: &'static str,
        capacity: usize,
        worker_count: usize,
        handler: Arc<dyn RelayHandler<T>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            handler,
            workers: Mutex::new(Vec::new()),
            worker_count: worker_count.max(1),
            dropped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the worker pool; later calls are no-ops.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() || self.tx.lock().is_none() {
            return;
        }
        for worker in 0..self.worker_count {
            let rx = Arc::clone(&self.rx);
            let handler = Arc::clone(&self.handler);
            let cancel = self.cancel.clone();
            let name = self.name;
            workers.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => None,
                            item = rx.recv() => item,
                        }
                    };
                    let Some(item) = next else { break };
                    handler.handle(item).await;
                }
                tracing::trace!(relay = name, worker, "relay worker stopped");
            }));
        }
        tracing::debug!(relay = self.name, workers = self.worker_count, "relay started");
    }

    /// Offers an item without waiting. Returns `false` if it was dropped.
    pub fn offer(&self, item: T) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            tracing::warn!(relay = self.name, "relay is shut down, dropping message");
            return false;
        };
        match tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(relay = self.name, "relay queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(relay = self.name, "relay queue closed, dropping message");
                false
            }
        }
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting items, lets workers drain for up to `grace`, then force-stops
    /// them. Returns the number of items left undelivered.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        drop(self.tx.lock().take());
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());

        if !workers.is_empty() {
            let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
            if tokio::time::timeout(grace, futures::future::join_all(workers))
                .await
                .is_err()
            {
                tracing::debug!(relay = self.name, "drain grace expired, stopping workers");
                self.cancel.cancel();
                for abort in aborts {
                    abort.abort();
                }
            }
        }
        self.cancel.cancel();

        let leftover = self.rx.lock().await.len();
        if leftover > 0 {
            tracing::warn!(relay = self.name, leftover, "relay stopped with undelivered messages");
        } else {
            tracing::debug!(relay = self.name, "relay drained");
        }
        leftover
    }
}
