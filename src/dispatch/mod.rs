//! Debounced, coalescing work dispatcher.
//!
//! Signals are keyed; repeated signals for one key collapse into the most
//! recent one, and a fixed pool of workers runs each key's work at most once
//! per throttle window.

pub mod key;
pub mod signal;
pub mod table;

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use crate::config::DispatcherConfig;
pub use key::{DispatchKey, ProjectId, SignalKey, UserId};
pub use signal::{DispatchOutcome, DispatchStatus, OutcomeFn, Work, WorkFuture, WorkSignal};
pub use table::ThrottleTable;

type SharedReceiver<K> = Arc<tokio::sync::Mutex<mpsc::Receiver<WorkSignal<K>>>>;
type Hooks<K> = Arc<parking_lot::Mutex<Vec<OutcomeFn<K>>>>;

/// Errors surfaced to dispatcher callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is closed")]
    Closed,

    #[error("dispatcher submission buffer is full")]
    Full,

    #[error("dispatcher already started")]
    AlreadyStarted,
}

/// Throttled worker pool keyed by `K`.
pub struct Dispatcher<K: DispatchKey> {
    cfg: DispatcherConfig,
    tx: mpsc::Sender<WorkSignal<K>>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<WorkSignal<K>>>>,
    table: Arc<ThrottleTable<K>>,
    hooks: Hooks<K>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<K: DispatchKey> Dispatcher<K> {
    /// Creates a dispatcher. Workers are not running until `start`.
    pub fn new(cfg: DispatcherConfig) -> Result<Self> {
        cfg.validate()?;

        let (tx, rx) = mpsc::channel(cfg.buffer_size);

        Ok(Self {
            table: Arc::new(ThrottleTable::new(cfg.window)),
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            hooks: Arc::new(parking_lot::Mutex::new(Vec::with_capacity(2))),
            workers: tokio::sync::Mutex::new(Vec::new()),
            cfg,
        })
    }

    /// Registers a callback invoked after every drained execution.
    pub fn on_outcome(&self, f: OutcomeFn<K>) {
        self.hooks.lock().push(f);
    }

    /// Enqueues a signal, waiting while the submission buffer is full.
    pub async fn submit(&self, signal: WorkSignal<K>) -> Result<(), DispatchError> {
        self.tx.send(signal).await.map_err(|_| DispatchError::Closed)
    }

    /// Enqueues a signal without waiting.
    pub fn try_submit(&self, signal: WorkSignal<K>) -> Result<(), DispatchError> {
        self.tx.try_send(signal).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::Full,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    /// Wraps `work` in a signal for `key` and submits it.
    pub async fn submit_work<F, Fut>(&self, key: K, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.submit(WorkSignal::new(key, work)).await
    }

    /// Launches the worker pool. Workers run until `ctx` is cancelled.
    pub async fn start(&self, ctx: CancellationToken) -> Result<(), DispatchError> {
        let rx = self.rx.lock().take().ok_or(DispatchError::AlreadyStarted)?;
        let rx: SharedReceiver<K> = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = self.workers.lock().await;
        for id in 0..self.cfg.pool_size {
            let worker = Worker {
                id,
                rx: Arc::clone(&rx),
                table: Arc::clone(&self.table),
                hooks: Arc::clone(&self.hooks),
                flush_on_shutdown: self.cfg.flush_on_shutdown,
            };
            workers.push(tokio::spawn(worker.run(ctx.clone())));
        }

        info!(
            pool_size = self.cfg.pool_size,
            buffer_size = self.cfg.buffer_size,
            window = ?self.cfg.window,
            flush_on_shutdown = self.cfg.flush_on_shutdown,
            "dispatcher started",
        );

        Ok(())
    }

    /// Waits for every worker to exit after cancellation.
    pub async fn wait_for_shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "dispatcher worker join failed");
            }
        }
    }

    /// Number of keys with pending work.
    pub fn pending_len(&self) -> usize {
        self.table.pending_len()
    }

    /// Number of keys the dispatcher has seen.
    pub fn tracked_keys(&self) -> usize {
        self.table.tracked_keys()
    }
}

struct Worker<K: DispatchKey> {
    id: usize,
    rx: SharedReceiver<K>,
    table: Arc<ThrottleTable<K>>,
    hooks: Hooks<K>,
    flush_on_shutdown: bool,
}

impl<K: DispatchKey> Worker<K> {
    async fn run(self, ctx: CancellationToken) {
        let window = self.table.window();
        let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut intake_open = true;

        loop {
            tokio::select! {
                biased;

                _ = ctx.cancelled() => {
                    if self.flush_on_shutdown {
                        self.flush().await;
                    }
                    debug!(worker = self.id, "dispatcher worker stopped");
                    return;
                }

                _ = ticker.tick() => {
                    self.drain_due().await;
                }

                signal = recv(&self.rx), if intake_open => {
                    match signal {
                        Some(signal) => {
                            let key = signal.key;
                            if self.table.insert(signal) {
                                debug!(worker = self.id, key = %key, "coalesced pending signal");
                            }
                        }
                        None => {
                            debug!(worker = self.id, "submission channel closed");
                            intake_open = false;
                        }
                    }
                }
            }
        }
    }

    async fn drain_due(&self) {
        for key in self.table.due_keys(Instant::now()) {
            // Fresh clock per key; the tick instant goes stale after missed
            // deadlines or slow work. Another worker may have taken the key.
            let Some(signal) = self.table.take_if_due(key, Instant::now()) else {
                continue;
            };
            self.execute(signal).await;
        }
    }

    async fn flush(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            while let Ok(signal) = rx.try_recv() {
                self.table.insert(signal);
            }
        }

        let pending = self.table.take_all_pending(Instant::now());
        if !pending.is_empty() {
            info!(worker = self.id, keys = pending.len(), "flushing pending work on shutdown");
        }

        for signal in pending {
            self.execute(signal).await;
        }
    }

    async fn execute(&self, signal: WorkSignal<K>) {
        let key = signal.key;
        let waited = signal.submitted_at.elapsed();
        let work = signal.into_work();
        let started = Instant::now();

        let status = match tokio::spawn(async move { work().await }).await {
            Ok(Ok(())) => DispatchStatus::Completed,
            Ok(Err(e)) => DispatchStatus::Failed(format!("{e:#}")),
            Err(e) if e.is_panic() => DispatchStatus::Panicked(panic_message(e.into_panic())),
            Err(e) => DispatchStatus::Failed(e.to_string()),
        };

        let outcome = DispatchOutcome {
            key,
            status,
            waited,
            elapsed: started.elapsed(),
        };

        match &outcome.status {
            DispatchStatus::Completed => {
                debug!(
                    worker = self.id,
                    key = %key,
                    waited = ?outcome.waited,
                    elapsed = ?outcome.elapsed,
                    "work completed",
                );
            }
            DispatchStatus::Failed(e) => {
                warn!(worker = self.id, key = %key, error = %e, "work failed");
            }
            DispatchStatus::Panicked(msg) => {
                error!(worker = self.id, key = %key, panic = %msg, "work panicked");
            }
        }

        let hooks = self.hooks.lock();
        for hook in hooks.iter() {
            hook(&outcome);
        }
    }
}

async fn recv<K>(rx: &SharedReceiver<K>) -> Option<WorkSignal<K>> {
    rx.lock().await.recv().await
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
