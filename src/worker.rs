//! Resolution worker pool.
//!
//! Each worker owns a bounded queue. Tasks are routed by hashing the record
//! key, so tasks for one key run in submission order while distinct keys
//! resolve in parallel. Failures are logged and counted; they never reach the
//! writer whose event produced the task.

use crate::config::WorkerConfig;
use crate::engine::{MasterResolutionEngine, ResolutionTask};
use crate::error::{MdmError, Result};
use crate::model::RecordKey;
use crate::sync::{CancelToken, TaskContext};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Counters exposed for tests and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn current(&self) -> usize {
        *self.count.lock()
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Decrements the pending count even if a task panics
struct PendingGuard<'a>(&'a Pending);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

struct Worker {
    index: usize,
    engine: Arc<MasterResolutionEngine>,
    cancel: CancelToken,
    timeout: Duration,
    pending: Arc<Pending>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl Worker {
    fn run(self, rx: Receiver<ResolutionTask>) {
        debug!(worker = self.index, "resolution worker started");
        for task in rx.iter() {
            let _pending = PendingGuard(&self.pending);
            let ctx = TaskContext::new(self.cancel.clone(), self.timeout);
            match self.engine.run(&task, &ctx) {
                Ok(outcome) => {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                    trace!(worker = self.index, key = %task.key(), ?outcome, "task done");
                }
                Err(MdmError::Cancelled) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(worker = self.index, key = %task.key(), "task cancelled");
                }
                Err(err) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        worker = self.index,
                        key = %task.key(),
                        error = %err,
                        "resolution failed; record left for reconciliation"
                    );
                }
            }
        }
        debug!(worker = self.index, "resolution worker stopped");
    }
}

/// Fixed pool of resolution threads
pub struct ResolutionWorkers {
    engine: Arc<MasterResolutionEngine>,
    senders: RwLock<Option<Vec<Sender<ResolutionTask>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancelToken,
    pending: Arc<Pending>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl ResolutionWorkers {
    pub fn start(engine: Arc<MasterResolutionEngine>, config: &WorkerConfig) -> Result<Self> {
        let cancel = CancelToken::new();
        let pending = Arc::new(Pending::default());
        let completed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let mut senders = Vec::with_capacity(config.worker_count);
        let mut handles = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let (tx, rx) = crossbeam_channel::bounded(config.queue_capacity);
            let worker = Worker {
                index,
                engine: Arc::clone(&engine),
                cancel: cancel.clone(),
                timeout: config.task_timeout(),
                pending: Arc::clone(&pending),
                completed: Arc::clone(&completed),
                failed: Arc::clone(&failed),
            };
            let handle = thread::Builder::new()
                .name(format!("mdm-resolver-{index}"))
                .spawn(move || worker.run(rx))
                .map_err(|e| {
                    MdmError::Configuration(format!("failed to start resolution worker: {e}"))
                })?;
            senders.push(tx);
            handles.push(handle);
        }
        info!(workers = config.worker_count, "resolution workers started");

        Ok(Self {
            engine,
            senders: RwLock::new(Some(senders)),
            handles: Mutex::new(handles),
            cancel,
            pending,
            completed,
            failed,
        })
    }

    /// Queue a task without blocking the caller
    pub fn enqueue(&self, task: ResolutionTask) -> Result<()> {
        let senders = self.senders.read();
        let Some(senders) = senders.as_ref() else {
            return Err(MdmError::QueueClosed);
        };
        let key = task.key();
        let index = route(&key, senders.len());

        self.engine.mark_enqueued(key);
        self.pending.increment();
        match senders[index].try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.pending.decrement();
                warn!(%key, worker = index, "resolution queue full");
                Err(MdmError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.pending.decrement();
                Err(MdmError::QueueClosed)
            }
        }
    }

    /// Block until every queued task has finished or `timeout` passes
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pending.wait_idle(timeout)
    }

    pub fn is_running(&self) -> bool {
        self.senders.read().is_some()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.pending.current(),
        }
    }

    /// Stop accepting work and drain within `grace`.
    ///
    /// Work still queued after the grace period is cancelled; it stays
    /// unlinked and is picked up by the next reconciliation. Returns whether
    /// the queues drained cleanly.
    pub fn shutdown(&self, grace: Duration) -> bool {
        let Some(senders) = self.senders.write().take() else {
            return true;
        };
        drop(senders);

        let drained = self.pending.wait_idle(grace);
        if !drained {
            warn!(
                pending = self.pending.current(),
                "shutdown grace expired; cancelling remaining resolution work"
            );
            self.cancel.cancel();
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                error!("resolution worker panicked");
            }
        }
        info!(drained, "resolution workers stopped");
        drained
    }
}

impl Drop for ResolutionWorkers {
    fn drop(&mut self) {
        self.senders.write().take();
        self.cancel.cancel();
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn route(key: &RecordKey, workers: usize) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % workers.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_is_stable_and_in_range() {
        let key = RecordKey::new();
        let first = route(&key, 4);
        assert!(first < 4);
        for _ in 0..10 {
            assert_eq!(route(&key, 4), first);
        }
        assert_eq!(route(&key, 1), 0);
    }

    #[test]
    fn test_pending_wait_idle() {
        let pending = Arc::new(Pending::default());
        pending.increment();
        assert!(!pending.wait_idle(Duration::from_millis(5)));

        let releaser = {
            let pending = Arc::clone(&pending);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                pending.decrement();
            })
        };
        assert!(pending.wait_idle(Duration::from_secs(5)));
        releaser.join().unwrap();
    }
}
