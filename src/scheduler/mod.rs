//! Background job scheduling.
//!
//! Jobs are tagged closures: queries may run in parallel, while
//! reconstructions are serialized upstream by the coordinator's scheduling
//! flag. The pooled scheduler is a bounded set of workers draining a FIFO
//! queue; the serial scheduler runs every job inline on the caller thread
//! and exists for testing and for tagged-delete support.

mod oneshot;

pub use oneshot::{promise, Promise, QueryFuture};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Query,
    Reconstruction,
}

/// A unit of background work.
pub struct Job {
    kind: JobKind,
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    pub fn new(kind: JobKind, run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            kind,
            run: Box::new(run),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    fn execute(self) {
        (self.run)();
    }
}

/// Counters describing scheduler activity.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    queries: AtomicU64,
    reconstructions: AtomicU64,
    dropped: AtomicU64,
    queue_high_water: AtomicU64,
}

impl SchedulerStats {
    fn record(&self, kind: JobKind) {
        match kind {
            JobKind::Query => self.queries.fetch_add(1, Ordering::Relaxed),
            JobKind::Reconstruction => self.reconstructions.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_depth(&self, depth: u64) {
        self.queue_high_water.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            reconstructions: self.reconstructions.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
        }
    }
}

/// Serializable point-in-time snapshot of scheduler activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub queries: u64,
    pub reconstructions: u64,
    pub dropped: u64,
    pub queue_high_water: u64,
}

/// Dispatches background jobs.
pub trait Scheduler: Send + Sync + 'static {
    /// Hand a job to the scheduler. Returns `false` if the scheduler has
    /// shut down and dropped the job (any promise inside resolves to an
    /// abort when the closure is dropped).
    fn dispatch(&self, job: Job) -> bool;

    /// Stop accepting work, drain queued jobs, and join the workers.
    fn shutdown(&self);

    fn stats(&self) -> SchedulerStatsSnapshot;
}

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
    stats: SchedulerStats,
}

/// A bounded worker pool draining a FIFO job queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            stats: SchedulerStats::default(),
        });

        let workers = (0..threads)
            .map(|idx| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("tephra-worker-{idx}"))
                    .spawn(move || Self::worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    fn worker_loop(shared: &PoolShared) {
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(job) = queue.pop_front() {
                        break job;
                    }
                    if shared.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    shared.available.wait(&mut queue);
                }
            };
            shared.stats.record(job.kind());
            job.execute();
        }
    }
}

impl Scheduler for WorkerPool {
    fn dispatch(&self, job: Job) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(kind = ?job.kind(), "job dropped after scheduler shutdown");
            return false;
        }
        let depth = {
            let mut queue = self.shared.queue.lock();
            queue.push_back(job);
            queue.len() as u64
        };
        self.shared.stats.record_depth(depth);
        self.shared.available.notify_one();
        true
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            // Take the lock so no worker misses the flag between its queue
            // check and its wait.
            let _queue = self.shared.queue.lock();
            self.shared.available.notify_all();
        }
        for worker in self.workers.lock().drain(..) {
            if let Err(panic) = worker.join() {
                tracing::error!(?panic, "worker thread panicked");
            }
        }
    }

    fn stats(&self) -> SchedulerStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs every job inline on the calling thread.
#[derive(Default)]
pub struct SerialScheduler {
    stats: SchedulerStats,
}

impl SerialScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for SerialScheduler {
    fn dispatch(&self, job: Job) -> bool {
        self.stats.record(job.kind());
        job.execute();
        true
    }

    fn shutdown(&self) {}

    fn stats(&self) -> SchedulerStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_pool_runs_jobs() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..64)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let (tx, rx) = promise();
                assert!(pool.dispatch(Job::new(JobKind::Query, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tx.fulfill(());
                })));
                rx
            })
            .collect();

        for future in futures {
            future.wait().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 64);

        let stats = pool.stats();
        assert_eq!(stats.queries, 64);
        assert_eq!(stats.reconstructions, 0);
        pool.shutdown();
    }

    #[test]
    fn test_pool_drains_queue_on_shutdown() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            assert!(pool.dispatch(Job::new(JobKind::Query, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_dispatch_after_shutdown_aborts_the_future() {
        let pool = WorkerPool::new(1);
        pool.shutdown();

        let (tx, rx) = promise::<()>();
        let accepted = pool.dispatch(Job::new(JobKind::Query, move || tx.fulfill(())));
        assert!(!accepted);
        assert!(rx.wait().is_err());
        assert_eq!(pool.stats().dropped, 1);
    }

    #[test]
    fn test_serial_scheduler_runs_inline() {
        let scheduler = SerialScheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        // The job has finished by the time dispatch returns.
        assert!(scheduler.dispatch(Job::new(JobKind::Reconstruction, move || {
            flag.store(true, Ordering::SeqCst);
        })));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.stats().reconstructions, 1);
    }

    #[test]
    fn test_stats_snapshot_serializes() {
        let scheduler = SerialScheduler::new();
        scheduler.dispatch(Job::new(JobKind::Query, || {}));
        let json = serde_json::to_string(&scheduler.stats()).unwrap();
        assert!(json.contains("\"queries\":1"));
    }
}
