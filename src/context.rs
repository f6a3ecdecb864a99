use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;

/// Success/error counters accumulated by execution workers and drained by
/// the heartbeat supervisor. Increments and the periodic swap-to-zero are
/// both atomic, so no increment is ever lost across a heartbeat boundary.
#[derive(Debug, Default)]
pub struct RunCounters {
    successes: AtomicU64,
    errors: AtomicU64,
}

impl RunCounters {
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read both counters and reset them to zero.
    pub fn take(&self) -> (u64, u64) {
        (
            self.successes.swap(0, Ordering::Relaxed),
            self.errors.swap(0, Ordering::Relaxed),
        )
    }
}

/// Per-pool liveness flags. Each slot is written only by the worker that
/// owns it; the heartbeat supervisor reads all slots during drain.
#[derive(Debug)]
pub struct LivenessFlags {
    flags: Vec<AtomicBool>,
}

impl LivenessFlags {
    pub fn new(size: usize) -> Self {
        Self {
            flags: (0..size).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn set_running(&self, worker: usize, running: bool) {
        self.flags[worker].store(running, Ordering::Release);
    }

    pub fn is_running(&self, worker: usize) -> bool {
        self.flags[worker].load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| f.load(Ordering::Acquire))
            .count()
    }
}

/// Shared runtime state handed to every component at construction.
///
/// This replaces scattered process globals with a single explicit object:
/// the shutdown token is written once (by the signal handler) and read
/// everywhere, the counters and gauges are atomics, and each liveness slot
/// has exactly one writer.
pub struct RunnerContext {
    pub shutdown: CancellationToken,
    pub run_counters: RunCounters,
    pub retrievers_running: LivenessFlags,
    pub executors_running: LivenessFlags,
    pub busy_executors: AtomicI32,
    pub remote_inflight: AtomicUsize,
    pub metrics: Arc<Metrics>,
}

impl RunnerContext {
    pub fn new(
        shutdown: CancellationToken,
        get_workers: usize,
        run_workers: usize,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shutdown,
            run_counters: RunCounters::default(),
            retrievers_running: LivenessFlags::new(get_workers),
            executors_running: LivenessFlags::new(run_workers),
            busy_executors: AtomicI32::new(0),
            remote_inflight: AtomicUsize::new(0),
            metrics,
        })
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn remote_inflight_count(&self) -> usize {
        self.remote_inflight.load(Ordering::Acquire)
    }
}
