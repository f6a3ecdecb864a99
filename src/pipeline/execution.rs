use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use crate::context::RunnerContext;
use crate::epoch::EpochScheduler;
use crate::pipeline::{JobMsg, SharedReceiver, RUN_EVENTS_PACING_SECS};
use crate::source::JobSource;

/// Pool of workers that execute due jobs from the fan-in jobs channel.
///
/// A job whose due timestamp is still in the future is "premature": it is
/// skipped without running (it will be re-discovered on a later retrieval
/// cycle) and is visible only as a metrics outcome. Executed jobs are
/// followed by an epoch-aligned pacing gate that counts as busy time, so
/// the saturation gauges reflect real achievable throughput per worker.
pub struct EventExecutionPool {
    ctx: Arc<RunnerContext>,
    source: Arc<dyn JobSource>,
    scheduler: Arc<EpochScheduler>,
    heartbeat_enabled: bool,
}

impl EventExecutionPool {
    pub fn new(
        ctx: Arc<RunnerContext>,
        source: Arc<dyn JobSource>,
        scheduler: Arc<EpochScheduler>,
        heartbeat_enabled: bool,
    ) -> Self {
        Self {
            ctx,
            source,
            scheduler,
            heartbeat_enabled,
        }
    }

    /// Spawn one task per configured execution worker.
    pub fn spawn(&self, jobs_rx: SharedReceiver<JobMsg>) -> Vec<JoinHandle<()>> {
        (0..self.ctx.executors_running.len())
            .map(|worker_id| {
                let ctx = Arc::clone(&self.ctx);
                let source = Arc::clone(&self.source);
                let scheduler = Arc::clone(&self.scheduler);
                let jobs_rx = Arc::clone(&jobs_rx);
                let heartbeat_enabled = self.heartbeat_enabled;
                tokio::spawn(async move {
                    execution_worker(worker_id, ctx, source, scheduler, jobs_rx, heartbeat_enabled)
                        .await;
                })
            })
            .collect()
    }
}

async fn execution_worker(
    worker_id: usize,
    ctx: Arc<RunnerContext>,
    source: Arc<dyn JobSource>,
    scheduler: Arc<EpochScheduler>,
    jobs_rx: SharedReceiver<JobMsg>,
    heartbeat_enabled: bool,
) {
    let pool_size = ctx.executors_running.len() as i32;
    ctx.executors_running.set_running(worker_id, true);
    tracing::info!(worker_id, "Started event worker");

    loop {
        let msg = { jobs_rx.lock().await.recv().await };
        let Some(msg) = msg else {
            break;
        };

        if ctx.shutdown_requested() {
            break;
        }
        let JobMsg::Job(job) = msg else {
            // Drain control message.
            break;
        };

        let t0 = Instant::now();
        if job.timestamp > unix_now() {
            tracing::debug!(
                worker_id,
                site = %job.url,
                action = %job.action,
                timestamp = job.timestamp,
                "Skipping premature job"
            );
            ctx.metrics
                .record_run_event(&job.url, "premature", t0.elapsed());
            continue;
        }

        let busy = ctx.busy_executors.fetch_add(1, Ordering::AcqRel) + 1;
        ctx.metrics.record_run_worker_stats(busy, pool_size);

        match source.run_job(&job).await {
            Ok(()) => {
                ctx.metrics.record_run_event(&job.url, "ok", t0.elapsed());
                if heartbeat_enabled {
                    ctx.run_counters.record_success();
                }
                tracing::debug!(
                    worker_id,
                    site = %job.url,
                    action = %job.action,
                    instance = %job.instance,
                    "Finished job"
                );
            }
            Err(e) => {
                ctx.metrics.record_run_event(&job.url, "error", t0.elapsed());
                if heartbeat_enabled {
                    ctx.run_counters.record_error();
                }
                tracing::warn!(
                    worker_id,
                    site = %job.url,
                    action = %job.action,
                    error = %e,
                    "Job run failed"
                );
            }
        }

        // Pacing counts as busy time; the worker cannot take another job
        // while it waits here.
        scheduler
            .wait_for_epoch("run-events", RUN_EVENTS_PACING_SECS)
            .await;

        let busy = ctx.busy_executors.fetch_sub(1, Ordering::AcqRel) - 1;
        ctx.metrics.record_run_worker_stats(busy, pool_size);

        if ctx.shutdown_requested() {
            break;
        }
    }

    tracing::info!(worker_id, "Exiting event worker");
    ctx.executors_running.set_running(worker_id, false);
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the UNIX epoch")
        .as_secs() as i64
}
