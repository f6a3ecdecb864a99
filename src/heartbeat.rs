use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::RunnerContext;
use crate::epoch::EpochScheduler;
use crate::pipeline::{JobMsg, SiteMsg};
use crate::source::JobSource;

/// Cadence used purely to observe the shutdown flag when heartbeat
/// reporting is disabled.
const DISABLED_FALLBACK_SECS: u64 = 60;

/// Bounded drain: at most this many iterations, three seconds apart.
const DRAIN_MAX_ITERATIONS: u32 = 30;
const DRAIN_PAUSE: Duration = Duration::from_secs(3);

/// Emits periodic health counters and owns the shutdown drain.
///
/// With a zero interval the supervisor reports nothing but still waits on a
/// fallback cadence so it can observe the shutdown flag and run the drain.
pub struct HeartbeatSupervisor {
    ctx: Arc<RunnerContext>,
    source: Arc<dyn JobSource>,
    scheduler: Arc<EpochScheduler>,
    interval_secs: u64,
    smart_site_list: bool,
    sites_tx: mpsc::Sender<SiteMsg>,
    jobs_tx: mpsc::Sender<JobMsg>,
}

impl HeartbeatSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<RunnerContext>,
        source: Arc<dyn JobSource>,
        scheduler: Arc<EpochScheduler>,
        interval_secs: u64,
        smart_site_list: bool,
        sites_tx: mpsc::Sender<SiteMsg>,
        jobs_tx: mpsc::Sender<JobMsg>,
    ) -> Self {
        Self {
            ctx,
            source,
            scheduler,
            interval_secs,
            smart_site_list,
            sites_tx,
            jobs_tx,
        }
    }

    /// Run heartbeat ticks until shutdown is requested, then drain every
    /// pool. Returns once the drain completes; the caller exits the
    /// process.
    pub async fn run(self) {
        if self.interval_secs == 0 {
            tracing::info!("Heartbeat disabled");
            loop {
                let completed = self
                    .scheduler
                    .wait_for_epoch("heartbeat", DISABLED_FALLBACK_SECS)
                    .await;
                if !completed || self.ctx.shutdown_requested() {
                    tracing::info!("Exiting heartbeat supervisor");
                    break;
                }
            }
        } else {
            loop {
                let completed = self
                    .scheduler
                    .wait_for_epoch("heartbeat", self.interval_secs)
                    .await;
                if !completed || self.ctx.shutdown_requested() {
                    tracing::info!("Exiting heartbeat supervisor");
                    break;
                }

                if self.smart_site_list {
                    // Best-effort; the orchestrated backend tracks runner
                    // liveness from this call.
                    if let Err(e) = self.source.notify_heartbeat(self.interval_secs).await {
                        tracing::debug!(error = %e, "Orchestrate heartbeat failed");
                    }
                }

                let (succeeded, errored) = self.ctx.run_counters.take();
                tracing::info!(
                    events_succeeded_since_last = succeeded,
                    events_errored_since_last = errored,
                    "heartbeat"
                );
            }
        }

        self.drain().await;
    }

    /// Unblock every worker still inside its loop so it can observe the
    /// shutdown flag, and wait for remote-triggered jobs to finish. Bounded
    /// by an iteration ceiling so a hung worker cannot stall exit forever.
    pub async fn drain(&self) {
        for iteration in 0..DRAIN_MAX_ITERATIONS {
            let mut still_running = false;

            for worker_id in 0..self.ctx.retrievers_running.len() {
                if self.ctx.retrievers_running.is_running(worker_id) {
                    tracing::info!(worker_id, "Event retriever still running, sending drain");
                    // try_send: if the channel is full the worker has input
                    // to consume already and will see the flag.
                    let _ = self.sites_tx.try_send(SiteMsg::Drain);
                    still_running = true;
                }
            }

            for worker_id in 0..self.ctx.executors_running.len() {
                if self.ctx.executors_running.is_running(worker_id) {
                    tracing::info!(worker_id, "Event worker still running, sending drain");
                    let _ = self.jobs_tx.try_send(JobMsg::Drain);
                    still_running = true;
                }
            }

            let remote = self.ctx.remote_inflight_count();
            if remote > 0 {
                tracing::info!(remote_inflight = remote, "Remote-triggered jobs still running");
                still_running = true;
            }

            if !still_running {
                break;
            }

            tracing::info!(iteration, "Worker(s) still running, waiting");
            tokio::time::sleep(DRAIN_PAUSE).await;
        }

        tracing::info!("Drain complete, exiting");
    }
}
