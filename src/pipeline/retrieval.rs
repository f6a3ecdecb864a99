use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::RunnerContext;
use crate::pipeline::{JobMsg, SharedReceiver, SiteMsg, GET_EVENTS_BREAK_SECS};
use crate::source::JobSource;

/// Pool of workers that turn discovered sites into due jobs.
///
/// Workers share one receiver; each site reaches exactly one worker. A
/// worker exits when it receives a `Drain` control message or observes the
/// shutdown flag, clearing its liveness slot on the way out.
pub struct EventRetrievalPool {
    ctx: Arc<RunnerContext>,
    source: Arc<dyn JobSource>,
}

impl EventRetrievalPool {
    pub fn new(ctx: Arc<RunnerContext>, source: Arc<dyn JobSource>) -> Self {
        Self { ctx, source }
    }

    /// Spawn one task per configured retrieval worker.
    pub fn spawn(
        &self,
        sites_rx: SharedReceiver<SiteMsg>,
        jobs_tx: mpsc::Sender<JobMsg>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.ctx.retrievers_running.len())
            .map(|worker_id| {
                let ctx = Arc::clone(&self.ctx);
                let source = Arc::clone(&self.source);
                let sites_rx = Arc::clone(&sites_rx);
                let jobs_tx = jobs_tx.clone();
                tokio::spawn(async move {
                    retrieval_worker(worker_id, ctx, source, sites_rx, jobs_tx).await;
                })
            })
            .collect()
    }
}

async fn retrieval_worker(
    worker_id: usize,
    ctx: Arc<RunnerContext>,
    source: Arc<dyn JobSource>,
    sites_rx: SharedReceiver<SiteMsg>,
    jobs_tx: mpsc::Sender<JobMsg>,
) {
    ctx.retrievers_running.set_running(worker_id, true);
    tracing::info!(worker_id, "Started event retriever");

    'outer: loop {
        let msg = { sites_rx.lock().await.recv().await };
        let Some(msg) = msg else {
            break;
        };

        if ctx.shutdown_requested() {
            break;
        }
        let SiteMsg::Site(site) = msg else {
            // Drain control message.
            break;
        };

        tracing::debug!(worker_id, site = %site.url, "Retrieving due events");

        let t0 = Instant::now();
        match source.list_due_jobs(&site.url).await {
            Ok(jobs) => {
                ctx.metrics
                    .record_get_site_events(&site.url, true, t0.elapsed(), jobs.len());
                for mut job in jobs {
                    // Honor a shutdown request mid-batch; the remainder is
                    // re-discovered on a later cycle.
                    if ctx.shutdown_requested() {
                        break 'outer;
                    }
                    job.url = site.url.clone();
                    if jobs_tx.send(JobMsg::Job(job)).await.is_err() {
                        tracing::warn!(worker_id, "Jobs channel closed, exiting event retriever");
                        break 'outer;
                    }
                }
            }
            Err(e) => {
                ctx.metrics
                    .record_get_site_events(&site.url, false, t0.elapsed(), 0);
                tracing::warn!(worker_id, site = %site.url, error = %e, "Due-event fetch failed");
            }
        }

        tokio::time::sleep(Duration::from_secs(GET_EVENTS_BREAK_SECS)).await;
    }

    tracing::info!(worker_id, "Exiting event retriever");
    ctx.retrievers_running.set_running(worker_id, false);
}
