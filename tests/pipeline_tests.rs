//! End-to-end pipeline tests against the in-memory stub source:
//! - a due job flows discovery → retrieval → execution exactly once,
//!   with and without the discovery loop driving the sites channel;
//! - a failed status fetch is counted and publishes nothing;
//! - a shutdown request mid-batch stops further publishing;
//! - premature jobs are filtered without touching the counters;
//! - per-job failures are counted and never halt the pool.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use cron_runner::pipeline::{
    self, EventExecutionPool, EventRetrievalPool, JobMsg, SiteDiscoveryLoop, SiteMsg,
};
use cron_runner::source::Site;
use test_harness::{due_job, test_runtime, unix_now, wait_until, StubSource};

const SITE: &str = "https://example.com";

#[tokio::test]
async fn due_job_is_retrieved_and_executed_exactly_once() {
    let (ctx, token, scheduler) = test_runtime(1, 1);
    let source = Arc::new(
        StubSource::single_site(SITE).with_due_jobs(SITE, vec![due_job("a", unix_now() - 10)]),
    );

    let (sites_tx, sites_rx) = pipeline::channel();
    let (jobs_tx, jobs_rx) = pipeline::channel();

    EventRetrievalPool::new(Arc::clone(&ctx), source.clone()).spawn(sites_rx, jobs_tx);
    EventExecutionPool::new(Arc::clone(&ctx), source.clone(), scheduler, true).spawn(jobs_rx);

    sites_tx
        .send(SiteMsg::Site(Site {
            url: SITE.to_string(),
        }))
        .await
        .unwrap();

    let executed = wait_until(Duration::from_secs(5), || {
        !source.executed_jobs().is_empty()
    })
    .await;
    assert!(executed, "job should have been executed");

    let jobs = source.executed_jobs();
    assert_eq!(jobs.len(), 1, "executed exactly once");
    assert_eq!(jobs[0].url, SITE, "job tagged with the originating site URL");
    assert_eq!(jobs[0].action, "a");
    assert_eq!(jobs[0].instance, "1");

    // Success was counted for the next heartbeat.
    assert!(
        wait_until(Duration::from_secs(1), || {
            let (ok, err) = ctx.run_counters.take();
            ok == 1 && err == 0
        })
        .await
    );

    token.cancel();
}

#[tokio::test]
async fn discovery_publishes_the_primary_site_and_the_job_runs_end_to_end() {
    let (ctx, token, scheduler) = test_runtime(1, 1);
    let source = Arc::new(
        StubSource::single_site(SITE)
            .with_due_jobs(SITE, vec![due_job("scheduled", unix_now() - 10)]),
    );

    let (sites_tx, sites_rx) = pipeline::channel();
    let (jobs_tx, jobs_rx) = pipeline::channel();

    let discovery = SiteDiscoveryLoop::new(
        Arc::clone(&ctx),
        source.clone(),
        Arc::clone(&scheduler),
        1,
        sites_tx,
    );
    tokio::spawn(async move { discovery.run().await });
    EventRetrievalPool::new(Arc::clone(&ctx), source.clone()).spawn(sites_rx, jobs_tx);
    EventExecutionPool::new(Arc::clone(&ctx), source.clone(), scheduler, true).spawn(jobs_rx);

    // A 1-second discovery interval wakes within a few seconds (epoch delta
    // plus the phase offset); the site then flows through both pools with no
    // manual channel sends.
    assert!(
        wait_until(Duration::from_secs(10), || {
            !source.executed_jobs().is_empty()
        })
        .await,
        "discovery should feed the job to execution"
    );

    let jobs = source.executed_jobs();
    assert_eq!(jobs.len(), 1, "executed exactly once");
    assert_eq!(jobs[0].url, SITE, "job carries the instance's primary URL");

    token.cancel();
}

#[tokio::test]
async fn status_fetch_failure_publishes_no_sites_and_is_counted() {
    let (ctx, token, scheduler) = test_runtime(1, 1);
    let mut source = StubSource::single_site(SITE);
    source.fail_status = true;
    let source = Arc::new(source);

    let (sites_tx, sites_rx) = pipeline::channel();

    let discovery = SiteDiscoveryLoop::new(Arc::clone(&ctx), source, scheduler, 1, sites_tx);
    tokio::spawn(async move { discovery.run().await });

    assert!(
        wait_until(Duration::from_secs(10), || {
            ctx.metrics
                .encode()
                .contains("cron_runner_get_sites_total{outcome=\"error\"}")
        })
        .await,
        "failed status fetch should be counted as an error cycle"
    );
    assert!(
        sites_rx.lock().await.try_recv().is_err(),
        "no site may be published when the status fetch fails"
    );

    token.cancel();
}

#[tokio::test]
async fn shutdown_mid_batch_stops_publishing_remaining_jobs() {
    let (ctx, token, _scheduler) = test_runtime(1, 1);
    let batch: Vec<_> = (0..4)
        .map(|i| due_job(&format!("job-{}", i), unix_now() - 10))
        .collect();
    let source = Arc::new(StubSource::single_site(SITE).with_due_jobs(SITE, batch));

    let (sites_tx, sites_rx) = pipeline::channel();
    let (jobs_tx, jobs_rx) = pipeline::channel();

    EventRetrievalPool::new(Arc::clone(&ctx), source).spawn(sites_rx, jobs_tx);

    sites_tx
        .send(SiteMsg::Site(Site {
            url: SITE.to_string(),
        }))
        .await
        .unwrap();

    // With no consumer the capacity-1 jobs channel fills after the first
    // publish and the worker blocks on the next send.
    tokio::time::sleep(Duration::from_millis(300)).await;
    token.cancel();

    let mut received = 0;
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), async {
            jobs_rx.lock().await.recv().await
        })
        .await;
        match msg {
            Ok(Some(JobMsg::Job(_))) => received += 1,
            _ => break,
        }
    }

    assert!(
        received < 4,
        "the rest of the batch must not be published after shutdown, got {}",
        received
    );
    assert!(
        wait_until(Duration::from_secs(2), || {
            ctx.retrievers_running.running_count() == 0
        })
        .await,
        "retrieval worker should exit"
    );
}

#[tokio::test]
async fn premature_job_is_never_executed() {
    let (ctx, token, scheduler) = test_runtime(1, 1);
    let source = Arc::new(
        StubSource::single_site(SITE)
            .with_due_jobs(SITE, vec![due_job("future", unix_now() + 3_600)]),
    );

    let (sites_tx, sites_rx) = pipeline::channel();
    let (jobs_tx, jobs_rx) = pipeline::channel();

    EventRetrievalPool::new(Arc::clone(&ctx), source.clone()).spawn(sites_rx, jobs_tx);
    EventExecutionPool::new(Arc::clone(&ctx), source.clone(), scheduler, true).spawn(jobs_rx);

    sites_tx
        .send(SiteMsg::Site(Site {
            url: SITE.to_string(),
        }))
        .await
        .unwrap();

    // The premature outcome shows up in metrics; nothing else moves.
    assert!(
        wait_until(Duration::from_secs(5), || {
            ctx.metrics.encode().contains("outcome=\"premature\"")
        })
        .await
    );
    assert!(source.executed_jobs().is_empty());
    assert_eq!(ctx.run_counters.take(), (0, 0));

    token.cancel();
}

#[tokio::test]
async fn failed_job_increments_error_counter_and_pool_survives() {
    let (ctx, token, scheduler) = test_runtime(1, 1);
    let mut source = StubSource::single_site(SITE)
        .with_due_jobs(SITE, vec![due_job("boom", unix_now() - 10)]);
    source.fail_runs = true;
    let source = Arc::new(source);

    let (sites_tx, sites_rx) = pipeline::channel();
    let (jobs_tx, jobs_rx) = pipeline::channel();

    EventRetrievalPool::new(Arc::clone(&ctx), source.clone()).spawn(sites_rx, jobs_tx);
    EventExecutionPool::new(Arc::clone(&ctx), source.clone(), scheduler, true).spawn(jobs_rx);

    sites_tx
        .send(SiteMsg::Site(Site {
            url: SITE.to_string(),
        }))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            let (_, err) = ctx.run_counters.take();
            err == 1
        })
        .await,
        "failure should be counted"
    );

    // The worker is still in its loop after the failure.
    assert_eq!(ctx.executors_running.running_count(), 1);

    token.cancel();
}

#[tokio::test]
async fn drain_control_message_stops_a_retrieval_worker() {
    let (ctx, _token, _scheduler) = test_runtime(1, 1);
    let source = Arc::new(StubSource::single_site(SITE));

    let (sites_tx, sites_rx) = pipeline::channel();
    let (jobs_tx, _jobs_rx) = pipeline::channel();

    EventRetrievalPool::new(Arc::clone(&ctx), source).spawn(sites_rx, jobs_tx);

    assert!(
        wait_until(Duration::from_secs(2), || {
            ctx.retrievers_running.running_count() == 1
        })
        .await
    );

    sites_tx.send(SiteMsg::Drain).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            ctx.retrievers_running.running_count() == 0
        })
        .await,
        "drain message should stop the worker"
    );
}
