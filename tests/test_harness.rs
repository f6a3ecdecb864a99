//! Shared fixtures for integration tests: an in-memory `JobSource` stub and
//! context construction helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cron_runner::context::RunnerContext;
use cron_runner::epoch::EpochScheduler;
use cron_runner::error::{Result, RunnerError};
use cron_runner::metrics::Metrics;
use cron_runner::source::{InstanceStatus, Job, JobSource, Site};

/// In-memory `JobSource` so pipeline tests run without a subprocess.
pub struct StubSource {
    pub status: InstanceStatus,
    pub due_jobs: Mutex<HashMap<String, Vec<Job>>>,
    pub executed: Mutex<Vec<Job>>,
    pub fail_status: bool,
    pub fail_runs: bool,
    pub heartbeats: AtomicUsize,
}

impl StubSource {
    pub fn single_site(url: &str) -> Self {
        Self {
            status: InstanceStatus {
                multisite: false,
                site_url: url.to_string(),
                disabled: 0,
            },
            due_jobs: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            fail_status: false,
            fail_runs: false,
            heartbeats: AtomicUsize::new(0),
        }
    }

    pub fn with_due_jobs(self, site_url: &str, jobs: Vec<Job>) -> Self {
        self.due_jobs
            .lock()
            .unwrap()
            .insert(site_url.to_string(), jobs);
        self
    }

    pub fn executed_jobs(&self) -> Vec<Job> {
        self.executed.lock().unwrap().clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::Acquire)
    }
}

#[async_trait]
impl JobSource for StubSource {
    async fn instance_status(&self) -> Result<InstanceStatus> {
        if self.fail_status {
            return Err(RunnerError::ExecutorFailed { code: Some(1) });
        }
        Ok(self.status.clone())
    }

    async fn list_sites(&self, status: &InstanceStatus) -> Result<Vec<Site>> {
        Ok(vec![Site {
            url: status.site_url.clone(),
        }])
    }

    async fn list_due_jobs(&self, site_url: &str) -> Result<Vec<Job>> {
        // Each batch is handed out once, like a real due-event queue.
        Ok(self
            .due_jobs
            .lock()
            .unwrap()
            .remove(site_url)
            .unwrap_or_default())
    }

    async fn run_job(&self, job: &Job) -> Result<()> {
        if self.fail_runs {
            return Err(RunnerError::ExecutorFailed { code: Some(1) });
        }
        self.executed.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn notify_heartbeat(&self, _interval_secs: u64) -> Result<()> {
        self.heartbeats.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Build a runner context plus the token and scheduler wired to it.
pub fn test_runtime(
    get_workers: usize,
    run_workers: usize,
) -> (Arc<RunnerContext>, CancellationToken, Arc<EpochScheduler>) {
    let token = CancellationToken::new();
    let ctx = RunnerContext::new(
        token.clone(),
        get_workers,
        run_workers,
        Arc::new(Metrics::new()),
    );
    let scheduler = Arc::new(EpochScheduler::new(token.clone()));
    (ctx, token, scheduler)
}

pub fn due_job(action: &str, timestamp: i64) -> Job {
    Job {
        url: String::new(),
        timestamp,
        action: action.to_string(),
        instance: "1".to_string(),
    }
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
