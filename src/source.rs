use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::metrics::Metrics;

/// One independently-addressable target instance within the installation.
/// Ephemeral: produced by the discovery loop, consumed once by exactly one
/// retrieval worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Site {
    pub url: String,
}

/// Instance status as reported by the executor. Fetched fresh every
/// discovery cycle, never cached.
///
/// `disabled` is `0` (enabled), `1` (disabled indefinitely), or a future
/// epoch-seconds timestamp at which the instance re-enables itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub multisite: bool,
    pub site_url: String,
    pub disabled: i64,
}

#[derive(Debug, Deserialize)]
struct RawInstanceInfo {
    multisite: i64,
    siteurl: String,
    disabled: i64,
}

/// A single due scheduled event, identified by `(url, timestamp, action,
/// instance)`. Uniqueness is the executor's responsibility; events flow
/// from retrieval to execution exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub url: String,
    pub timestamp: i64,
    pub action: String,
    pub instance: String,
}

/// Adapter boundary over the external executor. The production
/// implementation shells out; tests provide stubs.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn instance_status(&self) -> Result<InstanceStatus>;

    /// List sites to poll. Multisite listings are uniformly shuffled so no
    /// site is systematically favored by listing order.
    async fn list_sites(&self, status: &InstanceStatus) -> Result<Vec<Site>>;

    async fn list_due_jobs(&self, site_url: &str) -> Result<Vec<Job>>;

    async fn run_job(&self, job: &Job) -> Result<()>;

    /// Best-effort orchestration heartbeat; errors are the caller's to
    /// ignore.
    async fn notify_heartbeat(&self, interval_secs: u64) -> Result<()> {
        let _ = interval_secs;
        Ok(())
    }
}

/// `JobSource` implemented over the external command-line executor.
///
/// Every invocation appends the fixed trailing arguments (install path,
/// quiet and elevated-privilege flags, optional network id) to the caller's
/// subcommand. Structured responses arrive as JSON on stdout; errors are a
/// non-zero exit with diagnostics on stderr, which is logged and never
/// parsed.
pub struct CliJobSource {
    config: RunnerConfig,
    metrics: Arc<Metrics>,
}

impl CliJobSource {
    pub fn new(config: RunnerConfig, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    async fn run_cli(&self, subcommand: &[String]) -> Result<String> {
        let mut args: Vec<String> = subcommand.to_vec();
        // --quiet keeps the executor from polluting the JSON output.
        args.push("--allow-root".to_string());
        args.push("--quiet".to_string());
        args.push(format!("--path={}", self.config.install_path.display()));
        if self.config.network_id > 0 {
            args.push(format!("--network={}", self.config.network_id));
        }

        let started = Instant::now();
        let output = Command::new(&self.config.cli_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        let duration = started.elapsed();

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            tracing::warn!(
                command = %args.join(" "),
                stderr,
                "Executor wrote to stderr"
            );
        }

        // Usage is recorded even when the invocation failed.
        let (user_cpu, sys_cpu, max_rss) = child_rusage();
        self.metrics.record_executor_usage(
            output.status.success(),
            duration,
            user_cpu,
            sys_cpu,
            max_rss,
        );

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            if self.config.debug {
                tracing::debug!(
                    command = %args.join(" "),
                    stdout = %stdout,
                    "Executor invocation failed"
                );
            }
            return Err(RunnerError::ExecutorFailed {
                code: output.status.code(),
            });
        }

        Ok(stdout)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, raw: &str) -> Result<T> {
        serde_json::from_str(raw).map_err(|e| {
            if self.config.debug {
                tracing::debug!(error = %e, payload = raw, "Malformed executor response");
            }
            RunnerError::MalformedResponse(e)
        })
    }
}

#[async_trait]
impl JobSource for CliJobSource {
    async fn instance_status(&self) -> Result<InstanceStatus> {
        let raw = self
            .run_cli(&to_args(&[
                "cron-control",
                "orchestrate",
                "runner-only",
                "get-info",
                "--format=json",
            ]))
            .await?;

        let mut infos: Vec<RawInstanceInfo> = self.decode(&raw)?;
        let info = infos.pop().ok_or_else(|| {
            RunnerError::Internal("executor returned an empty instance-info list".to_string())
        })?;

        Ok(InstanceStatus {
            multisite: info.multisite == 1,
            site_url: info.siteurl,
            disabled: info.disabled,
        })
    }

    async fn list_sites(&self, status: &InstanceStatus) -> Result<Vec<Site>> {
        if !status.multisite {
            return Ok(vec![Site {
                url: status.site_url.clone(),
            }]);
        }

        let subcommand = if self.config.smart_site_list {
            to_args(&["cron-control", "orchestrate", "sites", "list"])
        } else {
            to_args(&[
                "site",
                "list",
                "--fields=url",
                "--archived=false",
                "--deleted=false",
                "--spam=false",
                "--format=json",
            ])
        };

        let raw = self.run_cli(&subcommand).await?;
        let mut sites: Vec<Site> = self.decode(&raw)?;

        shuffle_sites(&mut sites);
        Ok(sites)
    }

    async fn list_due_jobs(&self, site_url: &str) -> Result<Vec<Job>> {
        let raw = self
            .run_cli(&[
                "cron-control".to_string(),
                "orchestrate".to_string(),
                "runner-only".to_string(),
                "list-due-batch".to_string(),
                format!("--url={}", site_url),
                "--format=json".to_string(),
            ])
            .await?;

        self.decode(&raw)
    }

    async fn run_job(&self, job: &Job) -> Result<()> {
        self.run_cli(&[
            "cron-control".to_string(),
            "orchestrate".to_string(),
            "runner-only".to_string(),
            "run".to_string(),
            format!("--timestamp={}", job.timestamp),
            format!("--action={}", job.action),
            format!("--instance={}", job.instance),
            format!("--url={}", job.url),
        ])
        .await?;
        Ok(())
    }

    async fn notify_heartbeat(&self, interval_secs: u64) -> Result<()> {
        self.run_cli(&[
            "cron-control".to_string(),
            "orchestrate".to_string(),
            "sites".to_string(),
            "heartbeat".to_string(),
            format!("--heartbeat-interval={}", interval_secs),
        ])
        .await?;
        Ok(())
    }
}

/// Uniformly permute the site list so no site is systematically favored by
/// listing order.
fn shuffle_sites(sites: &mut [Site]) {
    sites.shuffle(&mut rand::thread_rng());
}

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Cumulative resource usage of reaped child processes: user CPU seconds,
/// system CPU seconds, and peak RSS in bytes. Per-child accounting is not
/// portably available through `tokio::process`, so the cumulative counters
/// are sampled after every invocation.
fn child_rusage() -> (f64, f64, f64) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
    if rc != 0 {
        return (0.0, 0.0, 0.0);
    }

    let user = usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1e6;
    let sys = usage.ru_stime.tv_sec as f64 + usage.ru_stime.tv_usec as f64 / 1e6;
    // ru_maxrss is kilobytes on Linux.
    let max_rss = usage.ru_maxrss as f64 * 1024.0;
    (user, sys, max_rss)
}
