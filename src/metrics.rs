use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Router};
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics for the runner. The registry owns every collector and
/// exposes them via `encode()`; fields exist so call sites can record
/// observations directly.
pub struct Metrics {
    registry: Registry,

    pub get_sites_total: CounterVec,
    pub get_sites_duration: Histogram,

    pub get_site_events_total: CounterVec,
    pub get_site_events_duration: HistogramVec,
    pub events_retrieved_total: CounterVec,

    pub run_events_total: CounterVec,
    pub run_event_duration: HistogramVec,

    pub busy_run_workers: Gauge,
    pub run_worker_pool_size: Gauge,

    pub executor_invocations_total: CounterVec,
    pub executor_duration_seconds: Histogram,
    pub executor_user_cpu_seconds: Gauge,
    pub executor_sys_cpu_seconds: Gauge,
    pub executor_max_rss_bytes: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let get_sites_total = CounterVec::new(
            Opts::new("cron_runner_get_sites_total", "Site-discovery cycles"),
            &["outcome"],
        )
        .unwrap();
        registry.register(Box::new(get_sites_total.clone())).unwrap();

        let get_sites_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cron_runner_get_sites_duration_seconds",
                "Site-discovery fetch duration",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .unwrap();
        registry
            .register(Box::new(get_sites_duration.clone()))
            .unwrap();

        let get_site_events_total = CounterVec::new(
            Opts::new(
                "cron_runner_get_site_events_total",
                "Due-event list fetches per site",
            ),
            &["site", "outcome"],
        )
        .unwrap();
        registry
            .register(Box::new(get_site_events_total.clone()))
            .unwrap();

        let get_site_events_duration = HistogramVec::new(
            HistogramOpts::new(
                "cron_runner_get_site_events_duration_seconds",
                "Due-event list fetch duration per site",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["site"],
        )
        .unwrap();
        registry
            .register(Box::new(get_site_events_duration.clone()))
            .unwrap();

        let events_retrieved_total = CounterVec::new(
            Opts::new(
                "cron_runner_events_retrieved_total",
                "Due events retrieved per site",
            ),
            &["site"],
        )
        .unwrap();
        registry
            .register(Box::new(events_retrieved_total.clone()))
            .unwrap();

        let run_events_total = CounterVec::new(
            Opts::new("cron_runner_run_events_total", "Event run outcomes"),
            &["site", "outcome"],
        )
        .unwrap();
        registry.register(Box::new(run_events_total.clone())).unwrap();

        let run_event_duration = HistogramVec::new(
            HistogramOpts::new(
                "cron_runner_run_event_duration_seconds",
                "Event run duration per site",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["site"],
        )
        .unwrap();
        registry
            .register(Box::new(run_event_duration.clone()))
            .unwrap();

        let busy_run_workers = Gauge::new(
            "cron_runner_busy_run_workers",
            "Execution workers currently busy",
        )
        .unwrap();
        registry.register(Box::new(busy_run_workers.clone())).unwrap();

        let run_worker_pool_size = Gauge::new(
            "cron_runner_run_worker_pool_size",
            "Configured execution worker count",
        )
        .unwrap();
        registry
            .register(Box::new(run_worker_pool_size.clone()))
            .unwrap();

        let executor_invocations_total = CounterVec::new(
            Opts::new(
                "cron_runner_executor_invocations_total",
                "Executor subprocess invocations",
            ),
            &["outcome"],
        )
        .unwrap();
        registry
            .register(Box::new(executor_invocations_total.clone()))
            .unwrap();

        let executor_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "cron_runner_executor_duration_seconds",
                "Executor subprocess wall time",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )
        .unwrap();
        registry
            .register(Box::new(executor_duration_seconds.clone()))
            .unwrap();

        let executor_user_cpu_seconds = Gauge::new(
            "cron_runner_executor_user_cpu_seconds",
            "Cumulative user CPU time of executor children",
        )
        .unwrap();
        registry
            .register(Box::new(executor_user_cpu_seconds.clone()))
            .unwrap();

        let executor_sys_cpu_seconds = Gauge::new(
            "cron_runner_executor_sys_cpu_seconds",
            "Cumulative system CPU time of executor children",
        )
        .unwrap();
        registry
            .register(Box::new(executor_sys_cpu_seconds.clone()))
            .unwrap();

        let executor_max_rss_bytes = Gauge::new(
            "cron_runner_executor_max_rss_bytes",
            "Peak resident set size observed across executor children",
        )
        .unwrap();
        registry
            .register(Box::new(executor_max_rss_bytes.clone()))
            .unwrap();

        Metrics {
            registry,
            get_sites_total,
            get_sites_duration,
            get_site_events_total,
            get_site_events_duration,
            events_retrieved_total,
            run_events_total,
            run_event_duration,
            busy_run_workers,
            run_worker_pool_size,
            executor_invocations_total,
            executor_duration_seconds,
            executor_user_cpu_seconds,
            executor_sys_cpu_seconds,
            executor_max_rss_bytes,
        }
    }

    pub fn record_get_sites(&self, success: bool, duration: Duration) {
        self.get_sites_total
            .with_label_values(&[outcome_label(success)])
            .inc();
        self.get_sites_duration.observe(duration.as_secs_f64());
    }

    pub fn record_get_site_events(
        &self,
        site: &str,
        success: bool,
        duration: Duration,
        count: usize,
    ) {
        self.get_site_events_total
            .with_label_values(&[site, outcome_label(success)])
            .inc();
        self.get_site_events_duration
            .with_label_values(&[site])
            .observe(duration.as_secs_f64());
        self.events_retrieved_total
            .with_label_values(&[site])
            .inc_by(count as f64);
    }

    /// `outcome` is one of `ok`, `error`, or `premature`.
    pub fn record_run_event(&self, site: &str, outcome: &str, duration: Duration) {
        self.run_events_total
            .with_label_values(&[site, outcome])
            .inc();
        self.run_event_duration
            .with_label_values(&[site])
            .observe(duration.as_secs_f64());
    }

    pub fn record_run_worker_stats(&self, busy: i32, pool_size: i32) {
        self.busy_run_workers.set(f64::from(busy));
        self.run_worker_pool_size.set(f64::from(pool_size));
    }

    pub fn record_executor_usage(
        &self,
        success: bool,
        duration: Duration,
        user_cpu_secs: f64,
        sys_cpu_secs: f64,
        max_rss_bytes: f64,
    ) {
        self.executor_invocations_total
            .with_label_values(&[outcome_label(success)])
            .inc();
        self.executor_duration_seconds.observe(duration.as_secs_f64());
        self.executor_user_cpu_seconds.set(user_cpu_secs);
        self.executor_sys_cpu_seconds.set(sys_cpu_secs);
        self.executor_max_rss_bytes.set(max_rss_bytes);
    }

    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

fn outcome_label(success: bool) -> &'static str {
    if success {
        "ok"
    } else {
        "error"
    }
}

/// Serve `GET /metrics` on the given address. Runs until the listener fails;
/// callers spawn this as a task.
pub async fn serve_metrics(addr: SocketAddr, metrics: Arc<Metrics>) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    tracing::info!(addr = %addr, "Starting metrics server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind metrics server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Metrics server failed");
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.encode()
}
