use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::context::RunnerContext;
use crate::source::{Job, JobSource};

/// Remote trigger intake: accepts externally-triggered job runs and feeds
/// them through the same execution path as scheduled jobs. Started only
/// when a shared-secret token is configured; requests carry the token as a
/// bearer credential. In-flight runs are tracked so the shutdown drain
/// waits for them.
#[derive(Clone)]
pub struct RemoteState {
    pub ctx: Arc<RunnerContext>,
    pub source: Arc<dyn JobSource>,
    pub token: String,
}

#[derive(Deserialize)]
struct RunJobRequest {
    url: String,
    timestamp: i64,
    action: String,
    instance: String,
}

#[derive(Serialize)]
struct RunJobResponse {
    success: bool,
    error: Option<String>,
}

pub async fn run_remote_listener(addr: SocketAddr, state: RemoteState) {
    let app = Router::new()
        .route("/v1/run", post(run_job_handler))
        .with_state(state);

    tracing::info!(addr = %addr, "Starting remote trigger listener");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind remote trigger listener");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Remote trigger listener failed");
    }
}

async fn run_job_handler(
    State(state): State<RemoteState>,
    headers: HeaderMap,
    Json(payload): Json<RunJobRequest>,
) -> impl IntoResponse {
    if !token_matches(&headers, &state.token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(RunJobResponse {
                success: false,
                error: Some("invalid token".to_string()),
            }),
        );
    }

    if state.ctx.shutdown_requested() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RunJobResponse {
                success: false,
                error: Some("runner is draining".to_string()),
            }),
        );
    }

    let job = Job {
        url: payload.url,
        timestamp: payload.timestamp,
        action: payload.action,
        instance: payload.instance,
    };

    state.ctx.remote_inflight.fetch_add(1, Ordering::AcqRel);
    let result = state.source.run_job(&job).await;
    state.ctx.remote_inflight.fetch_sub(1, Ordering::AcqRel);

    match result {
        Ok(()) => {
            tracing::info!(site = %job.url, action = %job.action, "Remote-triggered job finished");
            (
                StatusCode::OK,
                Json(RunJobResponse {
                    success: true,
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::warn!(site = %job.url, action = %job.action, error = %e, "Remote-triggered job failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(RunJobResponse {
                    success: false,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

fn token_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == expected)
}
