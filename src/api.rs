use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker, health::HealthChecker, preferences::PreferenceGate,
        store::NotificationStore,
    },
    metrics::{DEFAULT_REPORT_WINDOW_HOURS, MetricsObserver},
    models::{
        channel::Channel, circuit_breaker::ChannelBreakerStatus, health::HealthStatus,
        response::ApiResponse,
    },
    queue::{EnqueueError, EnqueueRequest, QueueFrontEnd},
    webhooks::{self, OptOutEvent, ProviderStatusEvent},
};

const DEFAULT_FAILED_LIMIT: i64 = 50;
const MAX_REPORT_WINDOW_HOURS: i64 = 24 * 90;

pub struct AppState {
    pub health_checker: HealthChecker,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: MetricsObserver,
    pub queue: Arc<QueueFrontEnd>,
    pub store: Arc<dyn NotificationStore>,
    pub preferences: PreferenceGate,
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct FailedQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: Option<Uuid>,
    pub batched: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusApplied {
    pub applied: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/breakers", get(breaker_status))
        .route("/notifications", post(queue_notification))
        .route("/metrics/delivery", get(delivery_report))
        .route("/failed", get(list_failed))
        .route("/failed/{id}/retry", post(retry_failed))
        .route("/webhooks/status", post(status_webhook))
        .route("/webhooks/opt-out", post(opt_out_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(state: Arc<AppState>, port: u16) -> Result<()> {
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "API server started");

    axum::serve(listener, app).await?;

    Ok(())
}

fn failure(status: StatusCode, error: impl Into<String>, message: &str) -> Response {
    (status, Json(ApiResponse::<()>::error(error, message))).into_response()
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn breaker_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status: HashMap<Channel, ChannelBreakerStatus> = state.breaker.get_status();
    Json(ApiResponse::success(status, "Circuit breaker status"))
}

async fn queue_notification(
    State(state): State<Arc<AppState>>,
    Json(input): Json<EnqueueRequest>,
) -> Response {
    match state.queue.queue_notification(input).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(
                JobAccepted {
                    job_id,
                    batched: job_id.is_none(),
                },
                "Notification queued",
            )),
        )
            .into_response(),
        Err(EnqueueError::Queue(e)) => {
            error!(error = %e, "Enqueue failed");
            failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string(), "Queue unavailable")
        }
        Err(e) => failure(StatusCode::UNPROCESSABLE_ENTITY, e.to_string(), "Invalid notification request"),
    }
}

async fn delivery_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let hours = query.hours.unwrap_or(DEFAULT_REPORT_WINDOW_HOURS);
    let window = match chrono::Duration::try_hours(hours) {
        Some(window) if (1..=MAX_REPORT_WINDOW_HOURS).contains(&hours) => window,
        _ => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("hours must be between 1 and {}", MAX_REPORT_WINDOW_HOURS),
                "Invalid report window",
            );
        }
    };

    match state.metrics.delivery_report(window).await {
        Ok(report) => Json(ApiResponse::success(report, "Delivery report")).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to build delivery report");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "Report unavailable")
        }
    }
}

async fn list_failed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FailedQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_FAILED_LIMIT).clamp(1, 500);

    match state.metrics.unresolved_failures(limit).await {
        Ok(failed) => Json(ApiResponse::success(failed, "Unresolved failed notifications")).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list failed notifications");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "Listing unavailable")
        }
    }
}

async fn retry_failed(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_failed(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return failure(StatusCode::NOT_FOUND, format!("{} not found", id), "Unknown failed notification"),
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "Lookup failed"),
    }

    match state.metrics.retry_failed(id).await {
        Ok(job_id) => Json(ApiResponse::success(
            JobAccepted {
                job_id,
                batched: false,
            },
            "Failed notification re-enqueued",
        ))
        .into_response(),
        Err(e) => failure(StatusCode::CONFLICT, e.to_string(), "Retry rejected"),
    }
}

async fn status_webhook(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ProviderStatusEvent>,
) -> Response {
    if webhooks::parse_provider_status(&event.status).is_none() {
        return failure(StatusCode::BAD_REQUEST, format!("unsupported status '{}'", event.status), "Invalid status");
    }

    match webhooks::apply_status_update(state.store.as_ref(), event).await {
        Ok(applied) => Json(ApiResponse::success(StatusApplied { applied }, "Status processed")).into_response(),
        Err(e) => {
            error!(error = %e, "Status webhook failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "Status update failed")
        }
    }
}

async fn opt_out_webhook(
    State(state): State<Arc<AppState>>,
    Json(event): Json<OptOutEvent>,
) -> Response {
    match webhooks::record_opt_out(&state.preferences, event).await {
        Ok(()) => Json(ApiResponse::success((), "Opt-out recorded")).into_response(),
        Err(e) => failure(StatusCode::BAD_REQUEST, e.to_string(), "Opt-out rejected"),
    }
}
