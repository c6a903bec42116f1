use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use super::domain::{JobId, JobPriority};
use super::scheduler::{RelayScheduler, SchedulerError};
use crate::error::error_response;

/// Router for job inspection and queue management.
pub fn relay_router(scheduler: Arc<RelayScheduler>) -> Router {
    Router::new()
        .route("/api/v1/relay/jobs/:job_id", get(job_handler))
        .route("/api/v1/relay/jobs/:job_id/cancel", post(cancel_handler))
        .route(
            "/api/v1/relay/jobs/:job_id/reschedule",
            post(reschedule_handler),
        )
        .route("/api/v1/relay/statistics", get(statistics_handler))
        .with_state(scheduler)
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub priority: JobPriority,
}

pub(crate) async fn job_handler(
    State(scheduler): State<Arc<RelayScheduler>>,
    Path(job_id): Path<String>,
) -> Response {
    match scheduler.get_job(&JobId(job_id)) {
        Ok(details) => (StatusCode::OK, axum::Json(details)).into_response(),
        Err(err) => scheduler_failure(err),
    }
}

pub(crate) async fn cancel_handler(
    State(scheduler): State<Arc<RelayScheduler>>,
    Path(job_id): Path<String>,
    body: Option<axum::Json<CancelRequest>>,
) -> Response {
    let reason = body.and_then(|axum::Json(request)| request.reason);
    match scheduler.cancel_job(&JobId(job_id), reason) {
        Ok(job) => {
            let payload = json!({
                "job_id": job.job_id,
                "status": job.status,
                "cancel_reason": job.cancel_reason,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => scheduler_failure(err),
    }
}

pub(crate) async fn reschedule_handler(
    State(scheduler): State<Arc<RelayScheduler>>,
    Path(job_id): Path<String>,
    axum::Json(request): axum::Json<RescheduleRequest>,
) -> Response {
    match scheduler.reschedule_job(&JobId(job_id), request.priority) {
        Ok(outcome) => (StatusCode::OK, axum::Json(outcome)).into_response(),
        Err(err) => scheduler_failure(err),
    }
}

pub(crate) async fn statistics_handler(State(scheduler): State<Arc<RelayScheduler>>) -> Response {
    (StatusCode::OK, axum::Json(scheduler.statistics())).into_response()
}

fn scheduler_failure(err: SchedulerError) -> Response {
    error_response(err.kind(), err.to_string())
}
