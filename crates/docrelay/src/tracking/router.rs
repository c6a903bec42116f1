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

use super::domain::{SearchCriteria, TrackingNumber, TrackingStage, UpdateContext};
use super::ledger::{LedgerError, TrackingLedger};
use crate::error::{error_response, ErrorKind};

/// Router exposing tracking lookups and administrative stage overrides.
pub fn tracking_router(ledger: Arc<TrackingLedger>) -> Router {
    Router::new()
        .route("/api/v1/tracking/:tracking_number", get(tracking_handler))
        .route(
            "/api/v1/tracking/:tracking_number/history",
            get(history_handler),
        )
        .route(
            "/api/v1/tracking/:tracking_number/update",
            post(update_handler),
        )
        .route("/api/v1/trackings", get(active_handler))
        .route("/api/v1/trackings/search", post(search_handler))
        .with_state(ledger)
}

#[derive(Debug, Deserialize)]
pub struct StageUpdateRequest {
    pub stage: TrackingStage,
    #[serde(flatten)]
    pub context: UpdateContext,
}

pub(crate) async fn tracking_handler(
    State(ledger): State<Arc<TrackingLedger>>,
    Path(tracking_number): Path<String>,
) -> Response {
    match ledger.get_tracking(&TrackingNumber(tracking_number)) {
        Ok(snapshot) => (StatusCode::OK, axum::Json(snapshot)).into_response(),
        Err(err) => ledger_failure(err),
    }
}

pub(crate) async fn history_handler(
    State(ledger): State<Arc<TrackingLedger>>,
    Path(tracking_number): Path<String>,
) -> Response {
    match ledger.get_history(&TrackingNumber(tracking_number)) {
        Ok(history) => (StatusCode::OK, axum::Json(history)).into_response(),
        Err(err) => ledger_failure(err),
    }
}

pub(crate) async fn update_handler(
    State(ledger): State<Arc<TrackingLedger>>,
    Path(tracking_number): Path<String>,
    axum::Json(request): axum::Json<StageUpdateRequest>,
) -> Response {
    let tracking_number = TrackingNumber(tracking_number);
    match ledger.update_status(&tracking_number, request.stage, request.context) {
        Ok(record) => {
            let payload = json!({
                "tracking_number": record.tracking_number,
                "current_stage": record.current_stage,
                "progress_percentage": record.progress_percentage,
                "last_updated": record.last_updated,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => ledger_failure(err),
    }
}

pub(crate) async fn active_handler(State(ledger): State<Arc<TrackingLedger>>) -> Response {
    match ledger.get_all_active() {
        Ok(active) => {
            let payload = json!({
                "count": active.len(),
                "trackings": active,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => ledger_failure(err),
    }
}

pub(crate) async fn search_handler(
    State(ledger): State<Arc<TrackingLedger>>,
    axum::Json(criteria): axum::Json<SearchCriteria>,
) -> Response {
    if criteria.is_empty() {
        return error_response(
            ErrorKind::InvalidRequest,
            "provide document_reference, subject_name or phone_number",
        );
    }
    match ledger.search(&criteria) {
        Ok(results) => {
            let payload = json!({
                "count": results.len(),
                "results": results,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => ledger_failure(err),
    }
}

fn ledger_failure(err: LedgerError) -> Response {
    error_response(err.kind(), err.to_string())
}
