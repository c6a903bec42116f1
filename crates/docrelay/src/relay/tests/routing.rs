use super::common::*;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, Request, StatusCode};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;

use crate::relay::domain::SubmitOptions;
use crate::relay::router::{job_handler, relay_router, statistics_handler};
use crate::relay::transport::LocalRelayTransport;

fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

#[tokio::test]
async fn job_handler_reports_queue_position() {
    let harness = harness();
    let (placement, tracking_number) =
        submit_tracked(&harness, permit("WP-1"), SubmitOptions::default()).await;

    let response = job_handler(
        State(harness.scheduler.clone()),
        Path(placement.job_id.0.clone()),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    assert_eq!(payload["job_id"], json!(placement.job_id.0));
    assert_eq!(payload["status"], "QUEUED");
    assert_eq!(payload["queue_position"], 1);
    assert_eq!(payload["tracking_number"], json!(tracking_number.0));
    assert_eq!(payload["document"]["reference"], "WP-1");
}

#[tokio::test]
async fn unknown_job_is_404() {
    let harness = harness();

    let response = relay_router(harness.scheduler.clone())
        .oneshot(
            Request::get("/api/v1/relay/jobs/RELAY-0-00000000-9")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let payload = read_json_body(response).await;
    assert_eq!(payload["error"]["kind"], "not_found");
}

#[tokio::test]
async fn cancel_route_accepts_missing_body_and_rejects_repeat() {
    let harness = harness();
    let (placement, _) = submit_tracked(&harness, permit("WP-1"), SubmitOptions::default()).await;
    let uri = format!("/api/v1/relay/jobs/{}/cancel", placement.job_id);

    let response = relay_router(harness.scheduler.clone())
        .oneshot(Request::post(&uri).body(Body::empty()).expect("request builds"))
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    assert_eq!(payload["status"], "CANCELLED");
    assert_eq!(payload["cancel_reason"], "User requested");

    let response = relay_router(harness.scheduler.clone())
        .oneshot(json_request(&uri, json!({ "reason": "again" })))
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let payload = read_json_body(response).await;
    assert_eq!(payload["error"]["kind"], "invalid_state");
}

#[tokio::test]
async fn reschedule_route_returns_new_position() {
    let harness = harness_with(single_relay(5_000), Arc::new(LocalRelayTransport));
    submit_tracked(&harness, permit("WP-1"), SubmitOptions::default()).await;
    let (placement, _) = submit_tracked(&harness, permit("WP-2"), SubmitOptions::default()).await;
    assert_eq!(placement.queue_position, 2);

    let response = relay_router(harness.scheduler.clone())
        .oneshot(json_request(
            &format!("/api/v1/relay/jobs/{}/reschedule", placement.job_id),
            json!({ "priority": "HIGH" }),
        ))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    assert_eq!(payload["new_position"], 1);
    assert_eq!(payload["priority"], "HIGH");
}

#[tokio::test]
async fn statistics_handler_lists_every_relay() {
    let harness = harness();

    let response = statistics_handler(State(harness.scheduler.clone())).await;

    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    assert_eq!(payload["relay_count"], 4);
    assert_eq!(payload["online_count"], 4);
    assert_eq!(payload["total_capacity"], 70_000);
    assert_eq!(payload["relays"][1]["id"], "GWP_MAIN");
}
