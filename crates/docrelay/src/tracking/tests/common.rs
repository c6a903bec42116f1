use std::sync::Arc;

use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::clock::ManualClock;
use crate::tracking::domain::{
    CollectionInfo, NotificationChannels, TrackingPriority, TrackingRecord, TrackingSubject,
};
use crate::tracking::notifications::{ChannelKind, RecordingNotifier};
use crate::tracking::repository::InMemoryTrackingStore;
use crate::tracking::TrackingLedger;

/// Monday morning, so business-day arithmetic stays inside one week.
pub(super) fn monday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0)
        .single()
        .expect("valid start")
}

pub(super) struct Harness {
    pub(super) ledger: Arc<TrackingLedger>,
    pub(super) clock: Arc<ManualClock>,
    pub(super) notifier: Arc<RecordingNotifier>,
}

pub(super) fn harness() -> Harness {
    harness_with_notifier(RecordingNotifier::default())
}

pub(super) fn harness_failing_on(kind: ChannelKind) -> Harness {
    harness_with_notifier(RecordingNotifier::failing_on([kind]))
}

fn harness_with_notifier(notifier: RecordingNotifier) -> Harness {
    let clock = Arc::new(ManualClock::new(monday_morning()));
    let notifier = Arc::new(notifier);
    let ledger = Arc::new(TrackingLedger::new(
        Arc::new(InMemoryTrackingStore::default()),
        notifier.clone(),
        clock.clone(),
    ));
    Harness {
        ledger,
        clock,
        notifier,
    }
}

pub(super) fn subject(name: &str, reference: &str) -> TrackingSubject {
    TrackingSubject {
        order_number: format!("ORD-{reference}"),
        subject_name: name.to_string(),
        document_reference: reference.to_string(),
        document_type: Some("WORK_PERMIT".to_string()),
        notifications: NotificationChannels {
            sms: Some("+27820000001".to_string()),
            email: Some("holder@example.test".to_string()),
        },
    }
}

pub(super) fn create(harness: &Harness, name: &str, reference: &str) -> TrackingRecord {
    harness
        .ledger
        .create_tracking(
            subject(name, reference),
            TrackingPriority::Standard,
            CollectionInfo::default(),
        )
        .expect("tracking created")
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
