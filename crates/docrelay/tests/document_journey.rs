//! End-to-end journeys through the public context: submission, queue
//! advancement, manual courier updates and realtime delivery.

mod common {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Value;
    use tokio::sync::mpsc::UnboundedReceiver;

    use docrelay::clock::ManualClock;
    use docrelay::config::{RealtimeConfig, RelayConfig};
    use docrelay::gateway::Outbound;
    use docrelay::relay::LocalRelayTransport;
    use docrelay::AppContext;

    pub(super) fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0)
            .single()
            .expect("valid start")
    }

    pub(super) fn context() -> (AppContext, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let context = AppContext::assemble(
            RelayConfig::default(),
            RealtimeConfig::default(),
            clock.clone(),
            Arc::new(LocalRelayTransport),
        );
        (context, clock)
    }

    pub(super) fn drain(receiver: &mut UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(frame) = receiver.try_recv() {
            if let Outbound::Message(text) = frame {
                messages.push(serde_json::from_str(&text).expect("json frame"));
            }
        }
        messages
    }
}

use chrono::Duration;
use common::*;
use docrelay::relay::{DocumentDescriptor, JobPriority, JobStatus, RelayId, SubmitOptions};
use docrelay::tracking::{NotificationChannels, TrackingStage, UpdateContext};
use docrelay::ErrorKind;

fn work_permit(reference: &str) -> DocumentDescriptor {
    DocumentDescriptor {
        collection_location: Some("Home Affairs, Pretoria".to_string()),
        contact: NotificationChannels {
            sms: Some("+27821234567".to_string()),
            email: Some("holder@example.test".to_string()),
        },
        ..DocumentDescriptor::new("WorkPermit", reference).held_by("Naledi Sithole")
    }
}

#[tokio::test]
async fn submitted_document_starts_queued() {
    let (context, _clock) = context();

    let receipt = context
        .submissions
        .submit_for_printing_and_tracking(
            work_permit("WP-1"),
            SubmitOptions::with_priority(JobPriority::High),
        )
        .await
        .expect("submission succeeds");

    let snapshot = context
        .ledger
        .get_tracking(&receipt.tracking_number)
        .expect("tracking exists");
    assert_eq!(snapshot.record.current_stage, TrackingStage::Queued);
    assert!(snapshot.record.stage_history.is_empty());
    assert_eq!(snapshot.record.progress_percentage, 0);
    assert_eq!(
        snapshot.record.collection.location.as_deref(),
        Some("Home Affairs, Pretoria")
    );
}

#[tokio::test]
async fn scheduler_ticks_then_courier_updates_reach_collection() {
    let (context, clock) = context();
    let receipt = context
        .submissions
        .submit_for_printing_and_tracking(work_permit("WP-2"), SubmitOptions::default())
        .await
        .expect("submission succeeds");

    for _ in 0..6 {
        clock.advance(Duration::seconds(30));
        context.scheduler.advance_queues();
    }
    let job = context.scheduler.get_job(&receipt.job_id).expect("job");
    assert_eq!(job.job.status, JobStatus::Dispatched);

    let tracking_number = receipt.tracking_number.clone();
    let record = context
        .ledger
        .update_status(
            &tracking_number,
            TrackingStage::InTransit,
            UpdateContext::at("Courier hub"),
        )
        .expect("in transit");
    assert_eq!(record.current_stage, TrackingStage::InTransit);
    let record = context
        .ledger
        .update_status(
            &tracking_number,
            TrackingStage::ReadyForCollection,
            UpdateContext::at("Home Affairs, Pretoria"),
        )
        .expect("ready");
    assert_eq!(record.progress_percentage, 100);

    assert_eq!(context.ledger.flush_notifications(), 2);
    let sent = context.ledger.notifications();
    assert_eq!(sent.len(), 2, "dispatch and ready each notify once");
    assert!(sent[0].message.contains("ready for collection at"));

    let err = context
        .ledger
        .update_status(&tracking_number, TrackingStage::Printing, UpdateContext::default())
        .expect_err("no going back");
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
}

#[tokio::test]
async fn healthy_network_routes_passports_to_central_hub() {
    let (context, clock) = context();
    clock.advance(Duration::minutes(10));
    context.scheduler.health_sweep().await;
    for relay in context.scheduler.relays() {
        assert!(relay.is_online(), "local transport keeps every relay alive");
    }

    let receipt = context
        .submissions
        .submit_for_printing_and_tracking(
            DocumentDescriptor::new("Passport", "P-123"),
            SubmitOptions::default(),
        )
        .await
        .expect("central hub accepts passports");
    assert_eq!(receipt.relay_id.0, "DHA_CENTRAL");
}

#[tokio::test]
async fn subscribed_client_gets_exactly_one_status_update() {
    let (context, _clock) = context();
    let first = context
        .submissions
        .submit_for_printing_and_tracking(work_permit("WP-3"), SubmitOptions::default())
        .await
        .expect("submission succeeds");
    let second = context
        .submissions
        .submit_for_printing_and_tracking(work_permit("WP-4"), SubmitOptions::default())
        .await
        .expect("submission succeeds");

    let (watcher, mut watcher_rx) = context.gateway.connect(None);
    let (bystander, mut bystander_rx) = context.gateway.connect(None);
    context.gateway.on_message(
        &watcher,
        &format!(r#"{{"type":"subscribe","trackingNumber":"{}"}}"#, first.tracking_number),
    );
    context.gateway.on_message(
        &bystander,
        &format!(r#"{{"type":"subscribe","trackingNumber":"{}"}}"#, second.tracking_number),
    );
    drain(&mut watcher_rx);
    drain(&mut bystander_rx);

    context
        .ledger
        .update_status(
            &first.tracking_number,
            TrackingStage::Printing,
            UpdateContext::default(),
        )
        .expect("forward move");

    let watcher_updates = drain(&mut watcher_rx)
        .into_iter()
        .filter(|message| message["type"] == "status_update")
        .count();
    let bystander_updates = drain(&mut bystander_rx)
        .into_iter()
        .filter(|message| message["type"] == "status_update")
        .count();
    assert_eq!(watcher_updates, 1);
    assert_eq!(bystander_updates, 0);
}

#[tokio::test]
async fn cancelled_job_cancels_its_tracking() {
    let (context, _clock) = context();
    let receipt = context
        .submissions
        .submit_for_printing_and_tracking(work_permit("WP-5"), SubmitOptions::default())
        .await
        .expect("submission succeeds");

    context
        .scheduler
        .cancel_job(&receipt.job_id, Some("duplicate request".to_string()))
        .expect("cancel succeeds");

    let snapshot = context
        .ledger
        .get_tracking(&receipt.tracking_number)
        .expect("tracking exists");
    assert_eq!(snapshot.record.current_stage, TrackingStage::Cancelled);
    assert!(context
        .ledger
        .get_all_active()
        .expect("active list")
        .is_empty());
}

#[tokio::test]
async fn busy_tick_still_delivers_each_subscriber_its_update() {
    let (context, _clock) = context();
    let mut receipts = Vec::new();
    for index in 0..300 {
        let receipt = context
            .submissions
            .submit_for_printing_and_tracking(
                work_permit(&format!("WP-BULK-{index}")),
                SubmitOptions {
                    preferred_relay: Some(RelayId::from("GWP_MAIN")),
                    ..SubmitOptions::default()
                },
            )
            .await
            .expect("submission succeeds");
        receipts.push(receipt);
    }

    let (watcher, mut watcher_rx) = context.gateway.connect(None);
    context.gateway.on_message(
        &watcher,
        &format!(
            r#"{{"type":"subscribe","trackingNumber":"{}"}}"#,
            receipts[0].tracking_number
        ),
    );
    drain(&mut watcher_rx);
    let pump = context
        .gateway
        .spawn_event_pump(context.ledger.events().feed());

    let report = context.scheduler.advance_queues();
    assert!(report.advanced >= 300, "one tick moves the whole queue");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let updates: Vec<_> = drain(&mut watcher_rx)
        .into_iter()
        .filter(|message| message["type"] == "status_update")
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["data"]["new_stage"], "Printing");
    pump.abort();
}
