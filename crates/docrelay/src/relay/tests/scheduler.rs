use super::common::*;
use chrono::Duration;
use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::relay::domain::{
    DocumentDescriptor, JobId, JobPriority, JobStatus, RelayId, RelayStatus, SubmitOptions,
};
use crate::relay::registry::RelayRegistry;
use crate::relay::scheduler::SchedulerError;
use crate::relay::transport::LocalRelayTransport;
use crate::tracking::{TrackingPriority, TrackingStage};

#[tokio::test]
async fn submit_places_job_on_best_relay() {
    let harness = harness();

    let placement = harness
        .scheduler
        .submit_job(
            DocumentDescriptor::new("PASSPORT", "P-100"),
            SubmitOptions::default(),
        )
        .await
        .expect("placement succeeds");

    assert_eq!(placement.relay_id, RelayId::from("DHA_CENTRAL"));
    assert_eq!(placement.relay_name, "DHA Central Printing Hub");
    assert_eq!(placement.queue_position, 1);
    assert!(placement.simulated);
    assert_eq!(
        placement.estimated_completion,
        start() + Duration::minutes(120)
    );

    let stats = harness.scheduler.statistics();
    assert_eq!(stats.active_jobs, 1);
    assert_eq!(stats.total_load, 1);
    let central = stats
        .relays
        .iter()
        .find(|relay| relay.id == RelayId::from("DHA_CENTRAL"))
        .expect("central listed");
    assert_eq!(central.queue_length, 1);
}

#[tokio::test]
async fn job_ids_carry_timestamp_random_and_counter() {
    let harness = harness();
    let first = harness.scheduler.allocate_job_id();
    let second = harness.scheduler.allocate_job_id();

    let parts: Vec<&str> = first.0.split('-').collect();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[0], "RELAY");
    assert_eq!(parts[1], start().timestamp_millis().to_string());
    assert_eq!(parts[2].len(), 8);
    assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(parts[3], "1");
    assert!(second.0.ends_with("-2"));
}

#[tokio::test]
async fn no_capable_online_relay_is_reported() {
    let harness = harness_with(single_relay(5_000), Arc::new(LocalRelayTransport));

    let err = harness
        .scheduler
        .submit_job(
            DocumentDescriptor::new("Passport", "P-1"),
            SubmitOptions::default(),
        )
        .await
        .expect_err("nothing prints passports");

    assert!(matches!(err, SchedulerError::NoAvailableRelay { .. }));
    assert_eq!(err.kind(), ErrorKind::NoAvailableRelay);
    assert_eq!(harness.scheduler.statistics().active_jobs, 0);
}

#[tokio::test]
async fn express_estimate_stays_within_two_days() {
    let harness = harness();
    for priority in [
        JobPriority::Emergency,
        JobPriority::Standard,
        JobPriority::Low,
    ] {
        let placement = harness
            .scheduler
            .submit_job(
                permit("WP-EXP"),
                SubmitOptions {
                    priority,
                    express: true,
                    ..SubmitOptions::default()
                },
            )
            .await
            .expect("placement succeeds");
        assert!(placement.estimated_completion <= start() + Duration::days(2));
    }

    let emergency = harness
        .scheduler
        .submit_job(
            permit("WP-EM"),
            SubmitOptions::with_priority(JobPriority::Emergency),
        )
        .await
        .expect("placement succeeds");
    assert_eq!(
        emergency.estimated_completion,
        start() + Duration::minutes(30)
    );
}

#[tokio::test]
async fn equal_priority_jobs_queue_in_submission_order() {
    let harness = harness_with(single_relay(5_000), Arc::new(LocalRelayTransport));
    let mut positions = Vec::new();
    for index in 0..3 {
        let placement = harness
            .scheduler
            .submit_job(permit(&format!("WP-{index}")), SubmitOptions::default())
            .await
            .expect("placement succeeds");
        positions.push(placement.queue_position);
    }
    assert_eq!(positions, vec![1, 2, 3]);

    let urgent = harness
        .scheduler
        .submit_job(permit("WP-H"), SubmitOptions::with_priority(JobPriority::High))
        .await
        .expect("placement succeeds");
    assert_eq!(urgent.queue_position, 1);

    let express = harness
        .scheduler
        .submit_job(
            permit("WP-X"),
            SubmitOptions {
                priority: JobPriority::Low,
                express: true,
                ..SubmitOptions::default()
            },
        )
        .await
        .expect("placement succeeds");
    assert_eq!(express.queue_position, 1, "express queues at EXPRESS");
}

#[tokio::test]
async fn reschedule_to_emergency_moves_job_to_front() {
    let harness = harness_with(single_relay(5_000), Arc::new(LocalRelayTransport));
    let mut last = None;
    for index in 0..5 {
        last = Some(
            submit_tracked(
                &harness,
                permit(&format!("WP-{index}")),
                SubmitOptions::default(),
            )
            .await,
        );
    }
    let (placement, tracking_number) = last.expect("five jobs placed");
    assert_eq!(placement.queue_position, 5);

    let outcome = harness
        .scheduler
        .reschedule_job(&placement.job_id, JobPriority::Emergency)
        .expect("reschedule succeeds");

    assert_eq!(outcome.new_position, 1);
    let details = harness
        .scheduler
        .get_job(&placement.job_id)
        .expect("job readable");
    assert_eq!(details.queue_position, Some(1));
    assert_eq!(details.job.queue_priority, JobPriority::Emergency);

    let tracking = harness
        .ledger
        .get_tracking(&tracking_number)
        .expect("tracking readable");
    assert_eq!(tracking.record.priority, TrackingPriority::High);
}

#[tokio::test]
async fn advancement_walks_job_to_dispatch_and_mirrors_ledger() {
    let harness = harness_with(single_relay(100), Arc::new(LocalRelayTransport));
    let (first, tracking_number) =
        submit_tracked(&harness, permit("WP-1"), SubmitOptions::default()).await;
    let (second, _) = submit_tracked(&harness, permit("WP-2"), SubmitOptions::default()).await;

    let expected = [
        (JobStatus::Processing, TrackingStage::Printing),
        (JobStatus::Printing, TrackingStage::Printing),
        (JobStatus::QualityCheck, TrackingStage::QualityCheck),
        (JobStatus::Packaging, TrackingStage::Packaging),
        (JobStatus::ReadyForDispatch, TrackingStage::Packaging),
    ];
    for (status, stage) in expected {
        harness.clock.advance(Duration::seconds(30));
        let report = harness.scheduler.advance_queues();
        assert_eq!(report.advanced, 1, "capacity 100 advances one job per tick");
        let job = harness.scheduler.get_job(&first.job_id).expect("job").job;
        assert_eq!(job.status, status);
        let tracking = harness
            .ledger
            .get_tracking(&tracking_number)
            .expect("tracking")
            .record;
        assert_eq!(tracking.current_stage, stage);
        assert_eq!(tracking.current_location.as_deref(), Some("Cape Town"));
    }

    let second_before = harness.scheduler.get_job(&second.job_id).expect("job");
    assert_eq!(second_before.job.status, JobStatus::Queued);
    assert_eq!(second_before.queue_position, Some(2));

    let report = harness.scheduler.advance_queues();
    assert_eq!(report.completed, 1);
    let dispatched = harness.scheduler.get_job(&first.job_id).expect("job");
    assert_eq!(dispatched.job.status, JobStatus::Dispatched);
    assert_eq!(dispatched.queue_position, None);

    let tracking = harness
        .ledger
        .get_tracking(&tracking_number)
        .expect("tracking")
        .record;
    assert_eq!(tracking.current_stage, TrackingStage::Dispatched);
    assert_eq!(tracking.stage_history.len(), 6);

    let stats = harness.scheduler.statistics();
    assert_eq!(stats.active_jobs, 1);
    assert_eq!(stats.completed_jobs, 1);
    assert_eq!(stats.relays[0].current_load, 1);
    assert_eq!(
        harness
            .scheduler
            .get_job(&second.job_id)
            .expect("job")
            .queue_position,
        Some(1)
    );
}

#[tokio::test]
async fn dispatched_jobs_cannot_be_cancelled() {
    let harness = harness_with(single_relay(100), Arc::new(LocalRelayTransport));
    let (placement, _) = submit_tracked(&harness, permit("WP-1"), SubmitOptions::default()).await;
    for _ in 0..6 {
        harness.scheduler.advance_queues();
    }

    let err = harness
        .scheduler
        .cancel_job(&placement.job_id, None)
        .expect_err("past the point of no return");

    assert!(matches!(
        err,
        SchedulerError::InvalidState {
            status: JobStatus::Dispatched,
            ..
        }
    ));
    let details = harness.scheduler.get_job(&placement.job_id).expect("job");
    assert_eq!(details.job.status, JobStatus::Dispatched);
    assert_eq!(details.queue_position, None);
}

#[tokio::test]
async fn cancelling_a_queued_job_releases_the_slot_and_cancels_tracking() {
    let harness = harness_with(single_relay(5_000), Arc::new(LocalRelayTransport));
    let (first, tracking_number) =
        submit_tracked(&harness, permit("WP-1"), SubmitOptions::default()).await;
    let (second, _) = submit_tracked(&harness, permit("WP-2"), SubmitOptions::default()).await;

    let cancelled = harness
        .scheduler
        .cancel_job(&first.job_id, Some("holder withdrew".to_string()))
        .expect("cancel succeeds");
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("holder withdrew"));

    let tracking = harness
        .ledger
        .get_tracking(&tracking_number)
        .expect("tracking")
        .record;
    assert_eq!(tracking.current_stage, TrackingStage::Cancelled);

    assert_eq!(
        harness
            .scheduler
            .get_job(&second.job_id)
            .expect("job")
            .queue_position,
        Some(1)
    );
    let stats = harness.scheduler.statistics();
    assert_eq!(stats.relays[0].current_load, 1);
    assert_eq!(stats.relays[0].queue_length, 1);

    let again = harness
        .scheduler
        .cancel_job(&first.job_id, None)
        .expect_err("already cancelled");
    assert_eq!(again.kind(), ErrorKind::InvalidState);
    assert!(matches!(
        harness
            .scheduler
            .cancel_job(&JobId("RELAY-missing".to_string()), None),
        Err(SchedulerError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn offline_relays_keep_queue_but_are_skipped() {
    let transport = FlakyTransport {
        unreachable: HashSet::from([RelayId::from("DHA_CENTRAL")]),
    };
    let harness = harness_with(RelayRegistry::default_network(start()), Arc::new(transport));

    let queued = harness
        .scheduler
        .submit_job(
            DocumentDescriptor::new("PASSPORT", "P-1"),
            SubmitOptions::default(),
        )
        .await
        .expect("placement falls back locally");
    assert_eq!(queued.relay_id, RelayId::from("DHA_CENTRAL"));
    assert!(queued.simulated, "failed transport falls back to local placement");

    harness.clock.advance(Duration::minutes(6));
    let report = harness.scheduler.health_sweep().await;
    assert_eq!(report.offline, vec![RelayId::from("DHA_CENTRAL")]);
    assert_eq!(report.online.len(), 3);

    let rerouted = harness
        .scheduler
        .submit_job(
            DocumentDescriptor::new("PASSPORT", "P-2"),
            SubmitOptions {
                preferred_relay: Some(RelayId::from("DHA_CENTRAL")),
                ..SubmitOptions::default()
            },
        )
        .await
        .expect("catch-all facility accepts");
    assert_eq!(rerouted.relay_id, RelayId::from("GWP_MAIN"));

    harness.scheduler.advance_queues();
    let stranded = harness.scheduler.get_job(&queued.job_id).expect("job");
    assert_eq!(stranded.job.status, JobStatus::Queued);
    assert_eq!(stranded.queue_position, Some(1));

    harness
        .scheduler
        .record_heartbeat(&RelayId::from("DHA_CENTRAL"))
        .expect("known relay");
    let central = harness
        .scheduler
        .relays()
        .into_iter()
        .find(|relay| relay.id == RelayId::from("DHA_CENTRAL"))
        .expect("central");
    assert_eq!(central.status, RelayStatus::Online);
    assert_eq!(central.last_heartbeat, harness.clock.now());
    assert!(matches!(
        harness.scheduler.record_heartbeat(&RelayId::from("NOWHERE")),
        Err(SchedulerError::UnknownRelay(_))
    ));
}

#[tokio::test]
async fn statistics_report_utilisation() {
    let harness = harness_with(single_relay(200), Arc::new(LocalRelayTransport));
    for index in 0..4 {
        harness
            .scheduler
            .submit_job(permit(&format!("WP-{index}")), SubmitOptions::default())
            .await
            .expect("placement succeeds");
    }

    let stats = harness.scheduler.statistics();
    assert_eq!(stats.relay_count, 1);
    assert_eq!(stats.online_count, 1);
    assert_eq!(stats.total_capacity, 200);
    assert_eq!(stats.total_load, 4);
    assert_eq!(stats.utilization_rate, 2);
    assert_eq!(stats.relays[0].load_percentage, 2);
}

#[tokio::test(start_paused = true)]
async fn slow_relay_submission_times_out_to_local_placement() {
    let harness = harness_with_timeout(
        single_relay(500),
        Arc::new(SlowTransport {
            delay: std::time::Duration::from_secs(3600),
        }),
        std::time::Duration::from_secs(10),
    );
    let started = tokio::time::Instant::now();

    let placement = harness
        .scheduler
        .submit_job(permit("WP-1"), SubmitOptions::default())
        .await
        .expect("timeout falls back to local placement");

    let waited = started.elapsed();
    assert!(waited >= std::time::Duration::from_secs(10));
    assert!(waited < std::time::Duration::from_secs(3600));
    assert!(placement.simulated);
    assert_eq!(placement.queue_position, 1, "local position, not the relay's");

    let details = harness.scheduler.get_job(&placement.job_id).expect("job kept");
    assert_eq!(details.job.status, JobStatus::Queued);
    assert_eq!(details.queue_position, Some(1));
}

#[tokio::test(start_paused = true)]
async fn slow_health_check_counts_as_missed_heartbeat() {
    let harness = harness_with_timeout(
        single_relay(500),
        Arc::new(SlowTransport {
            delay: std::time::Duration::from_secs(3600),
        }),
        std::time::Duration::from_secs(10),
    );

    let report = harness.scheduler.health_sweep().await;
    assert_eq!(report.online, vec![RelayId::from("REGIONAL_WEST")]);
    let before = harness.scheduler.relays()[0].last_heartbeat;
    assert_eq!(before, start(), "timed-out health check records no heartbeat");

    harness.clock.advance(Duration::minutes(6));
    let report = harness.scheduler.health_sweep().await;
    assert_eq!(report.offline, vec![RelayId::from("REGIONAL_WEST")]);
    assert!(report.online.is_empty());
}
