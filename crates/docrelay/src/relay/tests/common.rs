use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::clock::ManualClock;
use crate::relay::domain::{
    Capabilities, DocumentDescriptor, JobPlacement, PrintJob, RelayFacility, RelayId,
    SubmitOptions,
};
use crate::relay::registry::RelayRegistry;
use crate::relay::scheduler::RelayScheduler;
use crate::relay::transport::{
    LocalRelayTransport, RelayTransport, TransportError, TransportReceipt,
};
use crate::tracking::{
    CollectionInfo, TrackingLedger, TrackingNumber, TrackingPriority, TrackingSubject,
};

pub(super) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0)
        .single()
        .expect("valid start")
}

pub(super) struct Harness {
    pub(super) scheduler: Arc<RelayScheduler>,
    pub(super) ledger: Arc<TrackingLedger>,
    pub(super) clock: Arc<ManualClock>,
}

pub(super) fn harness() -> Harness {
    harness_with(
        RelayRegistry::default_network(start()),
        Arc::new(LocalRelayTransport),
    )
}

pub(super) fn harness_with(registry: RelayRegistry, transport: Arc<dyn RelayTransport>) -> Harness {
    harness_with_timeout(registry, transport, Duration::from_secs(10))
}

pub(super) fn harness_with_timeout(
    registry: RelayRegistry,
    transport: Arc<dyn RelayTransport>,
    timeout: Duration,
) -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let ledger = Arc::new(TrackingLedger::in_memory(clock.clone()));
    let scheduler = Arc::new(
        RelayScheduler::new(registry, ledger.clone(), transport, clock.clone())
            .with_transport_timeout(timeout),
    );
    Harness {
        scheduler,
        ledger,
        clock,
    }
}

/// One small facility that only prints permits, so queues stay predictable.
pub(super) fn single_relay(capacity: u32) -> RelayRegistry {
    let mut registry = RelayRegistry::default();
    registry.register(RelayFacility::new(
        "REGIONAL_WEST",
        "Western Cape Regional Facility",
        "Cape Town",
        capacity,
        3,
        Capabilities::from_tags(["PERMIT", "CERTIFICATE"]),
        start(),
    ));
    registry
}

pub(super) fn permit(reference: &str) -> DocumentDescriptor {
    DocumentDescriptor::new("PERMIT", reference).held_by("Thandi Mokoena")
}

pub(super) async fn submit_tracked(
    harness: &Harness,
    document: DocumentDescriptor,
    options: SubmitOptions,
) -> (JobPlacement, TrackingNumber) {
    let job_id = harness.scheduler.allocate_job_id();
    let record = harness
        .ledger
        .create_tracking(
            TrackingSubject {
                order_number: job_id.0.clone(),
                subject_name: document.holder_name.clone(),
                document_reference: document.reference.clone(),
                document_type: Some(document.document_type.clone()),
                ..TrackingSubject::default()
            },
            TrackingPriority::Standard,
            CollectionInfo::default(),
        )
        .expect("tracking created");
    let placement = harness
        .scheduler
        .place_job(
            job_id,
            document,
            options,
            Some(record.tracking_number.clone()),
        )
        .await
        .expect("job placed");
    (placement, record.tracking_number)
}

/// Transport whose submissions always fail and whose health checks fail for the
/// listed facilities.
#[derive(Debug, Default)]
pub(super) struct FlakyTransport {
    pub(super) unreachable: HashSet<RelayId>,
}

#[async_trait]
impl RelayTransport for FlakyTransport {
    async fn submit(
        &self,
        relay: &RelayFacility,
        _job: &PrintJob,
    ) -> Result<TransportReceipt, TransportError> {
        Err(TransportError::Rejected {
            relay: relay.id.0.clone(),
            status: 503,
        })
    }

    async fn heartbeat(&self, relay: &RelayFacility) -> Result<(), TransportError> {
        if self.unreachable.contains(&relay.id) {
            Err(TransportError::Rejected {
                relay: relay.id.0.clone(),
                status: 503,
            })
        } else {
            Ok(())
        }
    }
}

/// Transport that answers only after `delay`, reporting its own queue position.
#[derive(Debug)]
pub(super) struct SlowTransport {
    pub(super) delay: Duration,
}

#[async_trait]
impl RelayTransport for SlowTransport {
    async fn submit(
        &self,
        _relay: &RelayFacility,
        _job: &PrintJob,
    ) -> Result<TransportReceipt, TransportError> {
        tokio::time::sleep(self.delay).await;
        Ok(TransportReceipt {
            queue_position: Some(99),
            simulated: false,
        })
    }

    async fn heartbeat(&self, _relay: &RelayFacility) -> Result<(), TransportError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
