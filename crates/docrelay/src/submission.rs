//! Single entry point for "print this document and track it".

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{error_response, ErrorKind};
use crate::relay::{DocumentDescriptor, JobId, RelayId, RelayScheduler, SchedulerError, SubmitOptions};
use crate::tracking::{
    CollectionInfo, LedgerError, TrackingLedger, TrackingNumber, TrackingPriority, TrackingSubject,
};

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("invalid document: {0}")]
    InvalidDocument(&'static str),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Placement failed after the tracking record was created; the record
    /// stays `Queued`.
    #[error("{source} (tracking {tracking_number} remains queued)")]
    Scheduling {
        tracking_number: TrackingNumber,
        #[source]
        source: SchedulerError,
    },
}

impl SubmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmissionError::InvalidDocument(_) => ErrorKind::InvalidRequest,
            SubmissionError::Ledger(err) => err.kind(),
            SubmissionError::Scheduling { source, .. } => source.kind(),
        }
    }

    pub fn tracking_number(&self) -> Option<&TrackingNumber> {
        match self {
            SubmissionError::Scheduling {
                tracking_number, ..
            } => Some(tracking_number),
            _ => None,
        }
    }
}

/// Correlation handle returned to the submitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionReceipt {
    pub job_id: JobId,
    pub tracking_number: TrackingNumber,
    pub relay_id: RelayId,
    pub relay_name: String,
    pub queue_position: usize,
    pub estimated_completion: DateTime<Utc>,
    pub simulated: bool,
}

#[derive(Debug)]
pub struct SubmissionFacade {
    ledger: Arc<TrackingLedger>,
    scheduler: Arc<RelayScheduler>,
}

impl SubmissionFacade {
    pub fn new(ledger: Arc<TrackingLedger>, scheduler: Arc<RelayScheduler>) -> Self {
        Self { ledger, scheduler }
    }

    /// Creates the tracking record first so a tracking number exists even when
    /// no relay can take the job.
    pub async fn submit_for_printing_and_tracking(
        &self,
        document: DocumentDescriptor,
        options: SubmitOptions,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        if document.document_type.trim().is_empty() {
            return Err(SubmissionError::InvalidDocument("document type is required"));
        }
        if document.reference.trim().is_empty() {
            return Err(SubmissionError::InvalidDocument("document reference is required"));
        }

        let job_id = self.scheduler.allocate_job_id();
        let priority = if options.express {
            TrackingPriority::High
        } else {
            options.priority.tracking_priority()
        };
        let collection = CollectionInfo {
            method: options
                .delivery_method
                .clone()
                .unwrap_or_else(|| CollectionInfo::default().method),
            location: document.collection_location.clone(),
        };
        let record = self.ledger.create_tracking(
            TrackingSubject {
                order_number: job_id.0.clone(),
                subject_name: document.holder_name.clone(),
                document_reference: document.reference.clone(),
                document_type: Some(document.document_type.clone()),
                notifications: document.contact.clone(),
            },
            priority,
            collection,
        )?;
        let tracking_number = record.tracking_number;

        let placement = match self
            .scheduler
            .place_job(job_id, document, options, Some(tracking_number.clone()))
            .await
        {
            Ok(placement) => placement,
            Err(source) => {
                warn!(%tracking_number, error = %source, "placement failed; tracking record kept");
                return Err(SubmissionError::Scheduling {
                    tracking_number,
                    source,
                });
            }
        };

        info!(
            job_id = %placement.job_id,
            %tracking_number,
            relay = %placement.relay_id,
            "document submitted for printing"
        );
        Ok(SubmissionReceipt {
            job_id: placement.job_id,
            tracking_number,
            relay_id: placement.relay_id,
            relay_name: placement.relay_name,
            queue_position: placement.queue_position,
            estimated_completion: placement.estimated_completion,
            simulated: placement.simulated,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(alias = "permit", alias = "documentData")]
    pub document: DocumentDescriptor,
    #[serde(flatten)]
    pub options: SubmitOptions,
}

pub fn submission_router(facade: Arc<SubmissionFacade>) -> Router {
    Router::new()
        .route("/api/v1/relay/submit", post(submit_handler))
        .with_state(facade)
}

pub(crate) async fn submit_handler(
    State(facade): State<Arc<SubmissionFacade>>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    match facade
        .submit_for_printing_and_tracking(request.document, request.options)
        .await
    {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(err) => match err.tracking_number() {
            Some(tracking_number) => {
                let kind = err.kind();
                let payload = json!({
                    "error": { "kind": kind, "message": err.to_string() },
                    "tracking_number": tracking_number,
                });
                (kind.status_code(), Json(payload)).into_response()
            }
            None => error_response(err.kind(), err.to_string()),
        },
    }
}
