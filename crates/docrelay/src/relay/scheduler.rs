use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::domain::{
    AdvanceReport, DocumentDescriptor, HealthReport, JobId, JobPlacement, JobPriority, JobStatus,
    PrintJob, RelayBreakdown, RelayFacility, RelayId, RelayStatistics, RelayStatus,
    RescheduleOutcome, SubmitOptions,
};
use super::queue::JobQueue;
use super::registry::RelayRegistry;
use super::transport::RelayTransport;
use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::tracking::{LedgerError, TrackingLedger, TrackingNumber, TrackingStage, UpdateContext};

const DEFAULT_DELIVERY_METHOD: &str = "POST_OFFICE";
const EXPRESS_MAX_DAYS: i64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("relay {0} is not registered")]
    UnknownRelay(RelayId),
    #[error("no online relay can print {document_type}")]
    NoAvailableRelay { document_type: String },
    #[error("job {job_id} cannot change while {status}")]
    InvalidState { job_id: JobId, status: JobStatus },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::JobNotFound(_) | SchedulerError::UnknownRelay(_) => ErrorKind::NotFound,
            SchedulerError::NoAvailableRelay { .. } => ErrorKind::NoAvailableRelay,
            SchedulerError::InvalidState { .. } => ErrorKind::InvalidState,
            SchedulerError::Ledger(err) => err.kind(),
        }
    }
}

/// A job plus where it currently sits in its facility queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDetails {
    #[serde(flatten)]
    pub job: PrintJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    registry: RelayRegistry,
    queues: HashMap<RelayId, JobQueue>,
    active: HashMap<JobId, PrintJob>,
    completed: HashMap<JobId, PrintJob>,
}

impl SchedulerState {
    fn settle(&mut self, job_id: &JobId) -> Option<&mut PrintJob> {
        let job = self.active.remove(job_id)?;
        if let Some(queue) = self.queues.get_mut(&job.relay_id) {
            queue.remove(job_id);
            let remaining = queue.len();
            if let Some(relay) = self.registry.get_mut(&job.relay_id) {
                relay.current_load = relay.current_load.saturating_sub(1);
                relay.queue_length = remaining;
            }
        }
        Some(self.completed.entry(job_id.clone()).or_insert(job))
    }
}

/// Owns the facilities, their queues and every print job.
pub struct RelayScheduler {
    state: Mutex<SchedulerState>,
    ledger: Arc<TrackingLedger>,
    transport: Arc<dyn RelayTransport>,
    clock: Arc<dyn Clock>,
    counter: AtomicU64,
    heartbeat_window: chrono::Duration,
    transport_timeout: Duration,
}

impl std::fmt::Debug for RelayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayScheduler")
            .field("heartbeat_window", &self.heartbeat_window)
            .field("transport_timeout", &self.transport_timeout)
            .finish_non_exhaustive()
    }
}

impl RelayScheduler {
    pub fn new(
        registry: RelayRegistry,
        ledger: Arc<TrackingLedger>,
        transport: Arc<dyn RelayTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                registry,
                ..SchedulerState::default()
            }),
            ledger,
            transport,
            clock,
            counter: AtomicU64::new(0),
            heartbeat_window: chrono::Duration::minutes(5),
            transport_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_heartbeat_window(mut self, window: Duration) -> Self {
        self.heartbeat_window =
            chrono::Duration::from_std(window).unwrap_or(self.heartbeat_window);
        self
    }

    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    pub fn register_relay(&self, relay: RelayFacility) -> bool {
        self.lock().registry.register(relay)
    }

    pub fn relays(&self) -> Vec<RelayFacility> {
        self.lock().registry.iter().cloned().collect()
    }

    /// `RELAY-<epoch millis>-<8 hex>-<counter>`.
    pub fn allocate_job_id(&self) -> JobId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let millis = self.clock.now().timestamp_millis();
        let random: u32 = rand::random();
        JobId(format!("RELAY-{millis}-{random:08X}-{counter}"))
    }

    /// Places an untracked job.
    pub async fn submit_job(
        &self,
        document: DocumentDescriptor,
        options: SubmitOptions,
    ) -> Result<JobPlacement, SchedulerError> {
        let job_id = self.allocate_job_id();
        self.place_job(job_id, document, options, None).await
    }

    /// Selects a facility, queues the job there and hands it to the transport.
    /// Transport failures fall back to the local placement.
    pub async fn place_job(
        &self,
        job_id: JobId,
        document: DocumentDescriptor,
        options: SubmitOptions,
        tracking_number: Option<TrackingNumber>,
    ) -> Result<JobPlacement, SchedulerError> {
        let now = self.clock.now();
        let (job, relay, position) = {
            let mut state = self.lock();
            let relay_id = state
                .registry
                .select(&document.document_type, options.preferred_relay.as_ref())
                .map(|relay| relay.id.clone())
                .ok_or_else(|| SchedulerError::NoAvailableRelay {
                    document_type: document.document_type.clone(),
                })?;

            let queue_priority = options.queue_priority();
            let queue = state.queues.entry(relay_id.clone()).or_default();
            let position = queue.insert(job_id.clone(), queue_priority);
            let queue_length = queue.len();

            let relay = state
                .registry
                .get_mut(&relay_id)
                .ok_or_else(|| SchedulerError::UnknownRelay(relay_id.clone()))?;
            relay.current_load += 1;
            relay.queue_length = queue_length;
            let relay = relay.clone();

            let job = PrintJob {
                job_id: job_id.clone(),
                relay_id: relay_id.clone(),
                requested_priority: options.priority,
                queue_priority,
                express: options.express,
                status: JobStatus::Queued,
                tracking_number,
                delivery_method: options
                    .delivery_method
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DELIVERY_METHOD.to_string()),
                submitted_at: now,
                last_updated: now,
                estimated_completion: estimate_completion(
                    &relay,
                    options.priority,
                    options.express,
                    now,
                ),
                cancel_reason: None,
                document,
            };
            state.active.insert(job_id, job.clone());
            (job, relay, position)
        };

        let receipt =
            tokio::time::timeout(self.transport_timeout, self.transport.submit(&relay, &job)).await;
        let (queue_position, simulated) = match receipt {
            Ok(Ok(receipt)) => (receipt.queue_position.unwrap_or(position), receipt.simulated),
            Ok(Err(err)) => {
                warn!(relay = %relay.id, job_id = %job.job_id, error = %err, "relay submission failed; using local placement");
                (position, true)
            }
            Err(_) => {
                warn!(relay = %relay.id, job_id = %job.job_id, "relay submission timed out; using local placement");
                (position, true)
            }
        };

        info!(
            job_id = %job.job_id,
            relay = %relay.id,
            priority = %job.queue_priority,
            queue_position,
            "print job queued"
        );

        Ok(JobPlacement {
            job_id: job.job_id,
            relay_id: relay.id,
            relay_name: relay.name,
            queue_position,
            estimated_completion: job.estimated_completion,
            simulated,
        })
    }

    /// Moves up to `capacity / 100` head-of-queue jobs per online facility one
    /// step along the pipeline and mirrors each step into the ledger.
    pub fn advance_queues(&self) -> AdvanceReport {
        let now = self.clock.now();
        let mut report = AdvanceReport::default();
        let mut transitions: Vec<(TrackingNumber, TrackingStage, UpdateContext)> = Vec::new();

        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut settled = Vec::new();

            for relay in state.registry.iter() {
                if !relay.is_online() {
                    continue;
                }
                let Some(queue) = state.queues.get(&relay.id) else {
                    continue;
                };
                for job_id in queue.head(relay.throughput_per_tick()) {
                    let Some(job) = state.active.get_mut(&job_id) else {
                        continue;
                    };
                    let Some(next) = job.status.next_in_pipeline() else {
                        continue;
                    };
                    job.status = next;
                    job.last_updated = now;
                    report.advanced += 1;

                    if let (Some(tracking_number), Some(stage)) =
                        (&job.tracking_number, next.tracking_stage())
                    {
                        transitions.push((
                            tracking_number.clone(),
                            stage,
                            UpdateContext::at(relay.location.clone())
                                .with_notes(format!("Print job status: {next}")),
                        ));
                    }
                    if next.is_settled() {
                        settled.push(job_id);
                    }
                }
            }

            for job_id in settled {
                if state.settle(&job_id).is_some() {
                    report.completed += 1;
                }
            }
        }

        for (tracking_number, stage, context) in transitions {
            if let Err(err) = self.ledger.update_status(&tracking_number, stage, context) {
                warn!(%tracking_number, %stage, error = %err, "ledger rejected job progress");
            }
        }

        if report.advanced > 0 {
            debug!(advanced = report.advanced, completed = report.completed, "queues advanced");
        }
        report
    }

    pub fn cancel_job(&self, job_id: &JobId, reason: Option<String>) -> Result<PrintJob, SchedulerError> {
        let now = self.clock.now();
        let reason = reason.unwrap_or_else(|| "User requested".to_string());
        let job = {
            let mut state = self.lock();
            let status = match (state.active.get(job_id), state.completed.get(job_id)) {
                (Some(job), _) => job.status,
                (None, Some(job)) => {
                    return Err(SchedulerError::InvalidState {
                        job_id: job_id.clone(),
                        status: job.status,
                    })
                }
                (None, None) => return Err(SchedulerError::JobNotFound(job_id.clone())),
            };
            if matches!(
                status,
                JobStatus::Dispatched | JobStatus::InTransit | JobStatus::Delivered
            ) {
                return Err(SchedulerError::InvalidState {
                    job_id: job_id.clone(),
                    status,
                });
            }

            let job = state
                .settle(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.clone()))?;
            job.status = JobStatus::Cancelled;
            job.last_updated = now;
            job.cancel_reason = Some(reason.clone());
            job.clone()
        };

        info!(job_id = %job.job_id, %reason, "print job cancelled");

        if let Some(tracking_number) = &job.tracking_number {
            let context = UpdateContext::default()
                .with_notes(format!("Print job cancelled: {reason}"))
                .with_operator("RELAY");
            if let Err(err) =
                self.ledger
                    .update_status(tracking_number, TrackingStage::Cancelled, context)
            {
                warn!(%tracking_number, error = %err, "ledger rejected job cancellation");
            }
        }
        Ok(job)
    }

    /// Re-queues an active job under a new priority.
    pub fn reschedule_job(
        &self,
        job_id: &JobId,
        priority: JobPriority,
    ) -> Result<RescheduleOutcome, SchedulerError> {
        let now = self.clock.now();
        let (tracking_number, new_position) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(job) = state.active.get_mut(job_id) else {
                return Err(match state.completed.get(job_id) {
                    Some(job) => SchedulerError::InvalidState {
                        job_id: job_id.clone(),
                        status: job.status,
                    },
                    None => SchedulerError::JobNotFound(job_id.clone()),
                });
            };
            job.requested_priority = priority;
            job.queue_priority = priority;
            job.last_updated = now;

            let queue = state.queues.entry(job.relay_id.clone()).or_default();
            queue.remove(job_id);
            let new_position = queue.insert(job_id.clone(), priority);
            (job.tracking_number.clone(), new_position)
        };

        info!(%job_id, %priority, new_position, "print job rescheduled");

        if let Some(tracking_number) = tracking_number {
            if let Err(err) = self
                .ledger
                .update_priority(&tracking_number, priority.tracking_priority())
            {
                warn!(%tracking_number, error = %err, "tracking priority not updated");
            }
        }

        Ok(RescheduleOutcome {
            job_id: job_id.clone(),
            priority,
            new_position,
        })
    }

    /// Looks in active jobs first, then completed ones.
    pub fn get_job(&self, job_id: &JobId) -> Result<JobDetails, SchedulerError> {
        let state = self.lock();
        if let Some(job) = state.active.get(job_id) {
            let queue_position = state
                .queues
                .get(&job.relay_id)
                .and_then(|queue| queue.position(job_id));
            return Ok(JobDetails {
                job: job.clone(),
                queue_position,
            });
        }
        state
            .completed
            .get(job_id)
            .map(|job| JobDetails {
                job: job.clone(),
                queue_position: None,
            })
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.clone()))
    }

    pub fn record_heartbeat(&self, relay_id: &RelayId) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let relay = state
            .registry
            .get_mut(relay_id)
            .ok_or_else(|| SchedulerError::UnknownRelay(relay_id.clone()))?;
        relay.last_heartbeat = now;
        if relay.status == RelayStatus::Offline {
            info!(relay = %relay_id, "relay back online");
        }
        relay.status = RelayStatus::Online;
        Ok(())
    }

    /// Checks every facility, then marks facilities without a heartbeat inside
    /// the window offline. Offline facilities keep their queues.
    pub async fn health_sweep(&self) -> HealthReport {
        let relays = self.relays();
        for relay in &relays {
            match tokio::time::timeout(self.transport_timeout, self.transport.heartbeat(relay)).await
            {
                Ok(Ok(())) => {
                    if let Err(err) = self.record_heartbeat(&relay.id) {
                        debug!(relay = %relay.id, error = %err, "heartbeat not recorded");
                    }
                }
                Ok(Err(err)) => debug!(relay = %relay.id, error = %err, "relay health check failed"),
                Err(_) => debug!(relay = %relay.id, "relay health check timed out"),
            }
        }

        let now = self.clock.now();
        let mut report = HealthReport::default();
        let mut state = self.lock();
        for relay in state.registry.iter_mut() {
            let stale = now - relay.last_heartbeat > self.heartbeat_window;
            if stale {
                if relay.status == RelayStatus::Online {
                    warn!(relay = %relay.id, last_heartbeat = %relay.last_heartbeat, "relay offline");
                }
                relay.status = RelayStatus::Offline;
                report.offline.push(relay.id.clone());
            } else {
                relay.status = RelayStatus::Online;
                report.online.push(relay.id.clone());
            }
        }
        report
    }

    pub fn statistics(&self) -> RelayStatistics {
        let state = self.lock();
        let mut online_count = 0;
        let mut total_capacity = 0u64;
        let mut total_load = 0u64;
        let relays: Vec<RelayBreakdown> = state
            .registry
            .iter()
            .map(|relay| {
                if relay.is_online() {
                    online_count += 1;
                }
                total_capacity += u64::from(relay.capacity);
                total_load += u64::from(relay.current_load);
                RelayBreakdown {
                    id: relay.id.clone(),
                    name: relay.name.clone(),
                    location: relay.location.clone(),
                    status: relay.status,
                    load_percentage: relay.load_percentage(),
                    current_load: relay.current_load,
                    capacity: relay.capacity,
                    queue_length: state.queues.get(&relay.id).map_or(0, JobQueue::len),
                    avg_processing_minutes: relay.avg_processing_minutes,
                }
            })
            .collect();

        let utilization_rate = if total_capacity == 0 {
            0
        } else {
            (total_load as f64 / total_capacity as f64 * 100.0).round() as u32
        };

        RelayStatistics {
            relay_count: relays.len(),
            online_count,
            total_capacity,
            total_load,
            utilization_rate,
            active_jobs: state.active.len(),
            completed_jobs: state.completed.len(),
            relays,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// `now + avg processing * multiplier`, capped at two days out for express.
pub fn estimate_completion(
    relay: &RelayFacility,
    priority: JobPriority,
    express: bool,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let minutes = f64::from(relay.avg_processing_minutes) * priority.processing_multiplier();
    let completion = now + chrono::Duration::seconds((minutes * 60.0).round() as i64);
    if express {
        completion.min(now + chrono::Duration::days(EXPRESS_MAX_DAYS))
    } else {
        completion
    }
}
