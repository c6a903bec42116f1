use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::domain::{
    ActiveTracking, CollectionInfo, HistoryEntryView, LedgerStatistics, SearchCriteria,
    StageHistoryEntry, TrackingHistory, TrackingNumber, TrackingPriority, TrackingRecord,
    TrackingSnapshot, TrackingStage, TrackingSubject, TrackingSummary, UpdateContext,
};
use super::events::{
    EventBus, StatusChange, SubscriberCallback, SubscriberId, SubscriptionHandle, TrackingEvent,
    TrackingEventPayload,
};
use super::notifications::{
    Delivery, LoggingNotifier, Notification, NotificationDispatcher, NotificationOutbox,
};
use super::repository::{InMemoryTrackingStore, StoreError, TrackingStore};
use crate::clock::Clock;
use crate::error::ErrorKind;

const CARRIER_PREFIX: &str = "SAPO";
const REGION_CODES: [&str; 4] = ["RB", "SD", "CR", "PTA"];
const DEFAULT_LOCATION: &str = "Processing Center";
const DEFAULT_OPERATOR: &str = "SYSTEM";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("tracking number {0} not found")]
    NotFound(TrackingNumber),
    #[error("cannot move {tracking_number} from {from} to {to}")]
    InvalidTransition {
        tracking_number: TrackingNumber,
        from: TrackingStage,
        to: TrackingStage,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::NotFound(_) | LedgerError::Store(StoreError::NotFound) => {
                ErrorKind::NotFound
            }
            LedgerError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            LedgerError::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Single writer of tracking state. Every mutation commits to the store,
/// then publishes an event and, for critical stages, queues notifications for
/// the notification worker.
pub struct TrackingLedger {
    store: Arc<dyn TrackingStore>,
    bus: EventBus,
    delivery: Delivery,
    pending: mpsc::UnboundedSender<Notification>,
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
    record_locks: Mutex<HashMap<TrackingNumber, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for TrackingLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingLedger")
            .field("bus", &self.bus)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl TrackingLedger {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (pending, pending_rx) = mpsc::unbounded_channel();
        Self {
            store,
            bus: EventBus::default(),
            delivery: Delivery {
                dispatcher: notifier,
                outbox: Arc::new(NotificationOutbox::default()),
                clock: clock.clone(),
            },
            pending,
            pending_rx: Mutex::new(Some(pending_rx)),
            clock,
            sequence: AtomicU64::new(1),
            record_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Ledger backed by process memory with log-only notifications.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Arc::new(InMemoryTrackingStore::default()),
            Arc::new(LoggingNotifier),
            clock,
        )
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn create_tracking(
        &self,
        subject: TrackingSubject,
        priority: TrackingPriority,
        collection: CollectionInfo,
    ) -> Result<TrackingRecord, LedgerError> {
        let now = self.clock.now();
        let tracking_number = self.next_tracking_number();
        let TrackingSubject {
            order_number,
            subject_name,
            document_reference,
            document_type,
            notifications,
        } = subject;

        let record = TrackingRecord {
            tracking_number: tracking_number.clone(),
            order_number,
            subject_name,
            document_reference,
            document_type,
            current_stage: TrackingStage::Queued,
            current_location: None,
            stage_history: Vec::new(),
            priority,
            progress_percentage: 0,
            estimated_completion: priority.estimated_completion(now),
            collection,
            notification_channels: notifications,
            created_at: now,
            last_updated: now,
        };

        self.store.insert(record.clone())?;
        info!(%tracking_number, ?priority, "tracking record created");

        self.bus.publish(TrackingEvent {
            tracking_number,
            timestamp: now,
            payload: TrackingEventPayload::Created(Box::new(record.clone())),
        });

        Ok(record)
    }

    /// Moves a record to `new_stage`, archiving the stage being left.
    pub fn update_status(
        &self,
        tracking_number: &TrackingNumber,
        new_stage: TrackingStage,
        context: UpdateContext,
    ) -> Result<TrackingRecord, LedgerError> {
        let lock = self.record_lock(tracking_number);
        let record = {
            let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
            let mut record = self.fetch(tracking_number)?;
            let previous_stage = record.current_stage;
            if !previous_stage.allows(new_stage) {
                return Err(LedgerError::InvalidTransition {
                    tracking_number: tracking_number.clone(),
                    from: previous_stage,
                    to: new_stage,
                });
            }

            let now = self.clock.now();
            record.stage_history.push(StageHistoryEntry {
                stage: previous_stage,
                timestamp: record.last_updated,
                location: context
                    .location
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
                notes: context
                    .notes
                    .clone()
                    .unwrap_or_else(|| format!("Stage completed: {previous_stage}")),
                operator: context
                    .operator
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPERATOR.to_string()),
            });

            record.current_stage = new_stage;
            record.last_updated = now;
            if let Some(location) = &context.location {
                record.current_location = Some(location.clone());
            }
            if let Some(estimate) = context.estimated_completion {
                record.estimated_completion = estimate;
            }
            if let Some(progress) = new_stage.progress_percentage() {
                record.progress_percentage = progress;
            }

            self.store.update(record.clone())?;
            info!(
                %tracking_number,
                from = %previous_stage,
                to = %new_stage,
                progress = record.progress_percentage,
                "tracking stage updated"
            );

            // Published under the record guard so events leave in commit order.
            // Subscribers must not update this same record from their callback.
            self.bus.publish(TrackingEvent {
                tracking_number: tracking_number.clone(),
                timestamp: record.last_updated,
                payload: TrackingEventPayload::StatusUpdate(StatusChange {
                    tracking_number: tracking_number.clone(),
                    previous_stage,
                    new_stage,
                    timestamp: record.last_updated,
                    progress: record.progress_percentage,
                    details: context,
                }),
            });
            record
        };

        self.notify(&record, new_stage);
        Ok(record)
    }

    /// Changes the priority and recomputes the estimate from now.
    pub fn update_priority(
        &self,
        tracking_number: &TrackingNumber,
        priority: TrackingPriority,
    ) -> Result<TrackingRecord, LedgerError> {
        let lock = self.record_lock(tracking_number);
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        let mut record = self.fetch(tracking_number)?;
        if record.priority == priority {
            return Ok(record);
        }

        let now = self.clock.now();
        record.priority = priority;
        record.estimated_completion = priority.estimated_completion(now);
        self.store.update(record.clone())?;
        debug!(%tracking_number, ?priority, "tracking priority changed");
        Ok(record)
    }

    pub fn get_tracking(
        &self,
        tracking_number: &TrackingNumber,
    ) -> Result<TrackingSnapshot, LedgerError> {
        let record = self.fetch(tracking_number)?;
        let estimated_time_remaining = record.time_remaining(self.clock.now());
        Ok(TrackingSnapshot {
            record,
            estimated_time_remaining,
            is_live: true,
        })
    }

    pub fn get_history(
        &self,
        tracking_number: &TrackingNumber,
    ) -> Result<TrackingHistory, LedgerError> {
        let record = self.fetch(tracking_number)?;

        let mut history: Vec<HistoryEntryView> = record
            .stage_history
            .iter()
            .map(|entry| HistoryEntryView {
                stage: entry.stage,
                timestamp: entry.timestamp,
                location: entry.location.clone(),
                notes: entry.notes.clone(),
                operator: Some(entry.operator.clone()),
                is_current: false,
            })
            .collect();
        history.push(HistoryEntryView {
            stage: record.current_stage,
            timestamp: record.last_updated,
            location: record
                .current_location
                .clone()
                .unwrap_or_else(|| "Processing".to_string()),
            notes: format!("Currently in: {}", record.current_stage),
            operator: None,
            is_current: true,
        });
        history.reverse();

        Ok(TrackingHistory {
            tracking_number: record.tracking_number,
            subject_name: record.subject_name,
            document_reference: record.document_reference,
            total_stages: history.len(),
            history,
            created_at: record.created_at,
            estimated_completion: record.estimated_completion,
        })
    }

    pub fn subscribe(
        &self,
        tracking_number: &TrackingNumber,
        subscriber_id: Option<SubscriberId>,
        callback: SubscriberCallback,
    ) -> Result<SubscriptionHandle, LedgerError> {
        self.fetch(tracking_number)?;
        Ok(self.bus.subscribe(tracking_number, subscriber_id, callback))
    }

    pub fn unsubscribe(&self, tracking_number: &TrackingNumber, subscriber_id: &SubscriberId) -> bool {
        self.bus.unsubscribe(tracking_number, subscriber_id)
    }

    pub fn get_all_active(&self) -> Result<Vec<ActiveTracking>, LedgerError> {
        Ok(self
            .sorted_records()?
            .iter()
            .filter(|record| record.is_active())
            .map(TrackingRecord::active_view)
            .collect())
    }

    pub fn search(&self, criteria: &SearchCriteria) -> Result<Vec<TrackingSummary>, LedgerError> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .sorted_records()?
            .iter()
            .filter(|record| criteria.matches(record))
            .map(TrackingRecord::summary)
            .collect())
    }

    pub fn get_statistics(&self) -> Result<LedgerStatistics, LedgerError> {
        let records = self.store.all()?;
        let mut by_stage = BTreeMap::new();
        let mut by_priority = BTreeMap::from([
            (TrackingPriority::High, 0),
            (TrackingPriority::Standard, 0),
        ]);
        for record in &records {
            *by_stage.entry(record.current_stage).or_insert(0) += 1;
            *by_priority.entry(record.priority).or_insert(0) += 1;
        }
        Ok(LedgerStatistics {
            total: records.len(),
            by_stage,
            by_priority,
        })
    }

    /// Most recent notifications first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.delivery.outbox.recent()
    }

    /// Starts the task that sends queued notifications. Only the first call
    /// gets a worker; later calls return `None`.
    pub fn spawn_notification_worker(&self) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .pending_rx
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()?;
        let delivery = self.delivery.clone();
        Some(tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                let delivery = delivery.clone();
                if let Err(err) =
                    tokio::task::spawn_blocking(move || delivery.run(notification)).await
                {
                    warn!(error = %err, "notification delivery task failed");
                }
            }
            debug!("notification worker stopped");
        }))
    }

    /// Sends every queued notification on the calling thread and returns how
    /// many were sent. Does nothing once the worker owns the queue.
    pub fn flush_notifications(&self) -> usize {
        let mut guard = self.pending_rx.lock().unwrap_or_else(|err| err.into_inner());
        let Some(receiver) = guard.as_mut() else {
            return 0;
        };
        let mut flushed = 0;
        while let Ok(notification) = receiver.try_recv() {
            self.delivery.run(notification);
            flushed += 1;
        }
        flushed
    }

    fn fetch(&self, tracking_number: &TrackingNumber) -> Result<TrackingRecord, LedgerError> {
        self.store
            .fetch(tracking_number)?
            .ok_or_else(|| LedgerError::NotFound(tracking_number.clone()))
    }

    fn sorted_records(&self) -> Result<Vec<TrackingRecord>, LedgerError> {
        let mut records = self.store.all()?;
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.tracking_number.cmp(&b.tracking_number))
        });
        Ok(records)
    }

    fn record_lock(&self, tracking_number: &TrackingNumber) -> Arc<Mutex<()>> {
        let mut locks = self.record_locks.lock().unwrap_or_else(|err| err.into_inner());
        Arc::clone(locks.entry(tracking_number.clone()).or_default())
    }

    fn next_tracking_number(&self) -> TrackingNumber {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let region = REGION_CODES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(REGION_CODES[0]);
        let date = self.clock.now().format("%Y%m%d");
        TrackingNumber(format!("{CARRIER_PREFIX}-{region}-{date}-{sequence:03}"))
    }

    fn notify(&self, record: &TrackingRecord, stage: TrackingStage) {
        let Some(notification) = Notification::for_stage(record, stage, self.clock.now()) else {
            return;
        };
        self.delivery.outbox.push(notification.clone());
        if self.pending.send(notification).is_err() {
            warn!(
                tracking_number = %record.tracking_number,
                "notification worker gone; delivery left queued"
            );
        }
    }
}

/// Read/subscribe view of the ledger consumed by the realtime gateway.
pub trait TrackingSource: Send + Sync {
    fn snapshot(&self, tracking_number: &TrackingNumber) -> Result<TrackingSnapshot, LedgerError>;
    fn watch(
        &self,
        tracking_number: &TrackingNumber,
        subscriber_id: SubscriberId,
        callback: SubscriberCallback,
    ) -> Result<SubscriptionHandle, LedgerError>;
    fn unwatch(&self, tracking_number: &TrackingNumber, subscriber_id: &SubscriberId) -> bool;
    fn statistics(&self) -> Result<LedgerStatistics, LedgerError>;
}

impl TrackingSource for TrackingLedger {
    fn snapshot(&self, tracking_number: &TrackingNumber) -> Result<TrackingSnapshot, LedgerError> {
        self.get_tracking(tracking_number)
    }

    fn watch(
        &self,
        tracking_number: &TrackingNumber,
        subscriber_id: SubscriberId,
        callback: SubscriberCallback,
    ) -> Result<SubscriptionHandle, LedgerError> {
        self.subscribe(tracking_number, Some(subscriber_id), callback)
    }

    fn unwatch(&self, tracking_number: &TrackingNumber, subscriber_id: &SubscriberId) -> bool {
        self.unsubscribe(tracking_number, subscriber_id)
    }

    fn statistics(&self) -> Result<LedgerStatistics, LedgerError> {
        self.get_statistics()
    }
}
