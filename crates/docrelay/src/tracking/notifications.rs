use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::domain::{TrackingNumber, TrackingRecord, TrackingStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelKind {
    Sms,
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelTarget {
    pub kind: ChannelKind,
    pub destination: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDelivery {
    pub channel: ChannelTarget,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub tracking_number: TrackingNumber,
    pub recipient_name: String,
    pub stage: TrackingStage,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub deliveries: Vec<ChannelDelivery>,
}

impl Notification {
    /// Builds the notification for a stage entry, or `None` when the stage is
    /// not critical or the record has no destinations configured.
    pub fn for_stage(
        record: &TrackingRecord,
        stage: TrackingStage,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if !stage.is_critical() {
            return None;
        }

        let channels = &record.notification_channels;
        let targets = [
            (ChannelKind::Sms, channels.sms.as_deref()),
            (ChannelKind::Email, channels.email.as_deref()),
        ];
        let deliveries: Vec<ChannelDelivery> = targets
            .into_iter()
            .filter_map(|(kind, destination)| {
                let destination = destination?.trim();
                (!destination.is_empty()).then(|| ChannelDelivery {
                    channel: ChannelTarget {
                        kind,
                        destination: destination.to_string(),
                    },
                    status: DeliveryStatus::Queued,
                    sent_at: None,
                    error: None,
                })
            })
            .collect();

        if deliveries.is_empty() {
            return None;
        }

        Some(Self {
            id: Uuid::new_v4(),
            tracking_number: record.tracking_number.clone(),
            recipient_name: record.subject_name.clone(),
            stage,
            message: compose_message(record, stage),
            created_at: now,
            deliveries,
        })
    }
}

pub fn compose_message(record: &TrackingRecord, stage: TrackingStage) -> String {
    let collection_point = record
        .collection
        .location
        .as_deref()
        .unwrap_or(record.collection.method.as_str());
    match stage {
        TrackingStage::Dispatched => format!(
            "Dear {}, your document ({}) has been dispatched. Track: {}",
            record.subject_name, record.document_reference, record.tracking_number
        ),
        TrackingStage::InTransit => format!(
            "Dear {}, your document is in transit to {}. Expected arrival: {}",
            record.subject_name,
            collection_point,
            record.estimated_completion.format("%Y-%m-%d")
        ),
        TrackingStage::ReadyForCollection => format!(
            "Dear {}, your document is ready for collection at {}. Reference: {}",
            record.subject_name, collection_point, record.tracking_number
        ),
        other => format!("Status update for {}: {}", record.tracking_number, other),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
    #[error("destination rejected: {0}")]
    Rejected(String),
}

/// Outbound SMS/e-mail hook. Calls run on the blocking pool of the
/// notification worker, never on the thread committing the stage change.
pub trait NotificationDispatcher: Debug + Send + Sync {
    fn dispatch(
        &self,
        target: &ChannelTarget,
        notification: &Notification,
    ) -> Result<(), NotificationError>;
}

/// Dispatcher that only writes the message to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl NotificationDispatcher for LoggingNotifier {
    fn dispatch(
        &self,
        target: &ChannelTarget,
        notification: &Notification,
    ) -> Result<(), NotificationError> {
        info!(
            channel = ?target.kind,
            destination = %target.destination,
            tracking_number = %notification.tracking_number,
            message = %notification.message,
            "notification sent"
        );
        Ok(())
    }
}

/// Dispatcher that keeps every message in memory; channels listed in
/// `failing` report a transport error instead.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(ChannelTarget, Notification)>>,
    failing: HashSet<ChannelKind>,
}

impl RecordingNotifier {
    pub fn failing_on(kinds: impl IntoIterator<Item = ChannelKind>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: kinds.into_iter().collect(),
        }
    }

    pub fn sent(&self) -> Vec<(ChannelTarget, Notification)> {
        self.sent
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }
}

impl NotificationDispatcher for RecordingNotifier {
    fn dispatch(
        &self,
        target: &ChannelTarget,
        notification: &Notification,
    ) -> Result<(), NotificationError> {
        if self.failing.contains(&target.kind) {
            return Err(NotificationError::Transport(format!(
                "{:?} gateway offline",
                target.kind
            )));
        }
        self.sent
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push((target.clone(), notification.clone()));
        Ok(())
    }
}

/// Sends every pending delivery independently; a failed channel is logged and
/// recorded but never propagated.
pub(crate) fn deliver(
    dispatcher: &dyn NotificationDispatcher,
    mut notification: Notification,
    now: DateTime<Utc>,
) -> Notification {
    let snapshot = notification.clone();
    for delivery in &mut notification.deliveries {
        match dispatcher.dispatch(&delivery.channel, &snapshot) {
            Ok(()) => {
                delivery.status = DeliveryStatus::Sent;
                delivery.sent_at = Some(now);
            }
            Err(err) => {
                warn!(
                    tracking_number = %snapshot.tracking_number,
                    channel = ?delivery.channel.kind,
                    error = %err,
                    "notification delivery failed"
                );
                delivery.status = DeliveryStatus::Failed;
                delivery.error = Some(err.to_string());
            }
        }
    }
    notification
}

/// Dispatcher plus outbox pair driven by the notification worker.
#[derive(Clone)]
pub(crate) struct Delivery {
    pub(crate) dispatcher: Arc<dyn NotificationDispatcher>,
    pub(crate) outbox: Arc<NotificationOutbox>,
    pub(crate) clock: Arc<dyn crate::clock::Clock>,
}

impl Delivery {
    pub(crate) fn run(&self, notification: Notification) {
        let delivered = deliver(self.dispatcher.as_ref(), notification, self.clock.now());
        self.outbox.record(delivered);
    }
}

/// Bounded log of the most recent notifications.
#[derive(Debug)]
pub struct NotificationOutbox {
    capacity: usize,
    entries: Mutex<VecDeque<Notification>>,
}

impl NotificationOutbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, notification: Notification) {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(notification);
    }

    /// Replaces the queued entry with the same id; an entry already evicted
    /// is appended again.
    pub fn record(&self, notification: Notification) {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.id == notification.id)
        {
            *entry = notification;
            return;
        }
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(notification);
    }

    /// Most recent first.
    pub fn recent(&self) -> Vec<Notification> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.iter().rev().cloned().collect()
    }
}

impl Default for NotificationOutbox {
    fn default() -> Self {
        Self::new(500)
    }
}
