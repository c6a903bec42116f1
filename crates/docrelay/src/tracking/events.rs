use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

use super::domain::{TrackingNumber, TrackingRecord, TrackingStage, UpdateContext};

/// Event emitted by the ledger after every committed change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingEvent {
    pub tracking_number: TrackingNumber,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: TrackingEventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum TrackingEventPayload {
    Created(Box<TrackingRecord>),
    StatusUpdate(StatusChange),
}

impl TrackingEventPayload {
    pub const fn name(&self) -> &'static str {
        match self {
            TrackingEventPayload::Created(_) => "created",
            TrackingEventPayload::StatusUpdate(_) => "status_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub tracking_number: TrackingNumber,
    pub previous_stage: TrackingStage,
    pub new_stage: TrackingStage,
    pub timestamp: DateTime<Utc>,
    pub progress: u8,
    pub details: UpdateContext,
}

/// Identity of one party watching a tracking number (e.g. a realtime client id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type SubscriberCallback = Arc<dyn Fn(&TrackingEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionHandle {
    pub tracking_number: TrackingNumber,
    pub subscriber_id: SubscriberId,
}

/// Publish/subscribe hub: one topic per tracking number plus a global feed.
///
/// Callbacks run on the publishing thread after the topic lock is released, so
/// a callback may subscribe or unsubscribe without deadlocking.
pub struct EventBus {
    topics: Mutex<HashMap<TrackingNumber, HashMap<SubscriberId, SubscriberCallback>>>,
    feed: broadcast::Sender<TrackingEvent>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("feed_receivers", &self.feed.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            topics: Mutex::new(HashMap::new()),
            feed,
        }
    }

    pub fn subscribe(
        &self,
        tracking_number: &TrackingNumber,
        subscriber_id: Option<SubscriberId>,
        callback: SubscriberCallback,
    ) -> SubscriptionHandle {
        let subscriber_id = subscriber_id.unwrap_or_else(SubscriberId::random);
        let mut topics = self.topics.lock().unwrap_or_else(|err| err.into_inner());
        topics
            .entry(tracking_number.clone())
            .or_default()
            .insert(subscriber_id.clone(), callback);

        SubscriptionHandle {
            tracking_number: tracking_number.clone(),
            subscriber_id,
        }
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, tracking_number: &TrackingNumber, subscriber_id: &SubscriberId) -> bool {
        let mut topics = self.topics.lock().unwrap_or_else(|err| err.into_inner());
        let Some(subscribers) = topics.get_mut(tracking_number) else {
            return false;
        };
        let removed = subscribers.remove(subscriber_id).is_some();
        if subscribers.is_empty() {
            topics.remove(tracking_number);
        }
        removed
    }

    pub fn subscriber_count(&self, tracking_number: &TrackingNumber) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|err| err.into_inner());
        topics.get(tracking_number).map_or(0, HashMap::len)
    }

    /// Receiver for every event regardless of tracking number.
    pub fn feed(&self) -> broadcast::Receiver<TrackingEvent> {
        self.feed.subscribe()
    }

    pub fn publish(&self, event: TrackingEvent) {
        let callbacks: Vec<(SubscriberId, SubscriberCallback)> = {
            let topics = self.topics.lock().unwrap_or_else(|err| err.into_inner());
            topics
                .get(&event.tracking_number)
                .map(|subscribers| {
                    subscribers
                        .iter()
                        .map(|(id, callback)| (id.clone(), Arc::clone(callback)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (subscriber_id, callback) in callbacks {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(&event)));
            if outcome.is_err() {
                error!(
                    tracking_number = %event.tracking_number,
                    %subscriber_id,
                    "subscriber callback panicked"
                );
            }
        }

        let kind = event.payload.name();
        if self.feed.send(event).is_err() {
            debug!(event = kind, "no global feed receivers");
        }
    }
}
