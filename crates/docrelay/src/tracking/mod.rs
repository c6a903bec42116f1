//! Tracking ledger: the single writer of document tracking state.
//!
//! Records move forward through the stage list, archive every stage they
//! leave, notify on critical stages and publish an event per change.

pub mod domain;
pub mod events;
pub mod ledger;
pub mod notifications;
pub mod repository;
pub mod router;

#[cfg(test)]
mod tests;

pub use domain::{
    ActiveTracking, CollectionInfo, HistoryEntryView, LedgerStatistics, NotificationChannels,
    SearchCriteria, StageHistoryEntry, TimeRemaining, TrackingHistory, TrackingNumber,
    TrackingPriority, TrackingRecord, TrackingSnapshot, TrackingStage, TrackingSubject,
    TrackingSummary, UpdateContext,
};
pub use events::{
    EventBus, StatusChange, SubscriberCallback, SubscriberId, SubscriptionHandle, TrackingEvent,
    TrackingEventPayload,
};
pub use ledger::{LedgerError, TrackingLedger, TrackingSource};
pub use notifications::{
    ChannelKind, DeliveryStatus, LoggingNotifier, Notification, NotificationDispatcher,
    NotificationError, RecordingNotifier,
};
pub use repository::{InMemoryTrackingStore, StoreError, TrackingStore};
pub use router::tracking_router;
