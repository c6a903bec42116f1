use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Externally visible identifier of a tracking record, e.g. `SAPO-PTA-20250303-001`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingNumber(pub String);

impl TrackingNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackingNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackingNumber {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Stages a document passes through between submission and collection.
///
/// The declaration order is the forward order of the state machine, with
/// `Cancelled` as an absorbing branch outside of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrackingStage {
    #[serde(alias = "QUEUED")]
    Queued,
    #[serde(alias = "PRINTING")]
    Printing,
    #[serde(rename = "Quality Check", alias = "QualityCheck", alias = "QUALITY_CHECK")]
    QualityCheck,
    #[serde(alias = "PACKAGING")]
    Packaging,
    #[serde(alias = "DISPATCHED")]
    Dispatched,
    #[serde(rename = "In Transit", alias = "InTransit", alias = "IN_TRANSIT")]
    InTransit,
    #[serde(
        rename = "Ready for Collection",
        alias = "ReadyForCollection",
        alias = "READY_FOR_COLLECTION"
    )]
    ReadyForCollection,
    #[serde(alias = "COLLECTED")]
    Collected,
    #[serde(alias = "CANCELLED")]
    Cancelled,
}

impl TrackingStage {
    pub const ORDERED: [TrackingStage; 8] = [
        TrackingStage::Queued,
        TrackingStage::Printing,
        TrackingStage::QualityCheck,
        TrackingStage::Packaging,
        TrackingStage::Dispatched,
        TrackingStage::InTransit,
        TrackingStage::ReadyForCollection,
        TrackingStage::Collected,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            TrackingStage::Queued => "Queued",
            TrackingStage::Printing => "Printing",
            TrackingStage::QualityCheck => "Quality Check",
            TrackingStage::Packaging => "Packaging",
            TrackingStage::Dispatched => "Dispatched",
            TrackingStage::InTransit => "In Transit",
            TrackingStage::ReadyForCollection => "Ready for Collection",
            TrackingStage::Collected => "Collected",
            TrackingStage::Cancelled => "Cancelled",
        }
    }

    /// Position in the forward order; `None` for `Cancelled`.
    pub fn ordinal(self) -> Option<usize> {
        Self::ORDERED.iter().position(|stage| *stage == self)
    }

    pub fn next(self) -> Option<Self> {
        self.ordinal()
            .and_then(|index| Self::ORDERED.get(index + 1).copied())
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, TrackingStage::Collected | TrackingStage::Cancelled)
    }

    /// Stages that trigger an SMS/e-mail notification on entry.
    pub const fn is_critical(self) -> bool {
        matches!(
            self,
            TrackingStage::Dispatched | TrackingStage::ReadyForCollection
        )
    }

    /// Percentage of the journey completed. `ReadyForCollection` is the last
    /// stage the service drives, so it and `Collected` both report 100.
    pub fn progress_percentage(self) -> Option<u8> {
        let ordinal = self.ordinal()?;
        let denominator = TrackingStage::ReadyForCollection
            .ordinal()
            .unwrap_or(Self::ORDERED.len() - 1) as f64;
        let percentage = (ordinal as f64 / denominator * 100.0).round().min(100.0);
        Some(percentage as u8)
    }

    /// Whether moving from `self` to `target` respects the forward-only rule.
    pub fn allows(self, target: TrackingStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.ordinal(), target.ordinal()) {
            (_, None) => true,
            (Some(from), Some(to)) => to >= from,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for TrackingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Coarse urgency of the tracked document, derived from the delivery speed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingPriority {
    High,
    #[default]
    Standard,
}

impl TrackingPriority {
    pub const fn completion_business_days(self) -> u32 {
        match self {
            TrackingPriority::High => 2,
            TrackingPriority::Standard => 4,
        }
    }

    pub fn estimated_completion(self, from: DateTime<Utc>) -> DateTime<Utc> {
        add_business_days(from, self.completion_business_days())
    }
}

/// Adds whole working days, skipping Saturdays and Sundays.
pub fn add_business_days(from: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    let mut current = from;
    let mut remaining = days;
    while remaining > 0 {
        current += Duration::days(1);
        if !matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
            remaining -= 1;
        }
    }
    current
}

/// One archived stage in a record's journey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub stage: TrackingStage,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub notes: String,
    pub operator: String,
}

/// Optional context supplied with a stage update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl UpdateContext {
    pub fn at(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::default()
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Default for CollectionInfo {
    fn default() -> Self {
        Self {
            method: "Post Office".to_string(),
            location: None,
        }
    }
}

/// SMS/e-mail destinations notified on critical stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationChannels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Identifying data of the document a new record tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingSubject {
    pub order_number: String,
    pub subject_name: String,
    pub document_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default)]
    pub notifications: NotificationChannels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub tracking_number: TrackingNumber,
    pub order_number: String,
    pub subject_name: String,
    pub document_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    pub current_stage: TrackingStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    pub stage_history: Vec<StageHistoryEntry>,
    pub priority: TrackingPriority,
    pub progress_percentage: u8,
    pub estimated_completion: DateTime<Utc>,
    pub collection: CollectionInfo,
    pub notification_channels: NotificationChannels,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl TrackingRecord {
    pub fn is_active(&self) -> bool {
        !self.current_stage.is_terminal()
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> TimeRemaining {
        match self.current_stage {
            TrackingStage::ReadyForCollection
            | TrackingStage::Collected
            | TrackingStage::Cancelled => TimeRemaining::zero(),
            _ => TimeRemaining::until(now, self.estimated_completion),
        }
    }

    pub fn active_view(&self) -> ActiveTracking {
        ActiveTracking {
            tracking_number: self.tracking_number.clone(),
            subject_name: self.subject_name.clone(),
            current_stage: self.current_stage,
            progress_percentage: self.progress_percentage,
            priority: self.priority,
        }
    }

    pub fn summary(&self) -> TrackingSummary {
        TrackingSummary {
            tracking_number: self.tracking_number.clone(),
            subject_name: self.subject_name.clone(),
            document_reference: self.document_reference.clone(),
            current_stage: self.current_stage,
            estimated_completion: self.estimated_completion,
        }
    }
}

/// Remaining time until the estimated completion, floored at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeRemaining {
    pub total_minutes: i64,
    pub hours: i64,
    pub minutes: i64,
    pub formatted: String,
}

impl TimeRemaining {
    pub fn zero() -> Self {
        Self::from_minutes(0)
    }

    pub fn until(now: DateTime<Utc>, target: DateTime<Utc>) -> Self {
        Self::from_minutes((target - now).num_minutes().max(0))
    }

    fn from_minutes(total_minutes: i64) -> Self {
        let hours = total_minutes / 60;
        let minutes = total_minutes % 60;
        Self {
            total_minutes,
            hours,
            minutes,
            formatted: format!("{hours}h {minutes}m"),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_minutes == 0
    }
}

/// Read model returned by `get_tracking`.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingSnapshot {
    #[serde(flatten)]
    pub record: TrackingRecord,
    pub estimated_time_remaining: TimeRemaining,
    pub is_live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntryView {
    pub stage: TrackingStage,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    pub is_current: bool,
}

/// Journey of a record, most recent entry first.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingHistory {
    pub tracking_number: TrackingNumber,
    pub subject_name: String,
    pub document_reference: String,
    pub total_stages: usize,
    pub history: Vec<HistoryEntryView>,
    pub created_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTracking {
    pub tracking_number: TrackingNumber,
    pub subject_name: String,
    pub current_stage: TrackingStage,
    pub progress_percentage: u8,
    pub priority: TrackingPriority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingSummary {
    pub tracking_number: TrackingNumber,
    pub subject_name: String,
    pub document_reference: String,
    pub current_stage: TrackingStage,
    pub estimated_completion: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub total: usize,
    pub by_stage: BTreeMap<TrackingStage, usize>,
    pub by_priority: BTreeMap<TrackingPriority, usize>,
}

/// Lookup filters; a record matches when any supplied criterion matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SearchCriteria {
    #[serde(default)]
    pub document_reference: Option<String>,
    #[serde(default)]
    pub subject_name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl SearchCriteria {
    pub fn is_empty(&self) -> bool {
        self.document_reference.is_none() && self.subject_name.is_none() && self.phone_number.is_none()
    }

    pub fn matches(&self, record: &TrackingRecord) -> bool {
        let by_reference = self
            .document_reference
            .as_deref()
            .is_some_and(|reference| record.document_reference == reference);
        let by_name = self.subject_name.as_deref().is_some_and(|name| {
            record
                .subject_name
                .to_lowercase()
                .contains(&name.to_lowercase())
        });
        let by_phone = self
            .phone_number
            .as_deref()
            .is_some_and(|phone| record.notification_channels.sms.as_deref() == Some(phone));
        by_reference || by_name || by_phone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn progress_spans_queued_to_ready_for_collection() {
        assert_eq!(TrackingStage::Queued.progress_percentage(), Some(0));
        assert_eq!(TrackingStage::Packaging.progress_percentage(), Some(50));
        assert_eq!(
            TrackingStage::ReadyForCollection.progress_percentage(),
            Some(100)
        );
        assert_eq!(TrackingStage::Collected.progress_percentage(), Some(100));
        assert_eq!(TrackingStage::Cancelled.progress_percentage(), None);
    }

    #[test]
    fn forward_rule_rejects_backward_and_terminal_moves() {
        assert!(TrackingStage::Queued.allows(TrackingStage::Queued));
        assert!(TrackingStage::Printing.allows(TrackingStage::Dispatched));
        assert!(TrackingStage::Packaging.allows(TrackingStage::Cancelled));
        assert!(!TrackingStage::Packaging.allows(TrackingStage::Printing));
        assert!(!TrackingStage::Collected.allows(TrackingStage::Cancelled));
        assert!(!TrackingStage::Cancelled.allows(TrackingStage::Printing));
    }

    #[test]
    fn stage_labels_round_trip_through_serde() {
        let encoded = serde_json::to_string(&TrackingStage::QualityCheck).expect("encode");
        assert_eq!(encoded, "\"Quality Check\"");
        let decoded: TrackingStage = serde_json::from_str("\"READY_FOR_COLLECTION\"").expect("alias");
        assert_eq!(decoded, TrackingStage::ReadyForCollection);
    }

    #[test]
    fn business_days_skip_weekends() {
        let friday = Utc
            .with_ymd_and_hms(2025, 3, 7, 10, 0, 0)
            .single()
            .expect("valid friday");
        let result = add_business_days(friday, 2);
        assert_eq!(result.weekday(), Weekday::Tue);
        assert_eq!(
            TrackingPriority::Standard.estimated_completion(friday).weekday(),
            Weekday::Thu
        );
    }

    #[test]
    fn time_remaining_floors_at_zero() {
        let now = Utc
            .with_ymd_and_hms(2025, 3, 3, 9, 0, 0)
            .single()
            .expect("valid now");
        let past = now - Duration::hours(3);
        assert!(TimeRemaining::until(now, past).is_zero());

        let ahead = TimeRemaining::until(now, now + Duration::minutes(135));
        assert_eq!(ahead.hours, 2);
        assert_eq!(ahead.minutes, 15);
        assert_eq!(ahead.formatted, "2h 15m");
    }
}
