use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracking::{NotificationChannels, TrackingNumber, TrackingPriority, TrackingStage};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(pub String);

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelayId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Queue ordering key; lower values are serviced first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Emergency,
    Express,
    High,
    #[default]
    Standard,
    Low,
}

impl JobPriority {
    pub const fn queue_value(self) -> u8 {
        match self {
            JobPriority::Emergency => 0,
            JobPriority::Express => 1,
            JobPriority::High => 2,
            JobPriority::Standard => 3,
            JobPriority::Low => 4,
        }
    }

    /// Scale applied to a facility's average processing time.
    pub const fn processing_multiplier(self) -> f64 {
        match self {
            JobPriority::Emergency => 0.25,
            JobPriority::Express => 0.5,
            JobPriority::High => 0.75,
            JobPriority::Standard => 1.0,
            JobPriority::Low => 1.5,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            JobPriority::Emergency => "EMERGENCY",
            JobPriority::Express => "EXPRESS",
            JobPriority::High => "HIGH",
            JobPriority::Standard => "STANDARD",
            JobPriority::Low => "LOW",
        }
    }

    pub const fn tracking_priority(self) -> TrackingPriority {
        match self {
            JobPriority::Emergency | JobPriority::Express | JobPriority::High => {
                TrackingPriority::High
            }
            JobPriority::Standard | JobPriority::Low => TrackingPriority::Standard,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Printing,
    QualityCheck,
    Packaging,
    ReadyForDispatch,
    Dispatched,
    InTransit,
    Delivered,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Next step of the in-facility pipeline, which ends at `Dispatched`.
    pub const fn next_in_pipeline(self) -> Option<JobStatus> {
        match self {
            JobStatus::Queued => Some(JobStatus::Processing),
            JobStatus::Processing => Some(JobStatus::Printing),
            JobStatus::Printing => Some(JobStatus::QualityCheck),
            JobStatus::QualityCheck => Some(JobStatus::Packaging),
            JobStatus::Packaging => Some(JobStatus::ReadyForDispatch),
            JobStatus::ReadyForDispatch => Some(JobStatus::Dispatched),
            _ => None,
        }
    }

    /// The job has left the facility queue.
    pub const fn is_settled(self) -> bool {
        matches!(
            self,
            JobStatus::Dispatched
                | JobStatus::InTransit
                | JobStatus::Delivered
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }

    pub const fn tracking_stage(self) -> Option<TrackingStage> {
        match self {
            JobStatus::Queued => Some(TrackingStage::Queued),
            JobStatus::Processing | JobStatus::Printing => Some(TrackingStage::Printing),
            JobStatus::QualityCheck => Some(TrackingStage::QualityCheck),
            JobStatus::Packaging | JobStatus::ReadyForDispatch => Some(TrackingStage::Packaging),
            JobStatus::Dispatched => Some(TrackingStage::Dispatched),
            JobStatus::InTransit => Some(TrackingStage::InTransit),
            JobStatus::Delivered => Some(TrackingStage::ReadyForCollection),
            JobStatus::Cancelled => Some(TrackingStage::Cancelled),
            JobStatus::Failed => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Printing => "PRINTING",
            JobStatus::QualityCheck => "QUALITY_CHECK",
            JobStatus::Packaging => "PACKAGING",
            JobStatus::ReadyForDispatch => "READY_FOR_DISPATCH",
            JobStatus::Dispatched => "DISPATCHED",
            JobStatus::InTransit => "IN_TRANSIT",
            JobStatus::Delivered => "DELIVERED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document types a facility can print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capabilities {
    All,
    Only(BTreeSet<String>),
}

impl Capabilities {
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags: BTreeSet<String> = tags
            .into_iter()
            .map(|tag| normalize_tag(tag.as_ref()))
            .filter(|tag| !tag.is_empty())
            .collect();
        if tags.contains("ALLDOCUMENTS") {
            Capabilities::All
        } else {
            Capabilities::Only(tags)
        }
    }

    pub fn supports(&self, document_type: &str) -> bool {
        match self {
            Capabilities::All => true,
            Capabilities::Only(tags) => tags.contains(&normalize_tag(document_type)),
        }
    }
}

impl Serialize for Capabilities {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Capabilities::All => ["ALL_DOCUMENTS"].serialize(serializer),
            Capabilities::Only(tags) => tags.serialize(serializer),
        }
    }
}

/// `id_card`, `ID-CARD` and `IdCard` all compare equal.
pub fn normalize_tag(tag: &str) -> String {
    tag.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayFacility {
    pub id: RelayId,
    pub name: String,
    pub location: String,
    pub capacity: u32,
    /// Facility preference; lower is preferred.
    pub priority_rank: u8,
    pub capabilities: Capabilities,
    pub status: RelayStatus,
    pub current_load: u32,
    pub queue_length: usize,
    pub avg_processing_minutes: u32,
    pub last_heartbeat: DateTime<Utc>,
}

impl RelayFacility {
    pub fn new(
        id: &str,
        name: &str,
        location: &str,
        capacity: u32,
        priority_rank: u8,
        capabilities: Capabilities,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RelayId::from(id),
            name: name.to_string(),
            location: location.to_string(),
            capacity,
            priority_rank,
            capabilities,
            status: RelayStatus::Online,
            current_load: 0,
            queue_length: 0,
            avg_processing_minutes: 120,
            last_heartbeat: now,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == RelayStatus::Online
    }

    pub fn accepts(&self, document_type: &str) -> bool {
        self.is_online() && self.capabilities.supports(document_type)
    }

    /// Lower is better: utilisation and queue depth push a facility down,
    /// its rank pulls it up.
    pub fn load_score(&self) -> f64 {
        let utilisation = if self.capacity == 0 {
            100.0
        } else {
            f64::from(self.current_load) / f64::from(self.capacity) * 100.0
        };
        let queue_weight = self.queue_length as f64 * 2.0;
        let rank_weight = (5.0 - f64::from(self.priority_rank)) * 10.0;
        utilisation + queue_weight - rank_weight
    }

    /// Jobs advanced per queue tick.
    pub fn throughput_per_tick(&self) -> usize {
        (self.capacity / 100) as usize
    }

    pub fn load_percentage(&self) -> u32 {
        if self.capacity == 0 {
            return 0;
        }
        (f64::from(self.current_load) / f64::from(self.capacity) * 100.0).round() as u32
    }
}

/// Permit-like record describing what should be printed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    #[serde(alias = "type")]
    pub document_type: String,
    #[serde(alias = "id", alias = "permit_number", alias = "permitNumber")]
    pub reference: String,
    #[serde(default, alias = "name")]
    pub holder_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_location: Option<String>,
    #[serde(default)]
    pub contact: NotificationChannels,
}

impl DocumentDescriptor {
    pub fn new(document_type: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            document_type: document_type.into(),
            reference: reference.into(),
            ..Self::default()
        }
    }

    pub fn held_by(mut self, holder_name: impl Into<String>) -> Self {
        self.holder_name = holder_name.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub preferred_relay: Option<RelayId>,
    #[serde(default)]
    pub express: bool,
    #[serde(default)]
    pub delivery_method: Option<String>,
}

impl SubmitOptions {
    pub fn with_priority(priority: JobPriority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Express delivery always queues at `Express`, whatever was requested.
    pub fn queue_priority(&self) -> JobPriority {
        if self.express {
            JobPriority::Express
        } else {
            self.priority
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintJob {
    pub job_id: JobId,
    pub relay_id: RelayId,
    pub document: DocumentDescriptor,
    pub requested_priority: JobPriority,
    pub queue_priority: JobPriority,
    pub express: bool,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<TrackingNumber>,
    pub delivery_method: String,
    pub submitted_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

/// Result of placing a job on a facility queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPlacement {
    pub job_id: JobId,
    pub relay_id: RelayId,
    pub relay_name: String,
    /// 1-based.
    pub queue_position: usize,
    pub estimated_completion: DateTime<Utc>,
    pub simulated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RescheduleOutcome {
    pub job_id: JobId,
    pub priority: JobPriority,
    pub new_position: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdvanceReport {
    pub advanced: usize,
    pub completed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub online: Vec<RelayId>,
    pub offline: Vec<RelayId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayBreakdown {
    pub id: RelayId,
    pub name: String,
    pub location: String,
    pub status: RelayStatus,
    pub load_percentage: u32,
    pub current_load: u32,
    pub capacity: u32,
    pub queue_length: usize,
    pub avg_processing_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayStatistics {
    pub relay_count: usize,
    pub online_count: usize,
    pub total_capacity: u64,
    pub total_load: u64,
    pub utilization_rate: u32,
    pub active_jobs: usize,
    pub completed_jobs: usize,
    pub relays: Vec<RelayBreakdown>,
}
