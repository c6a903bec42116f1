//! Print facility registry and the job scheduler that places, queues and
//! advances print jobs across facilities.

pub mod domain;
pub mod queue;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
mod tests;

pub use domain::{
    AdvanceReport, Capabilities, DocumentDescriptor, HealthReport, JobId, JobPlacement,
    JobPriority, JobStatus, PrintJob, RelayBreakdown, RelayFacility, RelayId, RelayStatistics,
    RelayStatus, RescheduleOutcome, SubmitOptions,
};
pub use queue::JobQueue;
pub use registry::RelayRegistry;
pub use router::relay_router;
pub use scheduler::{estimate_completion, JobDetails, RelayScheduler, SchedulerError};
pub use transport::{
    HttpRelayTransport, LocalRelayTransport, RelayTransport, TransportError, TransportReceipt,
};
