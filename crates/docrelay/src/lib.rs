//! Document relay and tracking: places print jobs on facilities, tracks each
//! document through its stages and pushes every change to realtime clients.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod relay;
pub mod submission;
pub mod telemetry;
pub mod tracking;

pub use context::{AppContext, BackgroundTasks, SystemStatistics};
pub use error::{AppError, ErrorKind};
