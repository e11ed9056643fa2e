//! billsync background jobs
//!
//! The scheduler runs inside the API process by default; the
//! `billsync-worker` binary runs the same jobs standalone.

pub mod config;
pub mod housekeeping;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use scheduler::{Scheduler, SchedulerError, SchedulerJobs};
