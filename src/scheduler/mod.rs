//! Cron-like job scheduling: a per-minute tick evaluates cron expressions,
//! an executor thread runs due jobs serially and records their history.

pub mod cron;
mod job;
mod registry;

pub use cron::{CronError, CronExpression};
pub use job::{HistoryRecord, Job, JobConfig, JobStatus, RunHandle};
pub use registry::{JobRegistry, JobSnapshot, SchedulerError};
