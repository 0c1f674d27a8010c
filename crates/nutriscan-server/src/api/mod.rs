//! API endpoints module

pub mod admin;
pub mod health;
pub mod jobs;
pub mod parse;

pub use admin::{cleanup, metrics, realtime_stats};
pub use health::{health, health_detailed};
pub use jobs::{batch_status, cancel_job, delete_job, job_history, job_result, job_status};
pub use parse::{parse_async, parse_batch, parse_sync};
