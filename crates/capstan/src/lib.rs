//! Capstan: durable job engine with priority leasing
//!
//! # Overview
//!
//! Capstan is a lightweight, embeddable engine for queue-backed document
//! processing. It keeps every job in a durable store, hands work to a pool
//! of dispatcher slots through time-bounded leases, and survives worker
//! crashes by sweeping expired leases back into the ready set.
//!
//! # Features
//!
//! - **Atomic leases**: one `queued → leased` claim per job, owner-checked
//!   renew/ack/nack
//! - **Priority dispatch**: high before normal before low, FIFO within a
//!   class, job id as final tiebreaker
//! - **Crash recovery**: a sweeper requeues expired leases and fails jobs
//!   that exhaust their attempt budget
//! - **Multiple backends**: SQLite (default) and in-memory behind one
//!   [`JobStore`] trait
//! - **Blob storage**: content-hashed upload bytes with atomic writes
//!
//! # Example
//!
//! ```no_run
//! use capstan::{JobState, NewJob, Priority, SqliteStore, store::JobStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::open("jobs.db").await?;
//!
//!     let job = store
//!         .create(NewJob::new("menu.pdf", 1024, "sha...", "blobs/menu.pdf", "auto"))
//!         .await?;
//!     store.enqueue(job.id).await?;
//!
//!     // A dispatcher slot claims the highest-priority ready job.
//!     if let Some(leased) = store.lease_next("worker-1", std::time::Duration::from_secs(30)).await? {
//!         assert_eq!(leased.state, JobState::Leased);
//!     }
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod blob;
pub mod callback;
pub mod config;
pub mod dispatcher;
pub mod progress;
pub mod store;
pub mod sweeper;

pub use blob::{BlobError, BlobStore, StoredBlob};
pub use callback::{CallbackPayload, CallbackSender, CallbackStats};
pub use config::{CallbackConfig, DispatcherConfig, QueueConfig};
pub use dispatcher::{Dispatcher, ExecError, JobExecutor};
pub use progress::ProgressTracker;
pub use store::memory::MemoryStore;
pub use store::sqlite::SqliteStore;
pub use store::{JobStore, StoreError};
pub use sweeper::Sweeper;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Created, not yet enqueued or started
    Pending,
    /// In the ready set, waiting for a lease
    Queued,
    /// Claimed by a worker, pipeline not yet started
    Leased,
    /// Pipeline executing under an active lease
    Running,
    /// Terminal: result available
    Completed,
    /// Terminal: error recorded
    Failed,
    /// Terminal: cancelled before or during execution
    Cancelled,
}

impl JobState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// States in which a worker holds the job.
    pub fn is_held(&self) -> bool {
        matches!(self, JobState::Leased | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Queued => "queued",
            JobState::Leased => "leased",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "queued" => Ok(JobState::Queued),
            "leased" => Ok(JobState::Leased),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid job state: {}", s)),
        }
    }
}

/// Dispatch priority class
///
/// Ordering is realized as an integer rank so the ready-set index
/// `(rank, created_at, id)` yields dispatch order directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Lower rank dispatches first.
    pub fn rank(&self) -> i64 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => Priority::High,
            2 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(anyhow::anyhow!("Invalid priority: {}", s)),
        }
    }
}

/// Structured error recorded on a failed job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    /// Machine-readable kind (e.g. `unparseable`, `exhausted_retries`)
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Pipeline stage the error surfaced in, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Extra context for operators
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stage: None,
            details: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Error kinds the engine itself produces.
pub mod error_kind {
    pub const EXHAUSTED_RETRIES: &str = "exhausted_retries";
    pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";
    pub const BLOB_IO: &str = "blob_io";
    pub const STORE_UNAVAILABLE: &str = "store_unavailable";
    pub const SERVER_ERROR: &str = "server_error";
}

/// One unit of parsing work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    /// Sanitized original filename
    pub filename: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the upload
    pub content_hash: String,
    /// Opaque handle into the blob store
    pub blob_handle: String,
    /// Requested parsing type (`auto`, `nutrition_label`, `recipe`, `diet_guide`)
    pub parsing_type: String,
    pub priority: Priority,
    pub state: JobState,
    /// 0..=100, non-decreasing while the job is held
    pub progress: u8,
    /// Short label of the current pipeline stage
    pub stage: String,
    /// Lease acquisitions plus requeues; non-decreasing
    pub attempts: u32,
    /// Cooperative cancel flag observed at stage boundaries
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_deadline: Option<DateTime<Utc>>,
    /// Earliest re-lease time after a nack
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Structured parse result, present iff state is `completed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Present iff state is `failed` (or `cancelled` mid-pipeline)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Inputs for creating a job record
///
/// The id is generated up front so callers can key side effects (blob
/// paths, logs) before the record exists.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub filename: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub blob_handle: String,
    pub parsing_type: String,
    pub priority: Priority,
    pub callback_url: Option<String>,
}

impl NewJob {
    pub fn new(
        filename: impl Into<String>,
        size_bytes: u64,
        content_hash: impl Into<String>,
        blob_handle: impl Into<String>,
        parsing_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id: None,
            filename: filename.into(),
            size_bytes,
            content_hash: content_hash.into(),
            blob_handle: blob_handle.into(),
            parsing_type: parsing_type.into(),
            priority: Priority::Normal,
            callback_url: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }
}

/// Grouping envelope over a set of jobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub id: Uuid,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for job listings
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub states: Vec<JobState>,
    pub parsing_type: Option<String>,
    pub batch_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Aggregate statistics over the job store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreStats {
    /// Count of jobs per state, all time
    pub by_state: std::collections::BTreeMap<String, u64>,
    pub total: u64,
    /// completed / (completed + failed) within the window; 1.0 when idle
    pub success_rate: f64,
    /// Mean wall-clock duration of jobs finished within the window
    pub avg_duration_ms: Option<f64>,
    pub completed_in_window: u64,
    pub failed_in_window: u64,
    pub created_in_window: u64,
}

/// Result of a sweeper pass over expired leases
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub requeued: Vec<Uuid>,
    pub exhausted: Vec<Uuid>,
}

/// Result of a retention cleanup pass
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub deleted: u64,
    /// Blob handles whose bytes should be removed by the caller
    pub blob_handles: Vec<String>,
}

/// Outcome of a compare-and-swap state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Current state was not in the allowed from-set
    Conflict,
}

/// Outcome of an owner-checked lease operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Ok,
    /// The lease was taken over or expired; the worker must stop
    Lost,
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Job moved straight to `cancelled` (was pending or queued)
    Cancelled,
    /// Job is held by a worker; the cancel flag was set for the next
    /// stage boundary
    Requested,
    /// Job already terminal; nothing to do
    AlreadyTerminal,
    NotFound,
}

/// Terminal outcome a worker acks with
#[derive(Debug, Clone)]
pub enum AckOutcome {
    Completed(serde_json::Value),
    Failed(JobError),
    Cancelled,
}

impl AckOutcome {
    pub fn state(&self) -> JobState {
        match self {
            AckOutcome::Completed(_) => JobState::Completed,
            AckOutcome::Failed(_) => JobState::Failed,
            AckOutcome::Cancelled => JobState::Cancelled,
        }
    }
}
