//! Persistent job storage backends
//!
//! The [`JobStore`] trait is the single contract both the HTTP surface and
//! the dispatcher talk to. Implementations must make every state-changing
//! operation atomic per job id: transitions are compare-and-swap on the
//! current state, and lease-scoped writes (renew, ack, nack, progress)
//! verify the owner so a worker that lost its lease cannot clobber the
//! record.

use crate::{
    AckOutcome, Batch, CancelOutcome, CleanupReport, Job, JobFilter, JobState, LeaseOutcome,
    NewJob, StoreStats, SweepReport, TransitionOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod sqlite;

/// Errors surfaced by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record for job {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable record of every job's identity, state, and progress.
///
/// All operations are atomic and serializable per job id. Backends must
/// bump `updated_at` on every successful write.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in state `pending` and return the full record.
    async fn create(&self, new: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Transactional `pending → queued` transition. `Conflict` means the
    /// job was not pending and nothing changed.
    async fn enqueue(&self, id: Uuid) -> Result<TransitionOutcome, StoreError>;

    /// Atomically claim the highest-priority ready job.
    ///
    /// Ready means `queued` with no future `not_before` gate. The claim
    /// sets `leased`, the owner, `lease_deadline = now + duration`, and
    /// increments `attempts`. Returns `None` when the ready set is empty.
    async fn lease_next(
        &self,
        worker: &str,
        duration: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// `leased → running` under the same owner, stamping `started_at`.
    async fn mark_running(&self, id: Uuid, worker: &str) -> Result<TransitionOutcome, StoreError>;

    /// Inline execution path: `pending → running` with a synthetic owner
    /// and deadline, bypassing the queue.
    async fn begin_inline(
        &self,
        id: Uuid,
        owner: &str,
        deadline: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Extend the lease deadline; `Lost` if the owner no longer matches.
    async fn renew_lease(
        &self,
        id: Uuid,
        worker: &str,
        duration: Duration,
    ) -> Result<LeaseOutcome, StoreError>;

    /// Owner-checked terminal write from `running` (or `leased`).
    ///
    /// `Completed` stores the result and sets progress 100; `Failed`
    /// stores the error and sets progress 100; `Cancelled` clears the
    /// lease and leaves progress where the pipeline stopped.
    async fn ack(
        &self,
        id: Uuid,
        worker: &str,
        outcome: AckOutcome,
    ) -> Result<LeaseOutcome, StoreError>;

    /// Cooperative failure: return the job to `queued`, increment
    /// `attempts`, and gate re-lease by `retry_delay`. When the increment
    /// would exceed `max_attempts` the job fails with `exhausted_retries`
    /// carrying `last_error` instead.
    async fn nack(
        &self,
        id: Uuid,
        worker: &str,
        retry_delay: Duration,
        max_attempts: u32,
        last_error: crate::JobError,
    ) -> Result<LeaseOutcome, StoreError>;

    /// Progress write, only honored while the job is held; the stored
    /// percent never decreases.
    async fn update_progress(&self, id: Uuid, stage: &str, percent: u8)
        -> Result<(), StoreError>;

    /// Cancel: immediate from `pending`/`queued`, cooperative (flag only)
    /// while held, no-op when terminal.
    async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError>;

    /// Read the cooperative cancel flag.
    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Requeue every job whose lease deadline passed; jobs over the
    /// attempt budget fail with `exhausted_retries`.
    async fn requeue_expired(&self, max_attempts: u32) -> Result<SweepReport, StoreError>;

    /// Filtered page of jobs, newest first, plus the total match count.
    async fn list(
        &self,
        filter: &JobFilter,
        page: u32,
        size: u32,
    ) -> Result<(Vec<Job>, u64), StoreError>;

    /// Delete one job from any state. Returns the blob handle for the
    /// caller to remove; a tombstone is kept so later reads can
    /// distinguish deleted from never-existed.
    async fn delete(&self, id: Uuid) -> Result<Option<String>, StoreError>;

    /// Whether a job id was deleted earlier.
    async fn was_deleted(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn create_batch(&self, description: &str) -> Result<Batch, StoreError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, StoreError>;

    /// All jobs belonging to a batch, submission order.
    async fn list_batch_jobs(&self, batch_id: Uuid) -> Result<Vec<Job>, StoreError>;

    /// Aggregates: per-state counts (all time) and success/duration over
    /// the trailing window.
    async fn stats(&self, window: Duration) -> Result<StoreStats, StoreError>;

    /// Bulk-delete jobs in the given states finished before `older_than`,
    /// returning their blob handles.
    async fn cleanup(
        &self,
        older_than: DateTime<Utc>,
        states: &[JobState],
    ) -> Result<CleanupReport, StoreError>;

    /// Cheap liveness probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}
