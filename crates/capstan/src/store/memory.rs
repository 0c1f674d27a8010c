//! In-memory backend
//!
//! Keeps the whole job table behind one mutex. Used by tests and by
//! embedders that want queue semantics without a database file; it must
//! stay behaviorally identical to the SQLite backend, so both run the
//! same contract suite in `tests/store_contract.rs`.

use crate::store::{JobStore, StoreError};
use crate::{
    error_kind, AckOutcome, Batch, CancelOutcome, CleanupReport, Job, JobError, JobFilter,
    JobState, LeaseOutcome, NewJob, StoreStats, SweepReport, TransitionOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    batches: HashMap<Uuid, Batch>,
    tombstones: HashSet<Uuid>,
    /// Monotonic write clock in millis; never repeats.
    clock: i64,
}

impl Inner {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_millis();
        self.clock = self.clock.max(now - 1) + 1;
        DateTime::<Utc>::from_timestamp_millis(self.clock).unwrap_or_default()
    }
}

/// Mutex-guarded in-memory job store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let job = Job {
            id: new.id,
            batch_id: new.batch_id,
            filename: new.filename,
            size_bytes: new.size_bytes,
            content_hash: new.content_hash,
            blob_handle: new.blob_handle,
            parsing_type: new.parsing_type,
            priority: new.priority,
            state: JobState::Pending,
            progress: 0,
            stage: String::new(),
            attempts: 0,
            cancel_requested: false,
            lease_owner: None,
            lease_deadline: None,
            not_before: None,
            callback_url: new.callback_url,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        };
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn enqueue(&self, id: Uuid) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Pending => {
                job.state = JobState::Queued;
                job.updated_at = now;
                Ok(TransitionOutcome::Applied)
            }
            _ => Ok(TransitionOutcome::Conflict),
        }
    }

    async fn lease_next(
        &self,
        worker: &str,
        duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();

        let candidate = inner
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Queued && j.not_before.map(|nb| nb <= now).unwrap_or(true)
            })
            .min_by_key(|j| (j.priority.rank(), j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.state = JobState::Leased;
        job.lease_owner = Some(worker.to_string());
        job.lease_deadline = Some(now + chrono::Duration::milliseconds(duration.as_millis() as i64));
        job.attempts += 1;
        job.not_before = None;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn mark_running(&self, id: Uuid, worker: &str) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        match inner.jobs.get_mut(&id) {
            Some(job)
                if job.state == JobState::Leased && job.lease_owner.as_deref() == Some(worker) =>
            {
                job.state = JobState::Running;
                job.started_at.get_or_insert(now);
                job.updated_at = now;
                Ok(TransitionOutcome::Applied)
            }
            _ => Ok(TransitionOutcome::Conflict),
        }
    }

    async fn begin_inline(
        &self,
        id: Uuid,
        owner: &str,
        deadline: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Pending => {
                job.state = JobState::Running;
                job.lease_owner = Some(owner.to_string());
                job.lease_deadline = Some(deadline);
                job.attempts += 1;
                job.started_at = Some(now);
                job.updated_at = now;
                Ok(TransitionOutcome::Applied)
            }
            _ => Ok(TransitionOutcome::Conflict),
        }
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker: &str,
        duration: Duration,
    ) -> Result<LeaseOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state.is_held() && job.lease_owner.as_deref() == Some(worker) => {
                job.lease_deadline =
                    Some(now + chrono::Duration::milliseconds(duration.as_millis() as i64));
                job.updated_at = now;
                Ok(LeaseOutcome::Ok)
            }
            _ => Ok(LeaseOutcome::Lost),
        }
    }

    async fn ack(
        &self,
        id: Uuid,
        worker: &str,
        outcome: AckOutcome,
    ) -> Result<LeaseOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state.is_held() && job.lease_owner.as_deref() == Some(worker) => {
                match outcome {
                    AckOutcome::Completed(value) => {
                        job.state = JobState::Completed;
                        job.result = Some(value);
                        job.error = None;
                        job.progress = 100;
                    }
                    AckOutcome::Failed(err) => {
                        job.state = JobState::Failed;
                        job.error = Some(err);
                        job.result = None;
                        job.progress = 100;
                    }
                    AckOutcome::Cancelled => {
                        job.state = JobState::Cancelled;
                    }
                }
                job.lease_owner = None;
                job.lease_deadline = None;
                job.cancel_requested = false;
                job.finished_at = Some(now);
                job.updated_at = now;
                Ok(LeaseOutcome::Ok)
            }
            _ => Ok(LeaseOutcome::Lost),
        }
    }

    async fn nack(
        &self,
        id: Uuid,
        worker: &str,
        retry_delay: Duration,
        max_attempts: u32,
        last_error: JobError,
    ) -> Result<LeaseOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state.is_held() && job.lease_owner.as_deref() == Some(worker) => {
                if job.attempts + 1 > max_attempts {
                    job.state = JobState::Failed;
                    job.error = Some(
                        JobError::new(
                            error_kind::EXHAUSTED_RETRIES,
                            format!("retry budget exhausted after {} attempts", max_attempts),
                        )
                        .with_details(serde_json::to_value(&last_error)?),
                    );
                    job.progress = 100;
                    job.finished_at = Some(now);
                } else {
                    job.state = JobState::Queued;
                    job.attempts += 1;
                    job.not_before = Some(
                        now + chrono::Duration::milliseconds(retry_delay.as_millis() as i64),
                    );
                }
                job.lease_owner = None;
                job.lease_deadline = None;
                job.cancel_requested = false;
                job.updated_at = now;
                Ok(LeaseOutcome::Ok)
            }
            _ => Ok(LeaseOutcome::Lost),
        }
    }

    async fn update_progress(
        &self,
        id: Uuid,
        stage: &str,
        percent: u8,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.state.is_held() {
                job.progress = job.progress.max(percent.min(99));
                job.stage = stage.to_string();
                job.updated_at = now;
            }
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        match inner.jobs.get_mut(&id) {
            Some(job) if matches!(job.state, JobState::Pending | JobState::Queued) => {
                job.state = JobState::Cancelled;
                job.finished_at = Some(now);
                job.updated_at = now;
                Ok(CancelOutcome::Cancelled)
            }
            Some(job) if job.state.is_held() => {
                job.cancel_requested = true;
                job.updated_at = now;
                Ok(CancelOutcome::Requested)
            }
            Some(_) => Ok(CancelOutcome::AlreadyTerminal),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .get(&id)
            .map(|j| j.cancel_requested)
            .unwrap_or(false))
    }

    async fn requeue_expired(&self, max_attempts: u32) -> Result<SweepReport, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let mut report = SweepReport::default();

        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_held() && j.lease_deadline.map(|d| d < now).unwrap_or(false))
            .map(|j| j.id)
            .collect();

        for id in expired {
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            if job.attempts + 1 > max_attempts {
                job.state = JobState::Failed;
                job.error = Some(JobError::new(
                    error_kind::EXHAUSTED_RETRIES,
                    format!(
                        "lease expired and retry budget of {} attempts is exhausted",
                        max_attempts
                    ),
                ));
                job.progress = 100;
                job.finished_at = Some(now);
                report.exhausted.push(id);
            } else {
                job.state = JobState::Queued;
                job.attempts += 1;
                report.requeued.push(id);
            }
            job.lease_owner = None;
            job.lease_deadline = None;
            job.cancel_requested = false;
            job.updated_at = now;
        }

        Ok(report)
    }

    async fn list(
        &self,
        filter: &JobFilter,
        page: u32,
        size: u32,
    ) -> Result<(Vec<Job>, u64), StoreError> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|j| filter.states.is_empty() || filter.states.contains(&j.state))
            .filter(|j| {
                filter
                    .parsing_type
                    .as_ref()
                    .map(|pt| &j.parsing_type == pt)
                    .unwrap_or(true)
            })
            .filter(|j| filter.batch_id.map(|b| j.batch_id == Some(b)).unwrap_or(true))
            .filter(|j| {
                filter
                    .created_after
                    .map(|t| j.created_at >= t)
                    .unwrap_or(true)
            })
            .filter(|j| {
                filter
                    .created_before
                    .map(|t| j.created_at < t)
                    .unwrap_or(true)
            })
            .collect();

        matched.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        let total = matched.len() as u64;

        let page = page.max(1);
        let size = size.clamp(1, 500) as usize;
        let start = ((page - 1) as usize) * size;
        let jobs = matched
            .into_iter()
            .skip(start)
            .take(size)
            .cloned()
            .collect();

        Ok((jobs, total))
    }

    async fn delete(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.remove(&id) {
            Some(job) => {
                inner.tombstones.insert(id);
                Ok(Some(job.blob_handle))
            }
            None => Ok(None),
        }
    }

    async fn was_deleted(&self, id: Uuid) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tombstones.contains(&id))
    }

    async fn create_batch(&self, description: &str) -> Result<Batch, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let batch = Batch {
            id: Uuid::new_v4(),
            description: description.to_string(),
            created_at: now,
        };
        inner.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.batches.get(&id).cloned())
    }

    async fn list_batch_jobs(&self, batch_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.batch_id == Some(batch_id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(jobs)
    }

    async fn stats(&self, window: Duration) -> Result<StoreStats, StoreError> {
        let inner = self.inner.lock().await;
        let cutoff = Utc::now() - chrono::Duration::milliseconds(window.as_millis() as i64);
        let mut stats = StoreStats::default();

        for job in inner.jobs.values() {
            stats.total += 1;
            *stats.by_state.entry(job.state.to_string()).or_insert(0) += 1;

            if job.created_at >= cutoff {
                stats.created_in_window += 1;
            }
            if let Some(finished) = job.finished_at {
                if finished >= cutoff {
                    match job.state {
                        JobState::Completed => stats.completed_in_window += 1,
                        JobState::Failed => stats.failed_in_window += 1,
                        _ => {}
                    }
                }
            }
        }

        let durations: Vec<i64> = inner
            .jobs
            .values()
            .filter(|j| j.finished_at.map(|f| f >= cutoff).unwrap_or(false))
            .filter_map(|j| match (j.started_at, j.finished_at) {
                (Some(s), Some(f)) => Some((f - s).num_milliseconds()),
                _ => None,
            })
            .collect();
        if !durations.is_empty() {
            stats.avg_duration_ms =
                Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64);
        }

        let finished = stats.completed_in_window + stats.failed_in_window;
        stats.success_rate = if finished == 0 {
            1.0
        } else {
            stats.completed_in_window as f64 / finished as f64
        };

        Ok(stats)
    }

    async fn cleanup(
        &self,
        older_than: DateTime<Utc>,
        states: &[JobState],
    ) -> Result<CleanupReport, StoreError> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| states.contains(&j.state))
            .filter(|j| j.finished_at.unwrap_or(j.updated_at) < older_than)
            .map(|j| j.id)
            .collect();

        let mut report = CleanupReport::default();
        for id in doomed {
            if let Some(job) = inner.jobs.remove(&id) {
                inner.tombstones.insert(id);
                report.deleted += 1;
                report.blob_handles.push(job.blob_handle);
            }
        }
        Ok(report)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
