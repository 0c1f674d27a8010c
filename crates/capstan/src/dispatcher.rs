//! Dispatcher: the job execution loop
//!
//! A fixed set of slot loops that:
//! - claim ready jobs from the store atomically, highest priority first
//! - renew the lease while the executor runs
//! - fold cooperative cancel requests into the executor's token
//! - ack or nack the terminal outcome and fire the webhook callback
//!
//! The executor itself is injected through [`JobExecutor`] so the engine
//! stays independent of what the jobs actually do.

use crate::progress::{spawn_tracker, ProgressTracker, FLUSH_INTERVAL};
use crate::store::JobStore;
use crate::{
    config::retry_delay, AckOutcome, CallbackPayload, CallbackSender, DispatcherConfig, Job,
    JobError, LeaseOutcome, TransitionOutcome,
};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// How an execution attempt ended, from the queue's point of view
#[derive(Debug)]
pub enum ExecError {
    /// Worth retrying: the job goes back to the ready set with a delay
    Transient(JobError),
    /// Permanent: the job fails terminally
    Fatal(JobError),
    /// The cancel token tripped at a stage boundary
    Cancelled,
}

/// The work a dispatcher slot performs on a leased job.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        job: &Job,
        progress: ProgressTracker,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ExecError>;
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
    config: DispatcherConfig,
    callbacks: Option<CallbackSender>,
    /// Nudged by the API after an enqueue so idle slots skip the backoff
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        config: DispatcherConfig,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            callbacks: None,
            wake,
            shutdown,
        }
    }

    pub fn with_callbacks(mut self, sender: CallbackSender) -> Self {
        self.callbacks = Some(sender);
        self
    }

    /// Spawn one loop per concurrency slot and return their handles.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let this = Arc::new(self);
        let base = Uuid::new_v4().simple().to_string();
        let worker_base: String = base.chars().take(8).collect();

        (0..this.config.concurrency.max(1))
            .map(|slot| {
                let dispatcher = Arc::clone(&this);
                let worker_id = format!("worker-{}/{}", worker_base, slot);
                tokio::spawn(async move {
                    dispatcher.slot_loop(worker_id).await;
                })
            })
            .collect()
    }

    async fn slot_loop(&self, worker_id: String) {
        info!(worker = %worker_id, "dispatcher slot online");
        let min_backoff = Duration::from_millis(50);
        let mut backoff = min_backoff;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self
                .store
                .lease_next(&worker_id, self.config.queue.lease_duration)
                .await
            {
                Ok(Some(job)) => {
                    backoff = min_backoff;
                    self.run_one(&worker_id, job).await;
                }
                Ok(None) => {
                    let jitter = rand::rng().random_range(0..=(backoff.as_millis() as u64 / 2));
                    let sleep = backoff + Duration::from_millis(jitter);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        _ = self.wake.notified() => {
                            debug!(worker = %worker_id, "woken by enqueue");
                        }
                        _ = self.shutdown.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(self.config.idle_backoff_cap);
                }
                Err(e) => {
                    warn!(worker = %worker_id, error = %e, "lease query failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        info!(worker = %worker_id, "dispatcher slot stopped");
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, worker = %worker_id))]
    async fn run_one(&self, worker_id: &str, job: Job) {
        match self.store.mark_running(job.id, worker_id).await {
            Ok(TransitionOutcome::Applied) => {}
            Ok(TransitionOutcome::Conflict) => {
                warn!("lease changed hands before execution started");
                return;
            }
            Err(e) => {
                warn!(error = %e, "could not mark job running");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let renewer = self.spawn_renewer(job.id, worker_id.to_string(), cancel.clone());
        let (tracker, flusher) = spawn_tracker(Arc::clone(&self.store), job.id, FLUSH_INTERVAL);

        // Run the executor in its own task so a panic fails the job
        // instead of killing the slot loop.
        let exec_task = tokio::spawn({
            let executor = Arc::clone(&self.executor);
            let job = job.clone();
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            async move { executor.execute(&job, tracker, cancel).await }
        });
        let outcome = match exec_task.await {
            Ok(result) => result,
            Err(join_err) => Err(ExecError::Fatal(JobError::new(
                crate::error_kind::SERVER_ERROR,
                format!("executor panicked: {}", join_err),
            ))),
        };

        drop(tracker);
        let _ = flusher.await;
        renewer.abort();

        let (ack, payload) = match outcome {
            Ok(result) => {
                info!("job completed");
                (
                    AckOutcome::Completed(result.clone()),
                    Some(CallbackPayload {
                        job_id: job.id,
                        state: crate::JobState::Completed,
                        result: Some(result),
                        error: None,
                    }),
                )
            }
            Err(ExecError::Cancelled) => {
                info!("job cancelled at stage boundary");
                (
                    AckOutcome::Cancelled,
                    Some(CallbackPayload {
                        job_id: job.id,
                        state: crate::JobState::Cancelled,
                        result: None,
                        error: None,
                    }),
                )
            }
            Err(ExecError::Transient(err)) => {
                let delay = retry_delay(job.attempts);
                warn!(kind = %err.kind, delay_s = delay.as_secs(), "transient failure, requeueing");
                match self
                    .store
                    .nack(
                        job.id,
                        worker_id,
                        delay,
                        self.config.queue.max_attempts,
                        err,
                    )
                    .await
                {
                    Ok(LeaseOutcome::Ok) => {}
                    Ok(LeaseOutcome::Lost) => warn!("lease lost before nack"),
                    Err(e) => warn!(error = %e, "nack failed"),
                }
                return;
            }
            Err(ExecError::Fatal(err)) => {
                warn!(kind = %err.kind, "permanent failure");
                (
                    AckOutcome::Failed(err.clone()),
                    Some(CallbackPayload {
                        job_id: job.id,
                        state: crate::JobState::Failed,
                        result: None,
                        error: Some(err),
                    }),
                )
            }
        };

        match self.store.ack(job.id, worker_id, ack).await {
            Ok(LeaseOutcome::Ok) => {
                if let (Some(sender), Some(url), Some(payload)) =
                    (&self.callbacks, &job.callback_url, payload)
                {
                    sender.deliver_detached(url.clone(), payload);
                }
            }
            Ok(LeaseOutcome::Lost) => warn!("lease lost before ack; sweeper will reclaim"),
            Err(e) => warn!(error = %e, "ack failed"),
        }
    }

    /// Keep the lease alive and watch the cooperative cancel flag while
    /// the executor runs.
    fn spawn_renewer(
        &self,
        job_id: Uuid,
        worker_id: String,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let lease = self.config.queue.lease_duration;
        let interval = lease / 3;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;

                match store.cancel_requested(job_id).await {
                    Ok(true) => {
                        debug!(%job_id, "cancel requested; tripping token");
                        cancel.cancel();
                    }
                    Ok(false) => {}
                    Err(e) => warn!(%job_id, error = %e, "cancel flag read failed"),
                }

                match store.renew_lease(job_id, &worker_id, lease).await {
                    Ok(LeaseOutcome::Ok) => {}
                    Ok(LeaseOutcome::Lost) => {
                        warn!(%job_id, "lease lost during execution");
                        cancel.cancel();
                        break;
                    }
                    Err(e) => warn!(%job_id, error = %e, "lease renewal failed"),
                }
            }
        })
    }
}
