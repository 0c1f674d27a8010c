//! SQLite backend implementation
//!
//! Persistent storage using SQLite with WAL mode for concurrency. Claims
//! and transitions are single `UPDATE ... RETURNING` statements so two
//! dispatcher slots (or two processes sharing the database file) can never
//! lease the same job.

use crate::store::{JobStore, StoreError};
use crate::{
    error_kind, AckOutcome, Batch, CancelOutcome, CleanupReport, Job, JobError, JobFilter,
    JobState, LeaseOutcome, NewJob, Priority, StoreStats, SweepReport, TransitionOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, batch_id, filename, size_bytes, content_hash, blob_handle, \
     parsing_type, priority, state, progress, stage, attempts, cancel_requested, \
     lease_owner, lease_deadline, not_before, callback_url, \
     created_at, updated_at, started_at, finished_at, result, error";

/// SQLite-backed job store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a SQLite database at the specified path.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Get the underlying pool (for advanced usage)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                batch_id TEXT,
                filename TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                blob_handle TEXT NOT NULL,
                parsing_type TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 1,
                state TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                stage TEXT NOT NULL DEFAULT '',
                attempts INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT,
                lease_deadline INTEGER,
                not_before INTEGER,
                callback_url TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                result TEXT,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs (state, priority, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_batch ON jobs (batch_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deleted_jobs (
                id TEXT PRIMARY KEY,
                deleted_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let id_str: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id_str).map_err(|e| StoreError::Corrupt {
        id: Uuid::nil(),
        reason: format!("bad job id {}: {}", id_str, e),
    })?;

    let state_str: String = row.try_get("state")?;
    let state = JobState::from_str(&state_str).map_err(|e| StoreError::Corrupt {
        id,
        reason: e.to_string(),
    })?;

    let batch_id: Option<String> = row.try_get("batch_id")?;
    let batch_id = match batch_id {
        Some(s) => Some(Uuid::parse_str(&s).map_err(|e| StoreError::Corrupt {
            id,
            reason: format!("bad batch id: {}", e),
        })?),
        None => None,
    };

    let result: Option<String> = row.try_get("result")?;
    let result = match result {
        Some(s) => Some(serde_json::from_str(&s)?),
        None => None,
    };
    let error: Option<String> = row.try_get("error")?;
    let error: Option<JobError> = match error {
        Some(s) => Some(serde_json::from_str(&s)?),
        None => None,
    };

    Ok(Job {
        id,
        batch_id,
        filename: row.try_get("filename")?,
        size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
        content_hash: row.try_get("content_hash")?,
        blob_handle: row.try_get("blob_handle")?,
        parsing_type: row.try_get("parsing_type")?,
        priority: Priority::from_rank(row.try_get::<i64, _>("priority")?),
        state,
        progress: row.try_get::<i64, _>("progress")?.clamp(0, 100) as u8,
        stage: row.try_get("stage")?,
        attempts: row.try_get::<i64, _>("attempts")?.max(0) as u32,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        lease_owner: row.try_get("lease_owner")?,
        lease_deadline: row
            .try_get::<Option<i64>, _>("lease_deadline")?
            .map(ms_to_utc),
        not_before: row.try_get::<Option<i64>, _>("not_before")?.map(ms_to_utc),
        callback_url: row.try_get("callback_url")?,
        created_at: ms_to_utc(row.try_get("created_at")?),
        updated_at: ms_to_utc(row.try_get("updated_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(ms_to_utc),
        finished_at: row.try_get::<Option<i64>, _>("finished_at")?.map(ms_to_utc),
        result,
        error,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let now = now_ms();

        let row = sqlx::query(&format!(
            "INSERT INTO jobs (id, batch_id, filename, size_bytes, content_hash, blob_handle, \
             parsing_type, priority, state, callback_url, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?) \
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(new.id.to_string())
        .bind(new.batch_id.map(|b| b.to_string()))
        .bind(&new.filename)
        .bind(new.size_bytes as i64)
        .bind(&new.content_hash)
        .bind(&new.blob_handle)
        .bind(&new.parsing_type)
        .bind(new.priority.rank())
        .bind(&new.callback_url)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row_to_job(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(row_to_job(&r)?)),
            None => Ok(None),
        }
    }

    async fn enqueue(&self, id: Uuid) -> Result<TransitionOutcome, StoreError> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE jobs SET state = 'queued', updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? AND state = 'pending'",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            TransitionOutcome::Applied
        } else {
            TransitionOutcome::Conflict
        })
    }

    async fn lease_next(
        &self,
        worker: &str,
        duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = now_ms();
        let deadline = now + duration.as_millis() as i64;

        // Atomic claim: highest priority class first, FIFO within it.
        let row = sqlx::query(&format!(
            "UPDATE jobs SET \
                 state = 'leased', \
                 lease_owner = ?, \
                 lease_deadline = ?, \
                 attempts = attempts + 1, \
                 not_before = NULL, \
                 updated_at = MAX(?, updated_at + 1) \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE state = 'queued' AND (not_before IS NULL OR not_before <= ?) \
                 ORDER BY priority ASC, created_at ASC, id ASC \
                 LIMIT 1 \
             ) \
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(worker)
        .bind(deadline)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_job(&r)?)),
            None => Ok(None),
        }
    }

    async fn mark_running(&self, id: Uuid, worker: &str) -> Result<TransitionOutcome, StoreError> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE jobs SET state = 'running', started_at = COALESCE(started_at, ?), \
             updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? AND state = 'leased' AND lease_owner = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .bind(worker)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            TransitionOutcome::Applied
        } else {
            TransitionOutcome::Conflict
        })
    }

    async fn begin_inline(
        &self,
        id: Uuid,
        owner: &str,
        deadline: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE jobs SET state = 'running', lease_owner = ?, lease_deadline = ?, \
             attempts = attempts + 1, started_at = ?, updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? AND state = 'pending'",
        )
        .bind(owner)
        .bind(deadline.timestamp_millis())
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            TransitionOutcome::Applied
        } else {
            TransitionOutcome::Conflict
        })
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker: &str,
        duration: Duration,
    ) -> Result<LeaseOutcome, StoreError> {
        let now = now_ms();
        let deadline = now + duration.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE jobs SET lease_deadline = ?, updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? AND lease_owner = ? AND state IN ('leased', 'running')",
        )
        .bind(deadline)
        .bind(now)
        .bind(id.to_string())
        .bind(worker)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            LeaseOutcome::Ok
        } else {
            LeaseOutcome::Lost
        })
    }

    async fn ack(
        &self,
        id: Uuid,
        worker: &str,
        outcome: AckOutcome,
    ) -> Result<LeaseOutcome, StoreError> {
        let now = now_ms();
        let result = match outcome {
            AckOutcome::Completed(value) => {
                sqlx::query(
                    "UPDATE jobs SET state = 'completed', result = ?, error = NULL, \
                     progress = 100, finished_at = ?, lease_owner = NULL, \
                     lease_deadline = NULL, cancel_requested = 0, \
                     updated_at = MAX(?, updated_at + 1) \
                     WHERE id = ? AND lease_owner = ? AND state IN ('leased', 'running')",
                )
                .bind(serde_json::to_string(&value)?)
                .bind(now)
                .bind(now)
                .bind(id.to_string())
                .bind(worker)
                .execute(&self.pool)
                .await?
            }
            AckOutcome::Failed(err) => {
                sqlx::query(
                    "UPDATE jobs SET state = 'failed', error = ?, result = NULL, \
                     progress = 100, finished_at = ?, lease_owner = NULL, \
                     lease_deadline = NULL, cancel_requested = 0, \
                     updated_at = MAX(?, updated_at + 1) \
                     WHERE id = ? AND lease_owner = ? AND state IN ('leased', 'running')",
                )
                .bind(serde_json::to_string(&err)?)
                .bind(now)
                .bind(now)
                .bind(id.to_string())
                .bind(worker)
                .execute(&self.pool)
                .await?
            }
            AckOutcome::Cancelled => {
                sqlx::query(
                    "UPDATE jobs SET state = 'cancelled', finished_at = ?, \
                     lease_owner = NULL, lease_deadline = NULL, cancel_requested = 0, \
                     updated_at = MAX(?, updated_at + 1) \
                     WHERE id = ? AND lease_owner = ? AND state IN ('leased', 'running')",
                )
                .bind(now)
                .bind(now)
                .bind(id.to_string())
                .bind(worker)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(if result.rows_affected() == 1 {
            LeaseOutcome::Ok
        } else {
            LeaseOutcome::Lost
        })
    }

    async fn nack(
        &self,
        id: Uuid,
        worker: &str,
        retry_delay: Duration,
        max_attempts: u32,
        last_error: JobError,
    ) -> Result<LeaseOutcome, StoreError> {
        let now = now_ms();

        // A requeue that would exceed the attempt budget fails the job
        // instead of parking it in the ready set forever.
        let exhausted = JobError::new(
            error_kind::EXHAUSTED_RETRIES,
            format!("retry budget exhausted after {} attempts", max_attempts),
        )
        .with_details(serde_json::to_value(&last_error)?);

        let failed = sqlx::query(
            "UPDATE jobs SET state = 'failed', error = ?, progress = 100, finished_at = ?, \
             lease_owner = NULL, lease_deadline = NULL, cancel_requested = 0, \
             updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? AND lease_owner = ? AND state IN ('leased', 'running') \
             AND attempts + 1 > ?",
        )
        .bind(serde_json::to_string(&exhausted)?)
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .bind(worker)
        .bind(max_attempts as i64)
        .execute(&self.pool)
        .await?;

        if failed.rows_affected() == 1 {
            return Ok(LeaseOutcome::Ok);
        }

        let not_before = now + retry_delay.as_millis() as i64;
        let requeued = sqlx::query(
            "UPDATE jobs SET state = 'queued', attempts = attempts + 1, \
             lease_owner = NULL, lease_deadline = NULL, not_before = ?, \
             updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? AND lease_owner = ? AND state IN ('leased', 'running')",
        )
        .bind(not_before)
        .bind(now)
        .bind(id.to_string())
        .bind(worker)
        .execute(&self.pool)
        .await?;

        Ok(if requeued.rows_affected() == 1 {
            LeaseOutcome::Ok
        } else {
            LeaseOutcome::Lost
        })
    }

    async fn update_progress(
        &self,
        id: Uuid,
        stage: &str,
        percent: u8,
    ) -> Result<(), StoreError> {
        // 100 is reserved for terminal writes.
        let percent = percent.min(99) as i64;
        let now = now_ms();
        sqlx::query(
            "UPDATE jobs SET progress = MAX(progress, ?), stage = ?, \
             updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? AND state IN ('leased', 'running')",
        )
        .bind(percent)
        .bind(stage)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let now = now_ms();

        let direct = sqlx::query(
            "UPDATE jobs SET state = 'cancelled', finished_at = ?, \
             updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? AND state IN ('pending', 'queued')",
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if direct.rows_affected() == 1 {
            return Ok(CancelOutcome::Cancelled);
        }

        let flagged = sqlx::query(
            "UPDATE jobs SET cancel_requested = 1, updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? AND state IN ('leased', 'running')",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if flagged.rows_affected() == 1 {
            return Ok(CancelOutcome::Requested);
        }

        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(if exists.is_some() {
            CancelOutcome::AlreadyTerminal
        } else {
            CancelOutcome::NotFound
        })
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT cancel_requested FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.get::<i64, _>("cancel_requested") != 0)
            .unwrap_or(false))
    }

    async fn requeue_expired(&self, max_attempts: u32) -> Result<SweepReport, StoreError> {
        let now = now_ms();
        let mut report = SweepReport::default();

        let exhausted_err = serde_json::to_string(&JobError::new(
            error_kind::EXHAUSTED_RETRIES,
            format!(
                "lease expired and retry budget of {} attempts is exhausted",
                max_attempts
            ),
        ))?;

        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            "UPDATE jobs SET state = 'failed', error = ?, progress = 100, finished_at = ?, \
             lease_owner = NULL, lease_deadline = NULL, cancel_requested = 0, \
             updated_at = MAX(?, updated_at + 1) \
             WHERE state IN ('leased', 'running') AND lease_deadline < ? \
             AND attempts + 1 > ? \
             RETURNING id",
        )
        .bind(&exhausted_err)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(max_attempts as i64)
        .fetch_all(&mut *tx)
        .await?;

        for row in &failed {
            let id: String = row.get("id");
            if let Ok(id) = Uuid::parse_str(&id) {
                report.exhausted.push(id);
            }
        }

        let requeued = sqlx::query(
            "UPDATE jobs SET state = 'queued', attempts = attempts + 1, \
             lease_owner = NULL, lease_deadline = NULL, \
             updated_at = MAX(?, updated_at + 1) \
             WHERE state IN ('leased', 'running') AND lease_deadline < ? \
             RETURNING id",
        )
        .bind(now)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for row in &requeued {
            let id: String = row.get("id");
            if let Ok(id) = Uuid::parse_str(&id) {
                report.requeued.push(id);
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn list(
        &self,
        filter: &JobFilter,
        page: u32,
        size: u32,
    ) -> Result<(Vec<Job>, u64), StoreError> {
        fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter) {
            qb.push(" WHERE 1 = 1");
            if !filter.states.is_empty() {
                qb.push(" AND state IN (");
                let mut sep = qb.separated(", ");
                for state in &filter.states {
                    sep.push_bind(state.to_string());
                }
                qb.push(")");
            }
            if let Some(pt) = &filter.parsing_type {
                qb.push(" AND parsing_type = ").push_bind(pt.clone());
            }
            if let Some(batch) = filter.batch_id {
                qb.push(" AND batch_id = ").push_bind(batch.to_string());
            }
            if let Some(after) = filter.created_after {
                qb.push(" AND created_at >= ")
                    .push_bind(after.timestamp_millis());
            }
            if let Some(before) = filter.created_before {
                qb.push(" AND created_at < ")
                    .push_bind(before.timestamp_millis());
            }
        }

        let mut count_qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM jobs");
        push_filters(&mut count_qb, filter);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await?
            .get::<i64, _>("n");

        let page = page.max(1);
        let size = size.clamp(1, 500);
        let offset = (page - 1) as i64 * size as i64;

        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM jobs", JOB_COLUMNS));
        push_filters(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(size as i64)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let jobs = rows
            .iter()
            .map(row_to_job)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((jobs, total.max(0) as u64))
    }

    async fn delete(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("DELETE FROM jobs WHERE id = ? RETURNING blob_handle")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let handle = match row {
            Some(r) => {
                sqlx::query("INSERT OR IGNORE INTO deleted_jobs (id, deleted_at) VALUES (?, ?)")
                    .bind(id.to_string())
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                Some(r.get::<String, _>("blob_handle"))
            }
            None => None,
        };

        tx.commit().await?;
        Ok(handle)
    }

    async fn was_deleted(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM deleted_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn create_batch(&self, description: &str) -> Result<Batch, StoreError> {
        let batch = Batch {
            id: Uuid::new_v4(),
            description: description.to_string(),
            created_at: ms_to_utc(now_ms()),
        };
        sqlx::query("INSERT INTO batches (id, description, created_at) VALUES (?, ?, ?)")
            .bind(batch.id.to_string())
            .bind(&batch.description)
            .bind(batch.created_at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(batch)
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, StoreError> {
        let row = sqlx::query("SELECT id, description, created_at FROM batches WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                let id_str: String = r.get("id");
                Ok(Some(Batch {
                    id: Uuid::parse_str(&id_str).map_err(|e| StoreError::Corrupt {
                        id: Uuid::nil(),
                        reason: format!("bad batch id {}: {}", id_str, e),
                    })?,
                    description: r.get("description"),
                    created_at: ms_to_utc(r.get("created_at")),
                }))
            }
            None => Ok(None),
        }
    }

    async fn list_batch_jobs(&self, batch_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE batch_id = ? ORDER BY created_at ASC, id ASC",
            JOB_COLUMNS
        ))
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn stats(&self, window: Duration) -> Result<StoreStats, StoreError> {
        let cutoff = now_ms() - window.as_millis() as i64;
        let mut stats = StoreStats::default();

        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            stats.total += n.max(0) as u64;
            stats.by_state.insert(state, n.max(0) as u64);
        }

        let row = sqlx::query(
            "SELECT \
                 SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END) AS completed, \
                 SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END) AS failed, \
                 AVG(CASE WHEN started_at IS NOT NULL THEN finished_at - started_at END) AS avg_ms \
             FROM jobs WHERE finished_at IS NOT NULL AND finished_at >= ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        stats.completed_in_window = row.get::<Option<i64>, _>("completed").unwrap_or(0) as u64;
        stats.failed_in_window = row.get::<Option<i64>, _>("failed").unwrap_or(0) as u64;
        stats.avg_duration_ms = row.get::<Option<f64>, _>("avg_ms");

        let finished = stats.completed_in_window + stats.failed_in_window;
        stats.success_rate = if finished == 0 {
            1.0
        } else {
            stats.completed_in_window as f64 / finished as f64
        };

        let created: i64 = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE created_at >= ?")
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?
            .get("n");
        stats.created_in_window = created.max(0) as u64;

        Ok(stats)
    }

    async fn cleanup(
        &self,
        older_than: DateTime<Utc>,
        states: &[JobState],
    ) -> Result<CleanupReport, StoreError> {
        if states.is_empty() {
            return Ok(CleanupReport::default());
        }
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("DELETE FROM jobs WHERE state IN (");
        let mut sep = qb.separated(", ");
        for state in states {
            sep.push_bind(state.to_string());
        }
        qb.push(") AND COALESCE(finished_at, updated_at) < ")
            .push_bind(older_than.timestamp_millis())
            .push(" RETURNING id, blob_handle");

        let rows = qb.build().fetch_all(&mut *tx).await?;

        let mut report = CleanupReport::default();
        for row in rows {
            let id: String = row.get("id");
            sqlx::query("INSERT OR IGNORE INTO deleted_jobs (id, deleted_at) VALUES (?, ?)")
                .bind(&id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            report.deleted += 1;
            report.blob_handles.push(row.get("blob_handle"));
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let store = SqliteStore::open(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn sample_job(name: &str) -> NewJob {
        NewJob::new(name, 2048, "abc123", format!("blobs/{}", name), "auto")
    }

    #[tokio::test]
    async fn test_create_starts_pending() {
        let (_dir, store) = open_temp().await;
        let job = store.create(sample_job("a.pdf")).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 0);
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_priority_dispatch_order() {
        let (_dir, store) = open_temp().await;
        let normal = store
            .create(sample_job("n.pdf").with_priority(Priority::Normal))
            .await
            .unwrap();
        let low = store
            .create(sample_job("l.pdf").with_priority(Priority::Low))
            .await
            .unwrap();
        let high = store
            .create(sample_job("h.pdf").with_priority(Priority::High))
            .await
            .unwrap();
        for id in [normal.id, low.id, high.id] {
            assert_eq!(store.enqueue(id).await.unwrap(), TransitionOutcome::Applied);
        }

        let lease = Duration::from_secs(30);
        let first = store.lease_next("w1", lease).await.unwrap().unwrap();
        let second = store.lease_next("w1", lease).await.unwrap().unwrap();
        let third = store.lease_next("w1", lease).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(second.id, normal.id);
        assert_eq!(third.id, low.id);
        assert!(store.lease_next("w1", lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_priority_class() {
        let (_dir, store) = open_temp().await;
        let a = store.create(sample_job("a.pdf")).await.unwrap();
        // Distinct created_at millis so submission order is unambiguous.
        tokio::time::sleep(Duration::from_millis(2)).await;
        let b = store.create(sample_job("b.pdf")).await.unwrap();
        store.enqueue(a.id).await.unwrap();
        store.enqueue(b.id).await.unwrap();

        let first = store
            .lease_next("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, a.id);
    }

    #[tokio::test]
    async fn test_lease_then_complete() {
        let (_dir, store) = open_temp().await;
        let job = store.create(sample_job("a.pdf")).await.unwrap();
        store.enqueue(job.id).await.unwrap();

        let leased = store
            .lease_next("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.state, JobState::Leased);
        assert_eq!(leased.attempts, 1);
        assert_eq!(leased.lease_owner.as_deref(), Some("w1"));

        assert_eq!(
            store.mark_running(job.id, "w1").await.unwrap(),
            TransitionOutcome::Applied
        );
        store.update_progress(job.id, "extract_text", 40).await.unwrap();

        let outcome = store
            .ack(
                job.id,
                "w1",
                AckOutcome::Completed(serde_json::json!({"type": "unknown"})),
            )
            .await
            .unwrap();
        assert_eq!(outcome, LeaseOutcome::Ok);

        let done = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.result.is_some());
        assert!(done.error.is_none());
        assert!(done.lease_owner.is_none());
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_ack_by_wrong_owner_is_lost() {
        let (_dir, store) = open_temp().await;
        let job = store.create(sample_job("a.pdf")).await.unwrap();
        store.enqueue(job.id).await.unwrap();
        store
            .lease_next("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let outcome = store
            .ack(job.id, "w2", AckOutcome::Cancelled)
            .await
            .unwrap();
        assert_eq!(outcome, LeaseOutcome::Lost);

        let still = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(still.state, JobState::Leased);
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let (_dir, store) = open_temp().await;
        let job = store.create(sample_job("a.pdf")).await.unwrap();
        store.enqueue(job.id).await.unwrap();
        store
            .lease_next("w1", Duration::from_secs(30))
            .await
            .unwrap();
        store.mark_running(job.id, "w1").await.unwrap();

        store.update_progress(job.id, "extract_text", 40).await.unwrap();
        store.update_progress(job.id, "detect_type", 10).await.unwrap();

        let current = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(current.progress, 40);
        assert_eq!(current.stage, "detect_type");
    }

    #[tokio::test]
    async fn test_expired_lease_requeues_and_increments_attempts() {
        let (_dir, store) = open_temp().await;
        let job = store.create(sample_job("a.pdf")).await.unwrap();
        store.enqueue(job.id).await.unwrap();

        // Zero-length lease expires immediately.
        store
            .lease_next("w1", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = store.requeue_expired(3).await.unwrap();
        assert_eq!(report.requeued, vec![job.id]);
        assert!(report.exhausted.is_empty());

        let swept = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(swept.state, JobState::Queued);
        assert_eq!(swept.attempts, 2);
        assert!(swept.lease_owner.is_none());

        // A healthy worker picks it up again.
        let again = store
            .lease_next("w2", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 3);
    }

    #[tokio::test]
    async fn test_sweeper_fails_job_over_attempt_budget() {
        let (_dir, store) = open_temp().await;
        let job = store.create(sample_job("a.pdf")).await.unwrap();
        store.enqueue(job.id).await.unwrap();

        for _ in 0..3 {
            store
                .lease_next("w1", Duration::from_millis(0))
                .await
                .unwrap()
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            store.requeue_expired(3).await.unwrap();
        }

        let done = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Failed);
        let err = done.error.unwrap();
        assert_eq!(err.kind, "exhausted_retries");
        assert_eq!(done.progress, 100);
    }

    #[tokio::test]
    async fn test_nack_delays_release() {
        let (_dir, store) = open_temp().await;
        let job = store.create(sample_job("a.pdf")).await.unwrap();
        store.enqueue(job.id).await.unwrap();
        store
            .lease_next("w1", Duration::from_secs(30))
            .await
            .unwrap();
        store.mark_running(job.id, "w1").await.unwrap();

        let outcome = store
            .nack(
                job.id,
                "w1",
                Duration::from_secs(60),
                3,
                JobError::new("blob_io", "read timed out"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, LeaseOutcome::Ok);

        let parked = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(parked.state, JobState::Queued);
        assert_eq!(parked.attempts, 2);
        assert!(parked.not_before.is_some());

        // Delay gate hides it from lease_next.
        assert!(store
            .lease_next("w2", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let (_dir, store) = open_temp().await;
        let queued = store.create(sample_job("q.pdf")).await.unwrap();
        store.enqueue(queued.id).await.unwrap();
        assert_eq!(
            store.cancel(queued.id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(
            store.get(queued.id).await.unwrap().unwrap().state,
            JobState::Cancelled
        );

        let running = store.create(sample_job("r.pdf")).await.unwrap();
        store.enqueue(running.id).await.unwrap();
        store
            .lease_next("w1", Duration::from_secs(30))
            .await
            .unwrap();
        store.mark_running(running.id, "w1").await.unwrap();
        assert_eq!(
            store.cancel(running.id).await.unwrap(),
            CancelOutcome::Requested
        );
        assert!(store.cancel_requested(running.id).await.unwrap());
        assert_eq!(
            store.get(running.id).await.unwrap().unwrap().state,
            JobState::Running
        );
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let (_dir, store) = open_temp().await;
        let job = store.create(sample_job("a.pdf")).await.unwrap();

        let handle = store.delete(job.id).await.unwrap();
        assert_eq!(handle.as_deref(), Some("blobs/a.pdf"));
        assert!(store.get(job.id).await.unwrap().is_none());
        assert!(store.was_deleted(job.id).await.unwrap());

        // Idempotent.
        assert!(store.delete(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let (_dir, store) = open_temp().await;
        for i in 0..5 {
            let job = store
                .create(sample_job(&format!("f{}.pdf", i)))
                .await
                .unwrap();
            store.enqueue(job.id).await.unwrap();
        }
        let pending = store.create(sample_job("p.pdf")).await.unwrap();

        let filter = JobFilter {
            states: vec![JobState::Queued],
            ..Default::default()
        };
        let (jobs, total) = store.list(&filter, 1, 3).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(jobs.len(), 3);

        let (rest, _) = store.list(&filter, 2, 3).await.unwrap();
        assert_eq!(rest.len(), 2);

        let (all, total_all) = store.list(&JobFilter::default(), 1, 50).await.unwrap();
        assert_eq!(total_all, 6);
        assert!(all.iter().any(|j| j.id == pending.id));
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let (_dir, store) = open_temp().await;
        let job = store.create(sample_job("a.pdf")).await.unwrap();
        store.enqueue(job.id).await.unwrap();
        store
            .lease_next("w1", Duration::from_secs(30))
            .await
            .unwrap();
        store.mark_running(job.id, "w1").await.unwrap();
        store
            .ack(job.id, "w1", AckOutcome::Completed(serde_json::json!({})))
            .await
            .unwrap();

        let stats = store.stats(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stats.by_state.get("completed"), Some(&1));
        assert_eq!(stats.completed_in_window, 1);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);

        let report = store
            .cleanup(
                Utc::now() + chrono::Duration::seconds(1),
                &[JobState::Completed, JobState::Failed],
            )
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.blob_handles, vec!["blobs/a.pdf".to_string()]);
        assert!(store.was_deleted(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_batches() {
        let (_dir, store) = open_temp().await;
        let batch = store.create_batch("menu scans").await.unwrap();
        for i in 0..3 {
            store
                .create(sample_job(&format!("b{}.pdf", i)).with_batch(batch.id))
                .await
                .unwrap();
        }

        let fetched = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(fetched.description, "menu scans");

        let jobs = store.list_batch_jobs(batch.id).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.batch_id == Some(batch.id)));
    }
}
