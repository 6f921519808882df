//! PostgreSQL lifecycle store over `stage_lifecycle_entries` and `stage_jobs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::errors::{LifecycleError, LifecycleResult};
use super::lifecycle::{JobSummary, JobUpdate, StageLifecycleEntry, StageSettings};
use super::persistence::StageLifecycleStore;
use super::states::{JobStatus, StageStatus};

const ENTRY_COLUMNS: &str = "job_id, stage, attempt_count, max_attempts, retry_delay_seconds, \
     priority, status, started_at, finished_at, last_error, next_retry_at, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct StageLifecycleRow {
    job_id: Uuid,
    stage: String,
    attempt_count: i32,
    max_attempts: i32,
    retry_delay_seconds: i32,
    priority: i32,
    status: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<Value>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StageLifecycleRow> for StageLifecycleEntry {
    type Error = LifecycleError;

    fn try_from(row: StageLifecycleRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<StageStatus>()
            .map_err(|message| LifecycleError::invalid_record(row.job_id, &row.stage, message))?;

        Ok(Self {
            job_id: row.job_id,
            stage: row.stage,
            attempt_count: to_u32(row.attempt_count),
            max_attempts: to_u32(row.max_attempts),
            retry_delay_seconds: to_u32(row.retry_delay_seconds),
            priority: row.priority,
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            last_error: row.last_error,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobSummaryRow {
    job_id: Uuid,
    status: String,
    current_stage: Option<String>,
    last_completed_at: Option<DateTime<Utc>>,
    last_failed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobSummaryRow> for JobSummary {
    type Error = LifecycleError;

    fn try_from(row: JobSummaryRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<JobStatus>().map_err(|message| {
            LifecycleError::invalid_record(
                row.job_id,
                row.current_stage.clone().unwrap_or_default(),
                message,
            )
        })?;

        Ok(Self {
            job_id: row.job_id,
            status,
            current_stage: row.current_stage,
            last_completed_at: row.last_completed_at,
            last_failed_at: row.last_failed_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Lifecycle store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgStageLifecycleStore {
    pool: PgPool,
}

impl PgStageLifecycleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageLifecycleStore for PgStageLifecycleStore {
    async fn begin_attempt(
        &self,
        job_id: Uuid,
        stage: &str,
        settings: &StageSettings,
    ) -> LifecycleResult<StageLifecycleEntry> {
        let sql = format!(
            r#"
            INSERT INTO stage_lifecycle_entries
                (job_id, stage, attempt_count, max_attempts, retry_delay_seconds, priority,
                 status, started_at, created_at, updated_at)
            VALUES ($1, $2, 1, $3, $4, $5, 'processing', NOW(), NOW(), NOW())
            ON CONFLICT (job_id, stage) DO UPDATE SET
                attempt_count = stage_lifecycle_entries.attempt_count + 1,
                status = 'processing',
                started_at = NOW(),
                finished_at = NULL,
                last_error = NULL,
                next_retry_at = NULL,
                updated_at = NOW()
            RETURNING {ENTRY_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, StageLifecycleRow>(&sql)
            .bind(job_id)
            .bind(stage)
            .bind(to_i32(settings.max_attempts))
            .bind(to_i32(settings.retry_delay_seconds))
            .bind(settings.priority)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn load_stage(
        &self,
        job_id: Uuid,
        stage: &str,
    ) -> LifecycleResult<Option<StageLifecycleEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM stage_lifecycle_entries WHERE job_id = $1 AND stage = $2"
        );
        let row = sqlx::query_as::<_, StageLifecycleRow>(&sql)
            .bind(job_id)
            .bind(stage)
            .fetch_optional(&self.pool)
            .await?;

        row.map(StageLifecycleEntry::try_from).transpose()
    }

    async fn save_stage(&self, entry: &StageLifecycleEntry) -> LifecycleResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_lifecycle_entries
                (job_id, stage, attempt_count, max_attempts, retry_delay_seconds, priority,
                 status, started_at, finished_at, last_error, next_retry_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (job_id, stage) DO UPDATE SET
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                last_error = EXCLUDED.last_error,
                next_retry_at = EXCLUDED.next_retry_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(entry.job_id)
        .bind(&entry.stage)
        .bind(to_i32(entry.attempt_count))
        .bind(to_i32(entry.max_attempts))
        .bind(to_i32(entry.retry_delay_seconds))
        .bind(entry.priority)
        .bind(entry.status.as_str())
        .bind(entry.started_at)
        .bind(entry.finished_at)
        .bind(&entry.last_error)
        .bind(entry.next_retry_at)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_job(&self, update: &JobUpdate) -> LifecycleResult<JobSummary> {
        let row = sqlx::query_as::<_, JobSummaryRow>(
            r#"
            INSERT INTO stage_jobs
                (job_id, status, current_stage, last_completed_at, last_failed_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                current_stage = COALESCE(EXCLUDED.current_stage, stage_jobs.current_stage),
                last_completed_at = COALESCE(EXCLUDED.last_completed_at, stage_jobs.last_completed_at),
                last_failed_at = COALESCE(EXCLUDED.last_failed_at, stage_jobs.last_failed_at),
                updated_at = NOW()
            RETURNING job_id, status, current_stage, last_completed_at, last_failed_at, updated_at
            "#,
        )
        .bind(update.job_id)
        .bind(update.status.as_str())
        .bind(&update.current_stage)
        .bind(update.completed_at)
        .bind(update.failed_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn load_job(&self, job_id: Uuid) -> LifecycleResult<Option<JobSummary>> {
        let row = sqlx::query_as::<_, JobSummaryRow>(
            "SELECT job_id, status, current_stage, last_completed_at, last_failed_at, updated_at \
             FROM stage_jobs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobSummary::try_from).transpose()
    }

    async fn list_stages(&self, job_id: Uuid) -> LifecycleResult<Vec<StageLifecycleEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM stage_lifecycle_entries WHERE job_id = $1 ORDER BY stage"
        );
        let rows = sqlx::query_as::<_, StageLifecycleRow>(&sql)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(StageLifecycleEntry::try_from).collect()
    }
}
