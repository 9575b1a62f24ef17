// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence of job executions.
//!
//! Every update bumps `version`. Terminal updates only apply to an execution that
//! is still in progress and whose version matches the one the runner last saw.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use super::{JobConfiguration, JobStatus};
use crate::error::{KhaleesiError, Result};

/// A persisted job execution.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct JobExecutionRecord {
    /// Row id.
    pub id: i64,
    /// Logical job.
    pub job_id: String,
    /// This execution.
    pub execution_id: String,
    /// Persisted status name; see [`JobExecutionRecord::status`].
    #[sqlx(rename = "status")]
    pub status_name: String,
    /// What the job does.
    pub action: String,
    /// Items per batch.
    pub batch_size: i64,
    /// Time limit in nanoseconds.
    pub timelimit_nanos: i64,
    /// Whether the job deletes what it pages over.
    pub is_cleanup_job: bool,
    /// Cleanup delay in nanoseconds.
    pub cleanup_delay_nanos: i64,
    /// When the execution started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the execution ended.
    pub end_time: Option<DateTime<Utc>>,
    /// Human-readable outcome.
    pub status_details: String,
    /// Items processed so far.
    pub items_processed: i64,
    /// Items in the population, once counted.
    pub total_items: Option<i64>,
    /// Framework version that created the row.
    pub khaleesi_version: String,
    /// Optimistic concurrency version.
    pub version: i64,
}

impl JobExecutionRecord {
    /// Current status.
    pub fn status(&self) -> JobStatus {
        JobStatus::from_name(&self.status_name)
    }

    /// Whether the execution is running.
    pub fn is_in_progress(&self) -> bool {
        self.status() == JobStatus::InProgress
    }

    /// Configured time limit.
    pub fn timelimit(&self) -> Duration {
        Duration::from_nanos(u64::try_from(self.timelimit_nanos).unwrap_or_default())
    }
}

/// Storage of job executions.
#[async_trait]
pub trait JobExecutionStore: Send + Sync {
    /// Create a SCHEDULED execution.
    async fn schedule(&self, config: &JobConfiguration) -> Result<JobExecutionRecord>;

    /// Move a SCHEDULED execution to IN_PROGRESS, or to SKIPPED when another
    /// execution of the same job is scheduled or running.
    async fn start(&self, job_id: &str, execution_id: &str) -> Result<JobExecutionRecord>;

    /// Record the population size. Only the first call has an effect.
    async fn set_total(
        &self,
        job_id: &str,
        execution_id: &str,
        total_items: i64,
    ) -> Result<JobExecutionRecord>;

    /// Move an in-progress execution to a terminal status.
    ///
    /// An execution that already left IN_PROGRESS is returned unchanged; a version
    /// mismatch fails with [`KhaleesiError::db_outdated_information`].
    async fn finish(
        &self,
        execution: &JobExecutionRecord,
        status: JobStatus,
        items_processed: i64,
        status_details: &str,
    ) -> Result<JobExecutionRecord>;

    /// Running executions of `job_id`.
    async fn in_progress(&self, job_id: &str) -> Result<Vec<JobExecutionRecord>>;

    /// One execution.
    async fn get(&self, job_id: &str, execution_id: &str) -> Result<Option<JobExecutionRecord>>;

    /// Executions with any of `execution_ids`, ordered by row id.
    async fn get_executions(&self, execution_ids: &[String]) -> Result<Vec<JobExecutionRecord>>;
}

const SELECT_COLUMNS: &str = r#"
    id, job_id, execution_id, status, action, batch_size, timelimit_nanos,
    is_cleanup_job, cleanup_delay_nanos, start_time, end_time, status_details,
    items_processed, total_items, khaleesi_version, version
"#;

/// SQLite-backed job execution store.
#[derive(Clone)]
pub struct SqliteJobExecutionStore {
    pool: SqlitePool,
    khaleesi_version: String,
}

impl SqliteJobExecutionStore {
    /// Create a store over an already migrated pool, stamping rows with `khaleesi_version`.
    pub fn new(pool: SqlitePool, khaleesi_version: impl Into<String>) -> Self {
        Self {
            pool,
            khaleesi_version: khaleesi_version.into(),
        }
    }

    async fn fetch(&self, job_id: &str, execution_id: &str) -> Result<Option<JobExecutionRecord>> {
        let record = sqlx::query_as::<_, JobExecutionRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM job_executions WHERE job_id = ?1 AND execution_id = ?2"
        ))
        .bind(job_id)
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn fetch_existing(&self, job_id: &str, execution_id: &str) -> Result<JobExecutionRecord> {
        let record = self.fetch(job_id, execution_id).await?.ok_or_else(|| {
            KhaleesiError::db_object_not_found(format!(
                "Job execution \"{execution_id}\" for \"{job_id}\" does not exist."
            ))
        })?;
        self.check_version(&record)?;
        Ok(record)
    }

    fn check_version(&self, record: &JobExecutionRecord) -> Result<()> {
        if record.khaleesi_version != self.khaleesi_version {
            return Err(KhaleesiError::db_outdated_information(format!(
                "Job execution \"{}\" was created by khaleesi {}, running {}.",
                record.execution_id, record.khaleesi_version, self.khaleesi_version
            )));
        }
        Ok(())
    }
}

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobExecutionStore for SqliteJobExecutionStore {
    async fn schedule(&self, config: &JobConfiguration) -> Result<JobExecutionRecord> {
        let record = sqlx::query_as::<_, JobExecutionRecord>(&format!(
            r#"
            INSERT INTO job_executions (
                job_id, execution_id, status, action, batch_size, timelimit_nanos,
                is_cleanup_job, cleanup_delay_nanos, khaleesi_version
            )
            VALUES (?1, ?2, 'SCHEDULED', ?3, ?4, ?5, ?6, ?7, ?8)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(&config.job_id)
        .bind(&config.execution_id)
        .bind(&config.action)
        .bind(config.batch_size)
        .bind(nanos(config.timelimit))
        .bind(config.is_cleanup_job)
        .bind(nanos(config.cleanup_delay))
        .bind(&self.khaleesi_version)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn start(&self, job_id: &str, execution_id: &str) -> Result<JobExecutionRecord> {
        let now = Utc::now();
        // One statement, so two executions starting together cannot both run.
        let started = sqlx::query_as::<_, JobExecutionRecord>(&format!(
            r#"
            UPDATE job_executions
            SET status = CASE WHEN busy.n > 0 THEN 'SKIPPED' ELSE 'IN_PROGRESS' END,
                status_details = CASE
                    WHEN busy.n > 0 THEN 'Another execution of this job is in progress.'
                    ELSE ''
                END,
                start_time = ?1,
                end_time = CASE WHEN busy.n > 0 THEN ?1 ELSE NULL END,
                version = version + 1
            FROM (
                SELECT COUNT(*) AS n FROM job_executions
                WHERE job_id = ?2 AND execution_id != ?3
                  AND status IN ('IN_PROGRESS', 'SCHEDULED')
            ) AS busy
            WHERE job_id = ?2 AND execution_id = ?3
              AND status = 'SCHEDULED' AND khaleesi_version = ?4
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(job_id)
        .bind(execution_id)
        .bind(&self.khaleesi_version)
        .fetch_optional(&self.pool)
        .await?;

        match started {
            Some(record) => Ok(record),
            None => {
                let record = self.fetch_existing(job_id, execution_id).await?;
                Err(KhaleesiError::db_outdated_information(format!(
                    "Job execution \"{execution_id}\" for \"{job_id}\" is {}, not SCHEDULED.",
                    record.status()
                )))
            }
        }
    }

    async fn set_total(
        &self,
        job_id: &str,
        execution_id: &str,
        total_items: i64,
    ) -> Result<JobExecutionRecord> {
        let updated = sqlx::query_as::<_, JobExecutionRecord>(&format!(
            r#"
            UPDATE job_executions
            SET total_items = ?1, version = version + 1
            WHERE job_id = ?2 AND execution_id = ?3 AND total_items IS NULL
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(total_items)
        .bind(job_id)
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(record) => Ok(record),
            None => self.fetch_existing(job_id, execution_id).await,
        }
    }

    async fn finish(
        &self,
        execution: &JobExecutionRecord,
        status: JobStatus,
        items_processed: i64,
        status_details: &str,
    ) -> Result<JobExecutionRecord> {
        let updated = sqlx::query_as::<_, JobExecutionRecord>(&format!(
            r#"
            UPDATE job_executions
            SET status = ?1, items_processed = ?2, status_details = ?3,
                end_time = ?4, version = version + 1
            WHERE job_id = ?5 AND execution_id = ?6
              AND status = 'IN_PROGRESS' AND version = ?7
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(status.as_str())
        .bind(items_processed)
        .bind(status_details)
        .bind(Utc::now())
        .bind(&execution.job_id)
        .bind(&execution.execution_id)
        .bind(execution.version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = updated {
            return Ok(record);
        }

        let current = self
            .fetch_existing(&execution.job_id, &execution.execution_id)
            .await?;
        if !current.is_in_progress() {
            return Ok(current);
        }
        Err(KhaleesiError::db_outdated_information(format!(
            "Job execution \"{}\" changed: expected version {}, found {}.",
            execution.execution_id, execution.version, current.version
        )))
    }

    async fn in_progress(&self, job_id: &str) -> Result<Vec<JobExecutionRecord>> {
        let records = sqlx::query_as::<_, JobExecutionRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM job_executions WHERE job_id = ?1 AND status = 'IN_PROGRESS' ORDER BY id"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get(&self, job_id: &str, execution_id: &str) -> Result<Option<JobExecutionRecord>> {
        self.fetch(job_id, execution_id).await
    }

    async fn get_executions(&self, execution_ids: &[String]) -> Result<Vec<JobExecutionRecord>> {
        if execution_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {SELECT_COLUMNS} FROM job_executions WHERE execution_id IN ("
        ));
        let mut separated = builder.separated(", ");
        for execution_id in execution_ids {
            separated.push_bind(execution_id);
        }
        separated.push_unseparated(") ORDER BY id");

        let records = builder
            .build_query_as::<JobExecutionRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }
}
