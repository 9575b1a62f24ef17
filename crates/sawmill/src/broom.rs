// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cleanup jobs for the log tables, started through `Maid.Cleanup`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use khaleesi_core::batch::{
    BatchJobRegistry, Broom, CleanupJob, CleanupSource, JobConfiguration, JobRunner,
};
use khaleesi_core::error::{KhaleesiError, Result};
use khaleesi_proto::common_proto::JobExecutionRequest;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::{self, LogTable};

/// Cleanup action names and the table each one empties.
pub const CLEANUP_ACTIONS: [(&str, LogTable); 5] = [
    ("cleanup-events", LogTable::Events),
    ("cleanup-errors", LogTable::Errors),
    ("cleanup-http-requests", LogTable::HttpRequests),
    ("cleanup-grpc-requests", LogTable::GrpcRequests),
    ("cleanup-queries", LogTable::Queries),
];

/// Rows of one log table, keyed by id.
#[derive(Debug, Clone)]
pub struct TableCleanup {
    pool: SqlitePool,
    table: LogTable,
}

impl TableCleanup {
    /// Cleanup source for `table`.
    pub fn new(pool: SqlitePool, table: LogTable) -> Self {
        Self { pool, table }
    }
}

#[async_trait]
impl CleanupSource for TableCleanup {
    type Key = i64;

    async fn count_before(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        Ok(db::count_logged_before(&self.pool, self.table, cutoff).await?)
    }

    async fn oldest_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        Ok(db::oldest_logged_before(&self.pool, self.table, cutoff, limit).await?)
    }

    async fn delete(&self, keys: Vec<i64>) -> Result<i64> {
        let deleted = db::delete_by_ids(&self.pool, self.table, &keys).await?;
        Ok(i64::try_from(deleted).unwrap_or(i64::MAX))
    }
}

/// Starts log table cleanups in the background.
pub struct SawmillBroom {
    pool: SqlitePool,
    runner: JobRunner,
    jobs: Arc<BatchJobRegistry>,
}

impl SawmillBroom {
    /// Broom running jobs through `runner`, tracked by `jobs`.
    pub fn new(pool: SqlitePool, runner: JobRunner, jobs: Arc<BatchJobRegistry>) -> Self {
        Self { pool, runner, jobs }
    }
}

#[async_trait]
impl Broom for SawmillBroom {
    async fn cleanup(&self, request: JobExecutionRequest) -> Result<()> {
        let execution = request.job_execution.clone().ok_or_else(|| {
            KhaleesiError::invalid_argument(
                "jobExecution is required",
                "Missing jobExecution",
                "Cleanup request without job execution.",
            )
        })?;
        let config = JobConfiguration::from_proto(&execution)?;
        let Some(table) = CLEANUP_ACTIONS
            .iter()
            .find(|(action, _)| *action == config.action)
            .map(|(_, table)| *table)
        else {
            return Err(KhaleesiError::programming(
                "Cleanup action isn't implemented!",
                format!("Action \"{}\" has no cleanup job.", config.action),
            ));
        };
        let job = CleanupJob::new(TableCleanup::new(self.pool.clone(), table), &config)?;

        info!(
            job_id = %config.job_id,
            action = %config.action,
            cutoff = %job.cutoff(),
            "Starting cleanup"
        );
        let runner = self.runner.clone();
        let job_id = config.job_id.clone();
        let execution_id = config.execution_id.clone();
        self.jobs.spawn(&job_id, &execution_id, move |stop| async move {
            if let Err(e) = runner.execute(&job, &config, &stop).await {
                warn!(job_id = %config.job_id, error = %e, "Cleanup could not be started");
            }
        });
        Ok(())
    }
}
