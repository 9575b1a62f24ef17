// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cleanup jobs: delete rows older than the configured delay.
//!
//! Each batch deletes the page it was given, so the runner always asks for the
//! first page. A cleanup job can only delete; anything that leaves rows in place
//! would be handed the same page forever.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::JobConfiguration;
use super::job::{BatchJob, PagePolicy};
use crate::error::{KhaleesiError, Result};

/// Rows a cleanup job may delete.
#[async_trait]
pub trait CleanupSource: Send + Sync {
    /// Row key.
    type Key: Send;

    /// Number of rows created before `cutoff`.
    async fn count_before(&self, cutoff: DateTime<Utc>) -> Result<i64>;

    /// The `limit` oldest rows created before `cutoff`.
    async fn oldest_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Self::Key>>;

    /// Delete `keys`; returns the number of rows deleted.
    async fn delete(&self, keys: Vec<Self::Key>) -> Result<i64>;
}

/// Deletes everything `source` holds that is older than the cleanup delay.
pub struct CleanupJob<S> {
    source: S,
    cutoff: DateTime<Utc>,
}

impl<S: CleanupSource> CleanupJob<S> {
    /// Create a cleanup job; `config` must be marked as a cleanup job.
    pub fn new(source: S, config: &JobConfiguration) -> Result<Self> {
        if !config.is_cleanup_job {
            return Err(KhaleesiError::invalid_argument(
                "cleanupConfiguration.isCleanupJob must be true",
                "Invalid cleanupConfiguration.isCleanupJob",
                format!(
                    "cleanupConfiguration.isCleanupJob is false for action \"{}\"",
                    config.action
                ),
            ));
        }
        let delay = chrono::Duration::from_std(config.cleanup_delay).map_err(|e| {
            KhaleesiError::invalid_argument(
                "cleanupConfiguration.cleanupDelay is out of range",
                "Invalid cleanupConfiguration.cleanupDelay",
                e.to_string(),
            )
        })?;
        let cutoff = Utc::now()
            .checked_sub_signed(delay)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(Self { source, cutoff })
    }

    /// Rows created at or after this instant are kept.
    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }
}

#[async_trait]
impl<S: CleanupSource> BatchJob for CleanupJob<S> {
    type Item = S::Key;

    async fn count_items(&self) -> Result<i64> {
        self.source.count_before(self.cutoff).await
    }

    async fn get_page(&self, _page: i64, page_size: i64) -> Result<Vec<S::Key>> {
        self.source.oldest_before(self.cutoff, page_size).await
    }

    async fn execute_batch(&self, items: Vec<S::Key>) -> Result<i64> {
        self.source.delete(items).await
    }

    fn page_policy(&self) -> PagePolicy {
        PagePolicy::FirstPage
    }
}
