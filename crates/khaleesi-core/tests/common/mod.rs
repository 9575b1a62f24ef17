// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for khaleesi-core integration tests.
//!
//! Provides TestContext: an in-memory SQLite database with the core schema and a
//! structured logger that keeps its records in memory.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use khaleesi_core::batch::{BatchJobRegistry, JobRunner, SqliteJobExecutionStore};
use khaleesi_core::config::KhaleesiSettings;
use khaleesi_core::interceptors::ServerInterceptorChain;
use khaleesi_core::logging::StructuredLogger;
use khaleesi_core::logging::structured::MemoryTransport;
use khaleesi_core::metrics::KhaleesiMetrics;

/// Test context with database, logger and batch job plumbing.
pub struct TestContext {
    pub pool: SqlitePool,
    pub settings: Arc<KhaleesiSettings>,
    pub metrics: Arc<KhaleesiMetrics>,
    pub transport: Arc<MemoryTransport>,
    pub logger: StructuredLogger,
    pub store: Arc<SqliteJobExecutionStore>,
    pub registry: Arc<BatchJobRegistry>,
}

impl TestContext {
    /// Create a new test context for service `core.test`.
    pub async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        khaleesi_core::migrations::run_sqlite(&pool)
            .await
            .expect("core migrations");

        let settings = Arc::new(KhaleesiSettings::for_service("core", "test"));
        let metrics = KhaleesiMetrics::new(&settings).expect("metrics registry");
        let transport = Arc::new(MemoryTransport::new());
        let logger = StructuredLogger::new(settings.clone(), metrics.clone(), transport.clone());
        let store = Arc::new(SqliteJobExecutionStore::new(pool.clone(), "test"));

        Self {
            pool,
            settings,
            metrics,
            transport,
            logger,
            store,
            registry: Arc::new(BatchJobRegistry::new()),
        }
    }

    /// A job runner persisting to the context's store.
    pub fn runner(&self) -> JobRunner {
        JobRunner::new(self.logger.clone(), self.store.clone())
    }

    /// An interceptor chain logging through the context's logger.
    pub fn chain(&self) -> ServerInterceptorChain {
        ServerInterceptorChain::new(self.logger.clone())
    }
}
