// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for sawmill.
//!
//! Sawmill extends khaleesi-core's schema (job executions) with the sink tables:
//! - Request logs (HTTP and gRPC), events, errors and queries
//! - The service registry (gates, services, gRPC services, methods and calls)
//!
//! Both sets are merged into a single migrator so SQLx sees them as one ordered
//! set. [`SawmillMigrations`] plugs that migrator into the server's `MIGRATE` step.

use async_trait::async_trait;
use khaleesi_core::error::{KhaleesiError, LogLevel};
use khaleesi_core::lifecycle::Migrate;
use sqlx::SqlitePool;
use sqlx::migrate::{MigrateError, Migration, Migrator};
use std::borrow::Cow;
use tracing::info;

/// Sink migrations embedded at compile time.
///
/// Versions start at 20250101000000 so they sort after the core migrations (001, ...).
static SAWMILL_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Core and sink migrations, optionally cut off after a target migration.
#[derive(Debug, Default)]
struct CombinedMigrations {
    up_to: Option<i64>,
}

impl<'s> sqlx::migrate::MigrationSource<'s> for CombinedMigrations {
    fn resolve(
        self,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = Result<Vec<Migration>, Box<dyn std::error::Error + Send + Sync>>,
                > + Send
                + 's,
        >,
    > {
        Box::pin(async move {
            let mut all_migrations: Vec<Migration> = iter()
                .filter(|m| self.up_to.is_none_or(|up_to| m.version <= up_to))
                .map(Cow::into_owned)
                .collect();
            all_migrations.sort_by_key(|m| m.version);
            Ok(all_migrations)
        })
    }
}

/// SQLite migrator with all migrations (core + sink).
pub async fn migrator() -> Result<Migrator, MigrateError> {
    Migrator::new(CombinedMigrations::default()).await
}

/// Run all migrations (core + sink).
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &SqlitePool) -> Result<(), MigrateError> {
    migrator().await?.run(pool).await
}

/// Run migrations up to and including `target`.
///
/// `target` names a migration by version (`"20250101000000"`) or by description
/// (`"sawmill logs"`). Migrations applied beyond the target are left alone.
pub async fn run_to(pool: &SqlitePool, target: &str) -> Result<(), MigrateError> {
    let version = resolve_target(target).ok_or(MigrateError::VersionMissing(0))?;
    let mut migrator = Migrator::new(CombinedMigrations {
        up_to: Some(version),
    })
    .await?;
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}

/// Get an iterator over all migrations (core + sink), sorted by version.
pub fn iter() -> impl Iterator<Item = Cow<'static, Migration>> {
    let core_iter = khaleesi_core::migrations::SQLITE.iter().map(Cow::Borrowed);
    let sawmill_iter = SAWMILL_MIGRATOR.iter().map(Cow::Borrowed);

    let mut all: Vec<_> = core_iter.chain(sawmill_iter).collect();
    all.sort_by_key(|m| m.version);
    all.into_iter()
}

fn resolve_target(target: &str) -> Option<i64> {
    let target = target.trim();
    iter()
        .find(|m| {
            m.version.to_string() == target
                || m.description.eq_ignore_ascii_case(target)
                || m.description.replace(' ', "_").eq_ignore_ascii_case(target)
        })
        .map(|m| m.version)
}

/// The server's `MIGRATE` step for sawmill.
#[derive(Debug, Clone)]
pub struct SawmillMigrations {
    pool: SqlitePool,
}

impl SawmillMigrations {
    /// Migrations applied to `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Migrate for SawmillMigrations {
    async fn migrate(&self, target: Option<&str>) -> khaleesi_core::error::Result<()> {
        let result = match target {
            Some(target) => {
                if resolve_target(target).is_none() {
                    return Err(KhaleesiError::invalid_argument(
                        "",
                        "Unknown migration",
                        format!("No migration matches \"{target}\"."),
                    ));
                }
                run_to(&self.pool, target).await
            }
            None => run(&self.pool).await,
        };
        result.map_err(|e| {
            KhaleesiError::internal_server(LogLevel::Fatal, "", "Migration failed", e.to_string())
        })?;
        info!(target = target.unwrap_or("latest"), "Migrations applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn table_exists(pool: &SqlitePool, name: &str) -> bool {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap()
            == 1
    }

    #[test]
    fn test_core_migrations_sort_first() {
        let versions: Vec<i64> = iter().map(|m| m.version).collect();
        assert_eq!(versions.first(), Some(&1));
        assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn test_run_creates_core_and_sink_tables() {
        let pool = pool().await;
        run(&pool).await.unwrap();
        run(&pool).await.unwrap();

        for table in ["job_executions", "events", "grpc_requests", "grpc_calls"] {
            assert!(table_exists(&pool, table).await, "{table} missing");
        }
    }

    #[tokio::test]
    async fn test_migrate_to_target_stops_there() {
        let pool = pool().await;
        let migrations = SawmillMigrations::new(pool.clone());

        migrations.migrate(Some("1")).await.unwrap();

        assert!(table_exists(&pool, "job_executions").await);
        assert!(!table_exists(&pool, "events").await);

        migrations.migrate(None).await.unwrap();
        assert!(table_exists(&pool, "events").await);
    }

    #[tokio::test]
    async fn test_unknown_target_is_invalid_argument() {
        let migrations = SawmillMigrations::new(pool().await);

        let error = migrations.migrate(Some("nope")).await.unwrap_err();

        assert_eq!(error.status, tonic::Code::InvalidArgument);
    }
}
