// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable sawmill runtime.
//!
//! [`Sawmill`] wires the database, the service registry and the ingester into a
//! khaleesi server. The binary uses it; tests use it to run the sink in-process.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use khaleesi_core::config::KhaleesiSettings;
//! use sawmill::config::Config;
//! use sawmill::runtime::{Sawmill, connect};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Arc::new(KhaleesiSettings::from_env()?);
//!     let pool = connect(&Config::from_env()?).await?;
//!
//!     let server = Sawmill::new(pool, settings)?.server().start().await?;
//!     server.wait_for_termination().await?;
//!     Ok(())
//! }
//! ```

use std::str::FromStr;
use std::sync::Arc;

use khaleesi_core::batch::{BatchJobRegistry, JobRunner, SqliteJobExecutionStore};
use khaleesi_core::config::KhaleesiSettings;
use khaleesi_core::interceptors::ServerInterceptorChain;
use khaleesi_core::lifecycle::{KhaleesiServer, KhaleesiServerBuilder};
use khaleesi_core::logging::StructuredLogger;
use khaleesi_core::metrics::KhaleesiMetrics;
use khaleesi_proto::sawmill_proto::forester_server::ForesterServer;
use khaleesi_proto::sawmill_proto::lumberjack_server::LumberjackServer;
use khaleesi_proto::sawmill_proto::sawyer_server::SawyerServer;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tonic::service::Routes;
use tracing::info;

use crate::broom::SawmillBroom;
use crate::config::Config;
use crate::db_logger::StructuredDbLogger;
use crate::error::Result;
use crate::handlers::{ForesterService, LumberjackService, SawyerService};
use crate::ingest::Ingester;
use crate::metric_initializer::RegistryCallDataSource;
use crate::migrations::SawmillMigrations;
use crate::service_registry::ServiceRegistry;

/// Open the sink database, creating the file if needed.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect_with(options)
        .await?;
    info!(max_connections = config.db_max_connections, "Connected to database");
    Ok(pool)
}

/// The sink's shared state.
pub struct Sawmill {
    pool: SqlitePool,
    settings: Arc<KhaleesiSettings>,
    registry: Arc<ServiceRegistry>,
    ingester: Arc<Ingester>,
    logger: StructuredLogger,
    jobs: Arc<BatchJobRegistry>,
}

impl Sawmill {
    /// Assemble the sink on `pool`. The schema is created by the server's
    /// `MIGRATE` step.
    pub fn new(pool: SqlitePool, settings: Arc<KhaleesiSettings>) -> Result<Self> {
        let metrics = KhaleesiMetrics::new(&settings)?;
        let registry = Arc::new(ServiceRegistry::new(pool.clone()));
        let ingester = Arc::new(Ingester::new(
            pool.clone(),
            registry.clone(),
            settings.clone(),
            metrics.clone(),
        ));
        let logger = StructuredLogger::new(
            settings.clone(),
            metrics,
            Arc::new(StructuredDbLogger::new(ingester.clone())),
        );

        Ok(Self {
            pool,
            settings,
            registry,
            ingester,
            logger,
            jobs: Arc::new(BatchJobRegistry::new()),
        })
    }

    /// Database pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Service registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Record ingestion.
    pub fn ingester(&self) -> &Arc<Ingester> {
        &self.ingester
    }

    /// Logger writing sawmill's own records to its database.
    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    /// Metrics of the sink.
    pub fn metrics(&self) -> &Arc<KhaleesiMetrics> {
        self.logger.metrics()
    }

    /// Running cleanup jobs.
    pub fn jobs(&self) -> &Arc<BatchJobRegistry> {
        &self.jobs
    }

    /// Interceptor chain for the sink's handlers.
    pub fn chain(&self) -> ServerInterceptorChain {
        ServerInterceptorChain::new(self.logger.clone())
    }

    /// Cleanup hook for `Maid.Cleanup`.
    pub fn broom(&self) -> SawmillBroom {
        let store = SqliteJobExecutionStore::new(self.pool.clone(), self.settings.version.clone());
        SawmillBroom::new(
            self.pool.clone(),
            JobRunner::new(self.logger.clone(), Arc::new(store)),
            self.jobs.clone(),
        )
    }

    /// `Lumberjack`, `Forester` and `Sawyer`.
    pub fn routes(&self) -> Routes {
        Routes::new(LumberjackServer::new(LumberjackService::new(
            self.chain(),
            self.ingester.clone(),
        )))
        .add_service(ForesterServer::new(ForesterService::new(
            self.chain(),
            self.registry.clone(),
        )))
        .add_service(SawyerServer::new(SawyerService::new(
            self.chain(),
            self.pool.clone(),
        )))
    }

    /// Server builder with everything the sink serves.
    pub fn server(&self) -> KhaleesiServerBuilder {
        KhaleesiServer::builder(self.logger.clone())
            .jobs(self.jobs.clone())
            .migrations(Arc::new(SawmillMigrations::new(self.pool.clone())))
            .call_data(Arc::new(RegistryCallDataSource::new(
                self.registry.clone(),
                self.settings.clone(),
                self.metrics().clone(),
            )))
            .broom(Arc::new(self.broom()))
            .routes(self.routes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khaleesi_proto::common_proto::GrpcCaller;

    fn file_config(dir: &tempfile::TempDir) -> Config {
        Config {
            database_url: format!("sqlite://{}", dir.path().join("sawmill.db").display()),
            db_max_connections: 2,
        }
    }

    #[tokio::test]
    async fn test_registry_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let caller = GrpcCaller {
            request_id: "r1".to_string(),
            khaleesi_gate: "gw".to_string(),
            khaleesi_service: "front".to_string(),
            grpc_service: "Front".to_string(),
            grpc_method: "Hit".to_string(),
            pod_id: "pod".to_string(),
        };

        let pool = connect(&file_config(&dir)).await.unwrap();
        crate::migrations::run(&pool).await.unwrap();
        let settings = Arc::new(KhaleesiSettings::for_service("core", "sawmill"));
        let sawmill = Sawmill::new(pool.clone(), settings.clone()).unwrap();
        sawmill.registry().add_service(&caller).await.unwrap();
        pool.close().await;

        let pool = connect(&file_config(&dir)).await.unwrap();
        let sawmill = Sawmill::new(pool, settings).unwrap();
        assert_eq!(sawmill.registry().snapshot().method_count(), 0);
        sawmill.registry().reload().await.unwrap();
        assert_eq!(sawmill.registry().snapshot().method_count(), 1);
    }
}
