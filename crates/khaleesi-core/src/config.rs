// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Names the framework uses for requests and events it emits on its own behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemNames {
    /// gRPC service name reported for system requests.
    pub service_name: String,
    /// User id reported for system requests.
    pub user_id: String,
    /// Method of the whole server lifecycle (start and stop).
    pub lifecycle_method: String,
    /// Method of the schema migration step.
    pub migrate_method: String,
    /// Method of the initialization step.
    pub initialize_method: String,
    /// Method used when fetching call data for metric initialization.
    pub initialize_request_metrics_method: String,
    /// Event target type of lifecycle events.
    pub lifecycle_target: String,
    /// Event target type of batch job events.
    pub batch_job_target: String,
}

impl Default for SystemNames {
    fn default() -> Self {
        Self {
            service_name: "grpc-server".to_string(),
            user_id: "grpc-server".to_string(),
            lifecycle_method: "LIFECYCLE".to_string(),
            migrate_method: "MIGRATE".to_string(),
            initialize_method: "INITIALIZE".to_string(),
            initialize_request_metrics_method: "INITIALIZE_REQUEST_METRICS".to_string(),
            lifecycle_target: "core.core.server".to_string(),
            batch_job_target: "core.core.job".to_string(),
        }
    }
}

/// Khaleesi service settings
#[derive(Debug, Clone)]
pub struct KhaleesiSettings {
    /// Deployment bucket this service belongs to.
    pub gate: String,
    /// Name of this service within its gate.
    pub service: String,
    /// Deployed version, applied to every metric.
    pub version: String,
    /// Identifier of the running pod.
    pub pod_id: String,
    /// Enables debug-level logging.
    pub debug: bool,
    /// gRPC listen address.
    pub grpc_addr: SocketAddr,
    /// Metrics exposition listen address.
    pub metrics_addr: SocketAddr,
    /// Concurrent requests served per connection.
    pub threads: usize,
    /// Upper bound for server drain and job shutdown.
    pub shutdown_grace: Duration,
    /// Port used to reach peers at `<service>.<gate>`.
    pub channel_port: u16,
    /// Migration to apply before the logged startup sequence, if any.
    pub pre_migration: Option<String>,
    /// Names used for system requests.
    pub system: SystemNames,
}

impl KhaleesiSettings {
    /// Settings for a service with all optional values at their defaults.
    pub fn for_service(gate: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            service: service.into(),
            version: "development".to_string(),
            pod_id: "UNKNOWN".to_string(),
            debug: false,
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8020)),
            threads: 10,
            shutdown_grace: Duration::from_secs(30),
            channel_port: 8000,
            pre_migration: None,
            system: SystemNames::default(),
        }
    }

    /// Load settings from environment variables.
    ///
    /// Required:
    /// - `KHALEESI_GATE`: deployment bucket
    /// - `KHALEESI_SERVICE`: service name
    ///
    /// Optional (with defaults):
    /// - `KHALEESI_VERSION`: deployed version (default: development)
    /// - `KHALEESI_POD_ID`: pod identifier (default: `HOSTNAME`, then UNKNOWN)
    /// - `KHALEESI_DEBUG`: debug logging if present
    /// - `PORT`: gRPC port (default: 8000)
    /// - `KHALEESI_METRICS_PORT`: metrics port (default: 8020)
    /// - `THREADS`: concurrent requests per connection (default: 10)
    /// - `KHALEESI_SHUTDOWN_GRACE_SECS`: shutdown bound (default: 30)
    /// - `KHALEESI_CHANNEL_PORT`: peer port (default: `PORT`)
    /// - `STARTUP_MIGRATIONS_BEFORE_SERVER_START_REQUIRED`: "true" or "1" to enable
    /// - `STARTUP_MIGRATIONS_BEFORE_SERVER_START_MIGRATION`: migration to apply first
    pub fn from_env() -> Result<Self, ConfigError> {
        let gate =
            std::env::var("KHALEESI_GATE").map_err(|_| ConfigError::Missing("KHALEESI_GATE"))?;
        let service = std::env::var("KHALEESI_SERVICE")
            .map_err(|_| ConfigError::Missing("KHALEESI_SERVICE"))?;

        let version =
            std::env::var("KHALEESI_VERSION").unwrap_or_else(|_| "development".to_string());

        let pod_id = std::env::var("KHALEESI_POD_ID")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "UNKNOWN".to_string());

        let debug = std::env::var("KHALEESI_DEBUG").is_ok();

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("PORT", "must be a valid port number"))?;

        let metrics_port: u16 = std::env::var("KHALEESI_METRICS_PORT")
            .unwrap_or_else(|_| "8020".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("KHALEESI_METRICS_PORT", "must be a valid port number")
            })?;

        let threads: usize = std::env::var("THREADS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|threads| *threads > 0)
            .ok_or(ConfigError::Invalid("THREADS", "must be a positive integer"))?;

        let shutdown_grace_secs: u64 = std::env::var("KHALEESI_SHUTDOWN_GRACE_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("KHALEESI_SHUTDOWN_GRACE_SECS", "must be a number of seconds")
            })?;

        let channel_port: u16 = match std::env::var("KHALEESI_CHANNEL_PORT") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::Invalid("KHALEESI_CHANNEL_PORT", "must be a valid port number")
            })?,
            Err(_) => port,
        };

        let pre_migration_required =
            std::env::var("STARTUP_MIGRATIONS_BEFORE_SERVER_START_REQUIRED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false);
        let pre_migration = if pre_migration_required {
            Some(
                std::env::var("STARTUP_MIGRATIONS_BEFORE_SERVER_START_MIGRATION").map_err(
                    |_| ConfigError::Missing("STARTUP_MIGRATIONS_BEFORE_SERVER_START_MIGRATION"),
                )?,
            )
        } else {
            None
        };

        Ok(Self {
            gate,
            service,
            version,
            pod_id,
            debug,
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], metrics_port)),
            threads,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            channel_port,
            pre_migration,
            system: SystemNames::default(),
        })
    }

    /// Owner id of system events: `<gate>-<service>`.
    pub fn owner_id(&self) -> String {
        format!("{}-{}", self.gate, self.service)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
