// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sawmill configuration.
//!
//! Service identity, ports and lifecycle options come from
//! [`khaleesi_core::config::KhaleesiSettings`]; this holds what only the sink needs.

/// Sink configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL, e.g. `sqlite://sawmill.db`.
    pub database_url: String,
    /// Maximum number of pooled database connections.
    pub db_max_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SAWMILL_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("SAWMILL_DATABASE_URL"))?;

        let db_max_connections = match std::env::var("SAWMILL_DB_MAX_CONNECTIONS") {
            Ok(value) => value
                .parse::<u32>()
                .ok()
                .filter(|connections| *connections > 0)
                .ok_or(ConfigError::Invalid(
                    "SAWMILL_DB_MAX_CONNECTIONS",
                    "expected a positive integer",
                ))?,
            Err(_) => 5,
        };

        Ok(Self {
            database_url,
            db_max_connections,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an invalid value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
