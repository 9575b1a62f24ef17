// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for sawmill.
//!
//! These are operational errors of the binary and the runtime assembly. Errors
//! returned to RPC callers are [`khaleesi_core::error::KhaleesiError`]s.

use thiserror::Error;

/// Sawmill errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Sawmill configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// khaleesi settings loading failed.
    #[error("Settings error: {0}")]
    Settings(#[from] khaleesi_core::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Metric registration failed.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// A khaleesi operation failed.
    #[error("Khaleesi error: {0}")]
    Khaleesi(#[from] khaleesi_core::error::KhaleesiError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using sawmill Error.
pub type Result<T> = std::result::Result<T, Error>;
