// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Text and structured logging.
//!
//! Text lines go to `tracing` and carry the current request ids as fields.
//! Structured records go to the sink through a [`structured::LogTransport`].

pub mod grpc;
pub mod structured;

pub use grpc::{GrpcCallDataSource, StructuredGrpcLogger};
pub use structured::{LogTransport, StructuredLogger};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::LogLevel;
use crate::state;

/// Emit `message` at `level`, tagged with the current request ids.
pub fn log(message: &str, level: LogLevel) {
    let request = state::current_request();
    let http_request_id = request.http_request_id.as_str();
    let grpc_request_id = request.grpc_request_id.as_str();
    match level {
        LogLevel::Debug => debug!(http_request_id, grpc_request_id, "{}", message),
        LogLevel::Info => info!(http_request_id, grpc_request_id, "{}", message),
        LogLevel::Warning => warn!(http_request_id, grpc_request_id, "{}", message),
        LogLevel::Error => error!(http_request_id, grpc_request_id, "{}", message),
        LogLevel::Fatal => {
            error!(http_request_id, grpc_request_id, fatal = true, "{}", message)
        }
    }
}

/// Install the global subscriber.
///
/// `default_filter` applies unless `RUST_LOG` is set; `debug` raises it to debug.
/// A second call is a no-op.
pub fn init_tracing(default_filter: &str, debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(default_filter)
        }
    });
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_every_level_outside_scope() {
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Fatal,
        ] {
            log("message", level);
        }
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing("khaleesi_core=info", false);
        init_tracing("khaleesi_core=info", true);
    }
}
