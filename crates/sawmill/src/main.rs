// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sawmill server.
//!
//! Runs the observability sink:
//! - Lumberjack (log ingestion)
//! - Forester (service registry)
//! - Sawyer (log reads)
//! - Maid (log table cleanup)

use std::sync::Arc;
use tracing::{info, warn};

use khaleesi_core::config::KhaleesiSettings;
use khaleesi_core::logging::init_tracing;
use sawmill::config::Config;
use sawmill::runtime::{Sawmill, connect};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    let settings = Arc::new(KhaleesiSettings::from_env()?);
    init_tracing("sawmill=info,khaleesi_core=info", settings.debug);
    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    info!(
        gate = %settings.gate,
        service = %settings.service,
        grpc_addr = %settings.grpc_addr,
        metrics_addr = %settings.metrics_addr,
        "Starting sawmill"
    );

    let pool = connect(&config).await?;
    let sawmill = Sawmill::new(pool, settings)?;

    let server = sawmill.server().start().await?;
    info!(addr = %server.local_addr(), "Sawmill ready");

    server.wait_for_termination().await?;
    info!("Sawmill shut down");

    Ok(())
}
