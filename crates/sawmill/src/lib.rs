// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sawmill - Observability Sink for khaleesi Services
//!
//! Every khaleesi service reports its HTTP requests, gRPC requests, events,
//! errors and database queries to sawmill. Sawmill stores them, learns the call
//! graph between services from the gRPC requests, and serves both back.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        khaleesi services                                │
//! │           (StructuredGrpcLogger, GrpcCallDataSource, Maid)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        sawmill (This Crate)                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │ Lumberjack  │  │  Forester   │  │   Sawyer    │  │    Maid     │     │
//! │  │  (ingest)   │  │ (registry)  │  │   (read)    │  │  (cleanup)  │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               SQLite                                    │
//! │      (request, event, error and query logs; gates, services, calls)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # gRPC Services
//!
//! | Service | Operations |
//! |---------|------------|
//! | `Lumberjack` | `LogSystemHttpRequest`, `LogHttpRequest`, `LogHttpRequestResponse`, `LogGrpcRequest`, `LogGrpcResponse`, `LogEvent`, `LogError` |
//! | `Forester` | `GetServiceCallData` |
//! | `Sawyer` | `GetEvents`, `GetErrors`, `GetHttpRequests`, `GetGrpcRequests`, `GetQueries` |
//! | `Maid` | `Cleanup` (`cleanup-events`, `cleanup-errors`, `cleanup-http-requests`, `cleanup-grpc-requests`, `cleanup-queries`) |
//!
//! Sawmill logs its own requests like every other service, but writes the
//! records straight to its database ([`db_logger::StructuredDbLogger`]).
//!
//! # Configuration
//!
//! Service settings (`KHALEESI_*`) are read by khaleesi-core. Sawmill adds:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SAWMILL_DATABASE_URL` | SQLite connection URL | (required) |
//! | `SAWMILL_DB_MAX_CONNECTIONS` | Pool size | `5` |

#![deny(missing_docs)]

pub mod broom;
pub mod config;
pub mod db;
pub mod db_logger;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod metric_initializer;
pub mod migrations;
pub mod parse_util;
pub mod runtime;
pub mod service_registry;
pub mod sql;

pub use error::{Error, Result};
pub use runtime::Sawmill;
