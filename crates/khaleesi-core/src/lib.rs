// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Khaleesi Core - Service Framework
//!
//! This crate is the shared runtime of every khaleesi service. It wires each gRPC
//! server with a uniform interceptor chain, keeps per-request ambient state, forwards
//! structured records to the sawmill sink, runs cooperative batch jobs and drives a
//! logged startup and graceful shutdown.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Upstream caller                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ RequestMetadata
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ServerInterceptorChain: request state → prometheus → logging           │
//! │                                    │                                    │
//! │                                    ▼                                    │
//! │                              gRPC handler ──── ClientInterceptor ───────┼──► peers
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │ StructuredLogger                         ▲
//!           ▼                                          │ ServiceCallData
//! ┌───────────────────────┐                 ┌──────────────────────┐
//! │  sawmill (Lumberjack) │────────────────►│ sawmill (Forester)   │
//! │  records, queries     │  call graph     │ MetricInitializer    │
//! └───────────────────────┘                 └──────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! | Step | Method | Effect |
//! |------|--------|--------|
//! | Migrate | `MIGRATE` | Apply pending schema migrations |
//! | Initialize | `INITIALIZE` | Bind listeners, install SIGTERM handler, register services |
//! | Start | `LIFECYCLE` | Pre-register metrics, serve, report `HEALTHY` |
//! | Stop | `LIFECYCLE` | Report `TERMINATING`, drain, stop batch jobs, close channels |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables, see
//! [`config::KhaleesiSettings::from_env`].
//!
//! # Modules
//!
//! - [`batch`]: Batch jobs, their persistence and the `Maid` service
//! - [`channels`]: Reusable client channels to peers
//! - [`config`]: Settings from environment variables
//! - [`error`]: The khaleesi error taxonomy and its gRPC mapping
//! - [`interceptors`]: Server and client interceptors
//! - [`lifecycle`]: Startup and graceful shutdown
//! - [`logging`]: Text and structured logging
//! - [`metadata`]: Request metadata builders
//! - [`metrics`]: Prometheus metrics and their initialization
//! - [`migrations`]: Embedded schema migrations
//! - [`state`]: Per-request ambient state

#![deny(missing_docs)]

/// Cooperative batch jobs.
pub mod batch;

/// Client channels keyed by gate and service.
pub mod channels;

/// Settings loaded from environment variables.
pub mod config;

/// Error taxonomy with gRPC status mapping.
pub mod error;

/// Server-side interceptor chain and client interceptor.
pub mod interceptors;

/// Server startup and shutdown.
pub mod lifecycle;

/// Text logging and structured sink records.
pub mod logging;

/// Request metadata attached to every record.
pub mod metadata;

/// Prometheus metrics.
pub mod metrics;

/// Embedded database migrations.
pub mod migrations;

/// Per-request ambient state.
pub mod state;
