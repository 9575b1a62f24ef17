// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server and client interceptors.
//!
//! ```text
//!  inbound RPC
//!      │
//!  ┌───▼──────────────┐  reset, populate, reset, error → Status
//!  │ request state    │
//!  │ ┌──────────────┐ │  one incoming request count per RPC
//!  │ │ prometheus   │ │
//!  │ │ ┌──────────┐ │ │  request record, handler, error + response records
//!  │ │ │ logging  │ │ │
//!  │ │ │ handler  │ │ │
//!  └─┴─┴──────────┴─┴─┘
//! ```

pub mod client;
pub mod server;

pub use client::ClientInterceptor;
pub use server::ServerInterceptorChain;

use crate::state::UNKNOWN;

/// The naming coordinate encoded in an RPC path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodName {
    /// Deployment gate.
    pub gate: String,
    /// Khaleesi service.
    pub service: String,
    /// gRPC service.
    pub grpc_service: String,
    /// gRPC method.
    pub grpc_method: String,
}

/// Parse `/<pkg>.<gate>.<service>.<GrpcService>/<Method>`. Missing parts are UNKNOWN.
pub fn parse_method_path(path: &str) -> MethodName {
    let trimmed = path.trim_start_matches('/');
    let (qualified, method) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    let mut parts = qualified.rsplit('.').filter(|part| !part.is_empty());

    let grpc_service = parts.next();
    let service = parts.next();
    let gate = parts.next();

    let or_unknown = |part: Option<&str>| part.unwrap_or(UNKNOWN).to_string();
    MethodName {
        gate: or_unknown(gate),
        service: or_unknown(service),
        grpc_service: or_unknown(grpc_service),
        grpc_method: if method.is_empty() {
            UNKNOWN.to_string()
        } else {
            method.to_string()
        },
    }
}
