// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound request metadata.
//!
//! Every request a khaleesi service sends carries a [`RequestMetadata`] describing
//! the caller: the current request identity from [`crate::state`], or a system
//! identity for requests the service makes on its own behalf.

use chrono::{DateTime, Utc};
use khaleesi_proto::common_proto::{GrpcCaller, HttpCaller, RequestMetadata, User, user::UserType};

use crate::config::KhaleesiSettings;
use crate::state;

/// Metadata describing the request currently being handled.
pub fn add_request_metadata(settings: &KhaleesiSettings) -> RequestMetadata {
    let current = state::snapshot();
    RequestMetadata {
        http_caller: Some(HttpCaller {
            request_id: current.request.http_request_id,
            site: settings.gate.clone(),
            path: String::new(),
            pod_id: settings.pod_id.clone(),
        }),
        grpc_caller: Some(GrpcCaller {
            request_id: current.request.grpc_request_id,
            khaleesi_gate: settings.gate.clone(),
            khaleesi_service: settings.service.clone(),
            grpc_service: current.request.grpc_service,
            grpc_method: current.request.grpc_method,
            pod_id: settings.pod_id.clone(),
        }),
        user: Some(User {
            id: current.user.id,
            r#type: current.user.user_type as i32,
        }),
        timestamp: Some(to_timestamp(Utc::now())),
    }
}

/// Metadata for a request the service makes on its own behalf.
pub fn add_system_request_metadata(
    settings: &KhaleesiSettings,
    http_request_id: &str,
    grpc_request_id: &str,
    grpc_method: &str,
) -> RequestMetadata {
    RequestMetadata {
        http_caller: Some(HttpCaller {
            request_id: http_request_id.to_string(),
            site: settings.gate.clone(),
            path: "/".to_string(),
            pod_id: String::new(),
        }),
        grpc_caller: Some(GrpcCaller {
            request_id: grpc_request_id.to_string(),
            khaleesi_gate: settings.gate.clone(),
            khaleesi_service: settings.service.clone(),
            grpc_service: settings.system.service_name.clone(),
            grpc_method: grpc_method.to_string(),
            pod_id: settings.pod_id.clone(),
        }),
        user: Some(User {
            id: settings.system.user_id.clone(),
            r#type: UserType::System as i32,
        }),
        timestamp: Some(to_timestamp(Utc::now())),
    }
}

/// Convert a chrono timestamp to its protobuf form.
pub fn to_timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

/// Convert a protobuf timestamp back; `None` if out of range.
pub fn from_timestamp(timestamp: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(timestamp.nanos).ok()?;
    DateTime::from_timestamp(timestamp.seconds, nanos)
}
