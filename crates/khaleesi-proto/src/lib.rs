// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Khaleesi Protocol - Protobuf messages and gRPC stubs
//!
//! This crate provides the wire schema spoken between khaleesi services:
//! - Shared request metadata (`common_proto`), carried by every request message
//! - Batch job messages and the `Maid` service present on every service
//! - The sawmill observability sink (`sawmill_proto`): `Lumberjack` for ingestion,
//!   `Forester` for service registry call data and `Sawyer` for the read side
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      khaleesi-proto                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: tonic clients and servers                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: HTTP/2 (tonic transport)                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Method paths
//!
//! RPC paths follow `/khaleesi.<gate>.<service>.<GrpcService>/<Method>`, which is
//! what the framework parses into the four-level naming coordinate. The sink lives
//! in gate `core`, service `sawmill`.

// Generated code mirrors the protobuf package tree so cross-package references resolve.
#[allow(missing_docs, clippy::all)]
pub mod khaleesi {
    pub mod common {
        tonic::include_proto!("khaleesi.common");
    }

    pub mod core {
        pub mod sawmill {
            tonic::include_proto!("khaleesi.core.sawmill");
        }
    }
}

pub use khaleesi::common as common_proto;
pub use khaleesi::core::sawmill as sawmill_proto;

use common_proto::{RequestMetadata, user::UserType};

/// Fully qualified gRPC service names.
pub mod services {
    /// Batch job control, present on every service.
    pub const MAID: &str = "khaleesi.common.Maid";
    /// Sink ingestion.
    pub const LUMBERJACK: &str = "khaleesi.core.sawmill.Lumberjack";
    /// Service registry call data.
    pub const FORESTER: &str = "khaleesi.core.sawmill.Forester";
    /// Sink read side.
    pub const SAWYER: &str = "khaleesi.core.sawmill.Sawyer";
}

/// Full RPC paths as seen by interceptors.
pub mod methods {
    pub const MAID_ABORT_BATCH_JOB: &str = "/khaleesi.common.Maid/AbortBatchJob";
    pub const MAID_ABORT_ALL_BATCH_JOBS: &str = "/khaleesi.common.Maid/AbortAllBatchJobs";
    pub const MAID_CLEANUP: &str = "/khaleesi.common.Maid/Cleanup";

    pub const LUMBERJACK_LOG_SYSTEM_HTTP_REQUEST: &str =
        "/khaleesi.core.sawmill.Lumberjack/LogSystemHttpRequest";
    pub const LUMBERJACK_LOG_HTTP_REQUEST: &str =
        "/khaleesi.core.sawmill.Lumberjack/LogHttpRequest";
    pub const LUMBERJACK_LOG_HTTP_REQUEST_RESPONSE: &str =
        "/khaleesi.core.sawmill.Lumberjack/LogHttpRequestResponse";
    pub const LUMBERJACK_LOG_GRPC_REQUEST: &str =
        "/khaleesi.core.sawmill.Lumberjack/LogGrpcRequest";
    pub const LUMBERJACK_LOG_GRPC_RESPONSE: &str =
        "/khaleesi.core.sawmill.Lumberjack/LogGrpcResponse";
    pub const LUMBERJACK_LOG_EVENT: &str = "/khaleesi.core.sawmill.Lumberjack/LogEvent";
    pub const LUMBERJACK_LOG_ERROR: &str = "/khaleesi.core.sawmill.Lumberjack/LogError";

    pub const FORESTER_GET_SERVICE_CALL_DATA: &str =
        "/khaleesi.core.sawmill.Forester/GetServiceCallData";

    pub const SAWYER_GET_EVENTS: &str = "/khaleesi.core.sawmill.Sawyer/GetEvents";
    pub const SAWYER_GET_ERRORS: &str = "/khaleesi.core.sawmill.Sawyer/GetErrors";
    pub const SAWYER_GET_HTTP_REQUESTS: &str = "/khaleesi.core.sawmill.Sawyer/GetHttpRequests";
    pub const SAWYER_GET_GRPC_REQUESTS: &str = "/khaleesi.core.sawmill.Sawyer/GetGrpcRequests";
    pub const SAWYER_GET_QUERIES: &str = "/khaleesi.core.sawmill.Sawyer/GetQueries";
}

/// Request messages that carry [`RequestMetadata`].
///
/// Interceptors read the upstream caller through this trait and the client side
/// fills in the outbound caller identity before sending.
pub trait HasRequestMetadata {
    /// The metadata carried by this request, if any.
    fn request_metadata(&self) -> Option<&RequestMetadata>;

    /// Mutable access used to attach outbound metadata.
    fn request_metadata_mut(&mut self) -> &mut Option<RequestMetadata>;
}

macro_rules! impl_has_request_metadata {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl HasRequestMetadata for $ty {
                fn request_metadata(&self) -> Option<&RequestMetadata> {
                    self.request_metadata.as_ref()
                }

                fn request_metadata_mut(&mut self) -> &mut Option<RequestMetadata> {
                    &mut self.request_metadata
                }
            }
        )+
    };
}

impl_has_request_metadata!(
    common_proto::EmptyRequest,
    common_proto::ObjectMetadataRequest,
    common_proto::JobExecutionRequest,
    sawmill_proto::HttpRequest,
    sawmill_proto::ResponseRequest,
    sawmill_proto::GrpcRequest,
    sawmill_proto::GrpcResponseRequest,
    sawmill_proto::EventRequest,
    sawmill_proto::ErrorRequest,
    sawmill_proto::LogFilter,
);

/// Upper-case name of a user type, as used in metric labels and log lines.
pub fn user_type_name(user_type: UserType) -> &'static str {
    user_type.as_str_name()
}

/// Decode a raw enum value into a [`UserType`], falling back to `UNKNOWN`.
pub fn user_type_from_i32(value: i32) -> UserType {
    UserType::try_from(value).unwrap_or(UserType::Unknown)
}
