// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for khaleesi services.
//!
//! Every failure crossing an interceptor or lifecycle boundary is a [`KhaleesiError`].
//! Public fields are returned to callers; private fields only ever reach the sink.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::Code;

/// Result type using KhaleesiError
pub type Result<T> = std::result::Result<T, KhaleesiError>;

/// Severity of a log line or error, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Unexpected but handled.
    Warning,
    /// Failed operation.
    Error,
    /// Failure that should never happen.
    Fatal,
}

impl LogLevel {
    /// Upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }

    /// Parse an upper-case name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "FATAL" => Some(Self::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which member of the error taxonomy an error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Caller supplied an invalid value.
    InvalidArgument,
    /// Generic server-side failure.
    InternalServer,
    /// Precondition violation that should never reach production.
    Programming,
    /// A non-khaleesi failure, scrubbed before leaving the process.
    Masking,
    /// A downstream RPC returned a non-OK status.
    UpstreamGrpc,
    /// Lifecycle shutdown ran out of time.
    Timeout,
    /// Versioned write lost against a concurrent update.
    DbOutdatedInformation,
    /// Requested row does not exist.
    DbObjectNotFound,
    /// Row to create already exists.
    DbObjectTwin,
}

/// A khaleesi exception.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} ({}): {private_message}: {private_details}", status_label(.status))]
pub struct KhaleesiError {
    /// Taxonomy member.
    pub kind: ErrorKind,
    /// gRPC status returned to the caller.
    pub status: Code,
    /// Level this error is logged at.
    pub loglevel: LogLevel,
    /// Gate of the service that raised the error.
    pub gate: String,
    /// Service that raised the error.
    pub service: String,
    /// Stable key callers can translate.
    pub public_key: String,
    /// Details safe to show callers.
    pub public_details: String,
    /// Internal summary.
    pub private_message: String,
    /// Internal details.
    pub private_details: String,
    /// Captured backtrace, empty unless backtraces are enabled.
    pub stacktrace: String,
}

impl KhaleesiError {
    fn new(
        kind: ErrorKind,
        status: Code,
        loglevel: LogLevel,
        public_key: &str,
        public_details: impl Into<String>,
        private_message: impl Into<String>,
        private_details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            status,
            loglevel,
            gate: String::new(),
            service: String::new(),
            public_key: public_key.to_string(),
            public_details: public_details.into(),
            private_message: private_message.into(),
            private_details: private_details.into(),
            stacktrace: capture_stacktrace(),
        }
    }

    /// Caller supplied an invalid value.
    pub fn invalid_argument(
        public_details: impl Into<String>,
        private_message: impl Into<String>,
        private_details: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::InvalidArgument,
            Code::InvalidArgument,
            LogLevel::Warning,
            "invalid-argument",
            public_details,
            private_message,
            private_details,
        )
    }

    /// Generic server-side failure logged at `loglevel`.
    pub fn internal_server(
        loglevel: LogLevel,
        public_details: impl Into<String>,
        private_message: impl Into<String>,
        private_details: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::InternalServer,
            Code::Internal,
            loglevel,
            "internal-server-error",
            public_details,
            private_message,
            private_details,
        )
    }

    /// Precondition violation.
    pub fn programming(
        private_message: impl Into<String>,
        private_details: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Programming,
            Code::Internal,
            LogLevel::Fatal,
            "internal-server-error",
            "",
            private_message,
            private_details,
        )
    }

    /// Wrap a non-khaleesi error. Its type name and text stay private.
    pub fn masking<E: std::error::Error + ?Sized>(error: &E) -> Self {
        Self::masking_parts(std::any::type_name::<E>(), error.to_string())
    }

    /// Wrap a caught panic payload.
    pub fn masking_panic(payload: Box<dyn Any + Send>) -> Self {
        let details = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::masking_parts("panic", details)
    }

    fn masking_parts(type_name: &str, details: String) -> Self {
        Self::new(
            ErrorKind::Masking,
            Code::Internal,
            LogLevel::Fatal,
            "internal-server-error",
            "",
            type_name,
            details,
        )
    }

    /// A downstream RPC answered with a non-OK status.
    pub fn upstream_grpc(status: &tonic::Status) -> Self {
        Self::new(
            ErrorKind::UpstreamGrpc,
            status.code(),
            LogLevel::Error,
            "upstream-error",
            "",
            "Upstream gRPC request failed",
            status.to_string(),
        )
    }

    /// Shutdown did not complete in time.
    pub fn timeout(private_message: impl Into<String>, private_details: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Timeout,
            Code::DeadlineExceeded,
            LogLevel::Error,
            "timeout",
            "",
            private_message,
            private_details,
        )
    }

    /// Versioned write observed a different version than expected.
    pub fn db_outdated_information(private_details: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DbOutdatedInformation,
            Code::FailedPrecondition,
            LogLevel::Error,
            "db-outdated-information",
            "The information is outdated, please refresh and try again.",
            "Outdated information",
            private_details,
        )
    }

    /// Requested row does not exist.
    pub fn db_object_not_found(private_details: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DbObjectNotFound,
            Code::NotFound,
            LogLevel::Warning,
            "db-object-not-found",
            "The requested object was not found.",
            "Object not found",
            private_details,
        )
    }

    /// Row to create already exists.
    pub fn db_object_twin(private_details: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DbObjectTwin,
            Code::FailedPrecondition,
            LogLevel::Error,
            "db-object-twin",
            "The object already exists.",
            "Object twin",
            private_details,
        )
    }

    /// Attach the raising service, unless already set.
    pub fn with_origin(mut self, gate: &str, service: &str) -> Self {
        if self.gate.is_empty() {
            self.gate = gate.to_string();
        }
        if self.service.is_empty() {
            self.service = service.to_string();
        }
        self
    }

    /// Full JSON representation, private fields included.
    pub fn to_json(&self) -> String {
        // Serializing a struct of strings cannot fail.
        serde_json::to_string(&ErrorJson::from(self)).unwrap_or_default()
    }

    /// Rebuild an error from [`to_json`](Self::to_json) output.
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        let parsed: ErrorJson = serde_json::from_str(json)?;
        Ok(Self {
            kind: parsed.kind,
            status: code_from_name(&parsed.status),
            loglevel: LogLevel::from_name(&parsed.loglevel).unwrap_or(LogLevel::Fatal),
            gate: parsed.gate,
            service: parsed.service,
            public_key: parsed.public_key,
            public_details: parsed.public_details,
            private_message: parsed.private_message,
            private_details: parsed.private_details,
            stacktrace: parsed.stacktrace,
        })
    }

    /// The part of the error callers are allowed to see.
    pub fn public_json(&self) -> String {
        serde_json::json!({
            "publicKey": self.public_key,
            "publicDetails": self.public_details,
        })
        .to_string()
    }

    /// Convert to the status sent back to the caller.
    pub fn to_status(&self) -> tonic::Status {
        let public = self.public_json();
        tonic::Status::with_details(self.status, public.clone(), public.into_bytes().into())
    }
}

impl From<KhaleesiError> for tonic::Status {
    fn from(error: KhaleesiError) -> Self {
        error.to_status()
    }
}

impl From<sqlx::Error> for KhaleesiError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Self::db_object_not_found("Row not found"),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Self::db_object_twin(db.message().to_string())
            }
            other => Self::masking(&other),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorJson {
    kind: ErrorKind,
    status: String,
    loglevel: String,
    gate: String,
    service: String,
    public_key: String,
    public_details: String,
    private_message: String,
    private_details: String,
    stacktrace: String,
}

impl From<&KhaleesiError> for ErrorJson {
    fn from(error: &KhaleesiError) -> Self {
        Self {
            kind: error.kind,
            status: status_name(error.status).to_string(),
            loglevel: error.loglevel.as_str().to_string(),
            gate: error.gate.clone(),
            service: error.service.clone(),
            public_key: error.public_key.clone(),
            public_details: error.public_details.clone(),
            private_message: error.private_message.clone(),
            private_details: error.private_details.clone(),
            stacktrace: error.stacktrace.clone(),
        }
    }
}

fn capture_stacktrace() -> String {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => backtrace.to_string(),
        _ => String::new(),
    }
}

/// Every gRPC status code, in wire order.
pub const ALL_STATUS_CODES: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

fn status_label(code: &Code) -> &'static str {
    status_name(*code)
}

/// Canonical upper-case name of a status code.
pub fn status_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// Inverse of [`status_name`]; unrecognized names map to `Unknown`.
pub fn code_from_name(name: &str) -> Code {
    ALL_STATUS_CODES
        .into_iter()
        .find(|code| status_name(*code) == name)
        .unwrap_or(Code::Unknown)
}
