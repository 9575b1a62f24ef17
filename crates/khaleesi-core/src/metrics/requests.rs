// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request counters, one series per (status, user, own method, peer).

use khaleesi_proto::common_proto::{GrpcCaller, user::UserType};
use khaleesi_proto::user_type_name;
use prometheus::{IntCounterVec, Registry, register_int_counter_vec_with_registry};

use super::string_or_unknown;

const LABELS: [&str; 8] = [
    "status",
    "user",
    "grpc_service",
    "grpc_method",
    "peer_khaleesi_gate",
    "peer_khaleesi_service",
    "peer_grpc_service",
    "peer_grpc_method",
];

/// Label values of one request series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLabels {
    /// Final gRPC status name.
    pub status: String,
    /// User type name.
    pub user: String,
    /// Own gRPC service.
    pub grpc_service: String,
    /// Own gRPC method.
    pub grpc_method: String,
    /// Peer gate.
    pub peer_gate: String,
    /// Peer service.
    pub peer_service: String,
    /// Peer gRPC service.
    pub peer_grpc_service: String,
    /// Peer gRPC method.
    pub peer_grpc_method: String,
}

impl RequestLabels {
    /// Labels for a request between the own `(grpc_service, grpc_method)` and `peer`.
    pub fn new(
        status: &str,
        user: UserType,
        grpc_service: &str,
        grpc_method: &str,
        peer: &GrpcCaller,
    ) -> Self {
        Self {
            status: string_or_unknown(status).to_string(),
            user: user_type_name(user).to_string(),
            grpc_service: string_or_unknown(grpc_service).to_string(),
            grpc_method: string_or_unknown(grpc_method).to_string(),
            peer_gate: string_or_unknown(&peer.khaleesi_gate).to_string(),
            peer_service: string_or_unknown(&peer.khaleesi_service).to_string(),
            peer_grpc_service: string_or_unknown(&peer.grpc_service).to_string(),
            peer_grpc_method: string_or_unknown(&peer.grpc_method).to_string(),
        }
    }

    fn values(&self) -> [&str; 8] {
        [
            &self.status,
            &self.user,
            &self.grpc_service,
            &self.grpc_method,
            &self.peer_gate,
            &self.peer_service,
            &self.peer_grpc_service,
            &self.peer_grpc_method,
        ]
    }
}

/// `khaleesi_incoming_requests` or `khaleesi_outgoing_requests`
pub struct RequestsMetric {
    counter: IntCounterVec,
}

impl RequestsMetric {
    pub(crate) fn new(name: &str, help: &str, registry: &Registry) -> prometheus::Result<Self> {
        let counter = register_int_counter_vec_with_registry!(name, help, &LABELS, registry)?;
        Ok(Self { counter })
    }

    /// Count one request.
    pub fn inc(&self, labels: &RequestLabels) {
        self.counter.with_label_values(&labels.values()).inc();
    }

    /// Make the series visible at zero.
    pub fn register(&self, labels: &RequestLabels) {
        self.counter.with_label_values(&labels.values()).inc_by(0);
    }

    /// Current count of a series.
    pub fn get(&self, labels: &RequestLabels) -> u64 {
        self.counter.with_label_values(&labels.values()).get()
    }

    /// Number of series created so far.
    pub fn series_count(&self) -> usize {
        use prometheus::core::Collector;
        self.counter
            .collect()
            .iter()
            .map(|family| family.get_metric().len())
            .sum()
    }
}
