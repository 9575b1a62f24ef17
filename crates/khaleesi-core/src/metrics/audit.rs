// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Audit event counter.

use khaleesi_proto::common_proto::user::UserType;
use khaleesi_proto::sawmill_proto::event::{ResultType, action::ActionType};
use khaleesi_proto::user_type_name;
use prometheus::{IntCounterVec, Registry, register_int_counter_vec_with_registry};

use super::string_or_unknown;

const LABELS: [&str; 9] = [
    "origin_khaleesi_gate",
    "origin_khaleesi_service",
    "user",
    "grpc_service",
    "grpc_method",
    "target",
    "action_crud_type",
    "action_custom_type",
    "result",
];

/// Label values of one audit series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEventLabels {
    /// Gate of the service that emitted the event.
    pub origin_gate: String,
    /// Service that emitted the event.
    pub origin_service: String,
    /// User type name.
    pub user: String,
    /// gRPC service that emitted the event.
    pub grpc_service: String,
    /// gRPC method that emitted the event.
    pub grpc_method: String,
    /// Event target type.
    pub target: String,
    /// CRUD action name.
    pub action_crud_type: String,
    /// Custom action name.
    pub action_custom_type: String,
    /// Result name.
    pub result: String,
}

impl AuditEventLabels {
    /// Build labels; empty strings become UNKNOWN.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        origin_gate: &str,
        origin_service: &str,
        user: UserType,
        grpc_service: &str,
        grpc_method: &str,
        target: &str,
        crud_type: ActionType,
        custom_type: &str,
        result: ResultType,
    ) -> Self {
        Self {
            origin_gate: string_or_unknown(origin_gate).to_string(),
            origin_service: string_or_unknown(origin_service).to_string(),
            user: user_type_name(user).to_string(),
            grpc_service: string_or_unknown(grpc_service).to_string(),
            grpc_method: string_or_unknown(grpc_method).to_string(),
            target: string_or_unknown(target).to_string(),
            action_crud_type: crud_type.as_str_name().to_string(),
            action_custom_type: string_or_unknown(custom_type).to_string(),
            result: result.as_str_name().to_string(),
        }
    }

    fn values(&self) -> [&str; 9] {
        [
            &self.origin_gate,
            &self.origin_service,
            &self.user,
            &self.grpc_service,
            &self.grpc_method,
            &self.target,
            &self.action_crud_type,
            &self.action_custom_type,
            &self.result,
        ]
    }
}

/// `khaleesi_audit_event`
pub struct AuditEventMetric {
    counter: IntCounterVec,
}

impl AuditEventMetric {
    pub(crate) fn new(registry: &Registry) -> prometheus::Result<Self> {
        let counter = register_int_counter_vec_with_registry!(
            "khaleesi_audit_event",
            "Audit events emitted",
            &LABELS,
            registry,
        )?;
        Ok(Self { counter })
    }

    /// Count one event.
    pub fn inc(&self, labels: &AuditEventLabels) {
        self.counter.with_label_values(&labels.values()).inc();
    }

    /// Make the series visible at zero.
    pub fn register(&self, labels: &AuditEventLabels) {
        self.counter.with_label_values(&labels.values()).inc_by(0);
    }

    /// Current count of a series.
    pub fn get(&self, labels: &AuditEventLabels) -> u64 {
        self.counter.with_label_values(&labels.values()).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_labels_and_counts() {
        let registry = Registry::new();
        let metric = AuditEventMetric::new(&registry).unwrap();
        let labels = AuditEventLabels::new(
            "core",
            "sawmill",
            UserType::System,
            "grpc-server",
            "LIFECYCLE",
            "core.core.server",
            ActionType::Start,
            "",
            ResultType::Success,
        );

        assert_eq!(labels.action_crud_type, "START");
        assert_eq!(labels.action_custom_type, "UNKNOWN");
        assert_eq!(labels.result, "SUCCESS");

        metric.register(&labels);
        assert_eq!(metric.get(&labels), 0);
        metric.inc(&labels);
        assert_eq!(metric.get(&labels), 1);
    }
}
