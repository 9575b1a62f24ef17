// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Prometheus metrics shared by every khaleesi service.
//!
//! | Metric                         | Kind       | Variable labels                                   |
//! |--------------------------------|------------|---------------------------------------------------|
//! | `khaleesi_health`              | enum gauge | `state`                                           |
//! | `khaleesi_incoming_requests`   | counter    | status, user, own method, peer coordinate         |
//! | `khaleesi_outgoing_requests`   | counter    | status, user, own method, peer coordinate         |
//! | `khaleesi_audit_event`         | counter    | origin, user, own method, target, action, result  |
//!
//! Every metric carries the constant labels `khaleesi_gate`, `khaleesi_service`
//! and `khaleesi_version`.

pub mod audit;
pub mod exposition;
pub mod health;
pub mod initializer;
pub mod requests;

use std::collections::HashMap;
use std::sync::Arc;

use prometheus::{Encoder, Registry, TextEncoder};

use crate::config::KhaleesiSettings;
use crate::state::UNKNOWN;

pub use audit::{AuditEventLabels, AuditEventMetric};
pub use health::{HealthMetric, HealthState};
pub use initializer::{CallDataSource, EventData, MetricInitializer};
pub use requests::{RequestLabels, RequestsMetric};

/// The metric registry of one service.
pub struct KhaleesiMetrics {
    registry: Registry,
    /// Service health.
    pub health: HealthMetric,
    /// Requests served.
    pub incoming_requests: RequestsMetric,
    /// Requests sent to peers.
    pub outgoing_requests: RequestsMetric,
    /// Audit events emitted.
    pub audit_event: AuditEventMetric,
}

impl KhaleesiMetrics {
    /// Create and register every metric for the service described by `settings`.
    pub fn new(settings: &KhaleesiSettings) -> prometheus::Result<Arc<Self>> {
        let const_labels = HashMap::from([
            ("khaleesi_gate".to_string(), settings.gate.clone()),
            ("khaleesi_service".to_string(), settings.service.clone()),
            ("khaleesi_version".to_string(), settings.version.clone()),
        ]);
        let registry = Registry::new_custom(None, Some(const_labels))?;

        Ok(Arc::new(Self {
            health: HealthMetric::new(&registry)?,
            incoming_requests: RequestsMetric::new(
                "khaleesi_incoming_requests",
                "Requests served by this service",
                &registry,
            )?,
            outgoing_requests: RequestsMetric::new(
                "khaleesi_outgoing_requests",
                "Requests sent by this service to its peers",
                &registry,
            )?,
            audit_event: AuditEventMetric::new(&registry)?,
            registry,
        }))
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Label value for a possibly empty string.
pub(crate) fn string_or_unknown(value: &str) -> &str {
    if value.is_empty() { UNKNOWN } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_carry_const_labels() {
        let mut settings = KhaleesiSettings::for_service("core", "sawmill");
        settings.version = "1.0.0".to_string();
        let metrics = KhaleesiMetrics::new(&settings).unwrap();
        metrics.health.set(HealthState::Healthy);

        let text = metrics.render();
        assert!(text.contains("khaleesi_health"));
        assert!(text.contains("khaleesi_gate=\"core\""));
        assert!(text.contains("khaleesi_service=\"sawmill\""));
        assert!(text.contains("khaleesi_version=\"1.0.0\""));
    }

    #[test]
    fn test_string_or_unknown() {
        assert_eq!(string_or_unknown(""), "UNKNOWN");
        assert_eq!(string_or_unknown("core"), "core");
    }
}
