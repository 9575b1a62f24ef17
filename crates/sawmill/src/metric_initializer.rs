// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call data for sawmill's own metric initialization.
//!
//! Other services ask `Forester` for their call graph; sawmill reads its
//! registry directly. The sink also counts the lifecycle events of every other
//! service it knows, so those series are registered at zero here as well.

use std::sync::Arc;

use async_trait::async_trait;
use khaleesi_core::config::KhaleesiSettings;
use khaleesi_core::error::Result;
use khaleesi_core::metrics::{CallDataSource, EventData, KhaleesiMetrics};
use khaleesi_proto::common_proto::EmptyRequest;
use khaleesi_proto::sawmill_proto::ServiceCallData;
use tracing::info;

use crate::service_registry::ServiceRegistry;

/// [`CallDataSource`] backed by the service registry.
pub struct RegistryCallDataSource {
    registry: Arc<ServiceRegistry>,
    settings: Arc<KhaleesiSettings>,
    metrics: Arc<KhaleesiMetrics>,
}

impl RegistryCallDataSource {
    /// Source reading `registry`.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        settings: Arc<KhaleesiSettings>,
        metrics: Arc<KhaleesiMetrics>,
    ) -> Self {
        Self {
            registry,
            settings,
            metrics,
        }
    }
}

#[async_trait]
impl CallDataSource for RegistryCallDataSource {
    async fn service_call_data(&self, request: EmptyRequest) -> Result<ServiceCallData> {
        self.registry.reload().await?;

        let owner = request
            .request_metadata
            .and_then(|metadata| metadata.grpc_caller)
            .unwrap_or_default();
        let call_data = self.registry.get_call_data(&owner).await?;

        let mut services = 0;
        for (gate, service) in self.registry.snapshot().services() {
            if gate == self.settings.gate && service == self.settings.service {
                continue;
            }
            for labels in EventData::lifecycle(&self.settings, &gate, &service).labels() {
                self.metrics.audit_event.register(&labels);
            }
            services += 1;
        }
        info!(services, "Lifecycle metrics of known services registered");

        Ok(call_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khaleesi_core::metadata::add_system_request_metadata;
    use khaleesi_core::metrics::AuditEventLabels;
    use khaleesi_proto::common_proto::{GrpcCaller, user::UserType};
    use khaleesi_proto::sawmill_proto::event::{ResultType, action::ActionType};
    use sqlx::sqlite::SqlitePoolOptions;

    fn caller(gate: &str, service: &str, grpc_service: &str, grpc_method: &str) -> GrpcCaller {
        GrpcCaller {
            request_id: "r".to_string(),
            khaleesi_gate: gate.to_string(),
            khaleesi_service: service.to_string(),
            grpc_service: grpc_service.to_string(),
            grpc_method: grpc_method.to_string(),
            pod_id: "pod".to_string(),
        }
    }

    #[tokio::test]
    async fn test_registers_lifecycle_of_other_services() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run(&pool).await.unwrap();
        let settings = Arc::new(KhaleesiSettings::for_service("core", "sawmill"));
        let metrics = KhaleesiMetrics::new(&settings).unwrap();
        let registry = Arc::new(ServiceRegistry::new(pool.clone()));
        registry
            .add_call(
                &caller("gw", "front", "Front", "Hit"),
                &caller("core", "sawmill", "Lumberjack", "LogEvent"),
            )
            .await
            .unwrap();
        let source = RegistryCallDataSource::new(registry, settings.clone(), metrics.clone());

        let request = EmptyRequest {
            request_metadata: Some(add_system_request_metadata(
                &settings,
                "metrics",
                "metrics",
                &settings.system.initialize_request_metrics_method,
            )),
        };
        let call_data = source.service_call_data(request).await.unwrap();

        assert!(!call_data.call_list.is_empty());
        let labels = AuditEventLabels::new(
            "gw",
            "front",
            UserType::System,
            &settings.system.service_name,
            &settings.system.lifecycle_method,
            &settings.system.lifecycle_target,
            ActionType::Start,
            "",
            ResultType::Success,
        );
        assert_eq!(metrics.audit_event.get(&labels), 0);
        assert!(metrics.render().contains("origin_khaleesi_service=\"front\""));
    }
}
