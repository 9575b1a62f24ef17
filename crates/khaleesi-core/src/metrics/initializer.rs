// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pre-registration of request and audit counters at zero.
//!
//! Counters that never moved are invisible to Prometheus, which makes rate
//! alerts blind until the first failure. On start every series the service can
//! produce is created at zero: request series from the call graph the sink has
//! learned, audit series from static [`EventData`] descriptions.

use std::sync::Arc;

use async_trait::async_trait;
use khaleesi_proto::common_proto::{EmptyRequest, GrpcCaller, user::UserType};
use khaleesi_proto::sawmill_proto::ServiceCallData;
use khaleesi_proto::sawmill_proto::event::{ResultType, action::ActionType};
use tracing::info;

use super::{AuditEventLabels, KhaleesiMetrics, RequestLabels};
use crate::config::KhaleesiSettings;
use crate::error::{ALL_STATUS_CODES, Result, status_name};
use crate::metadata::add_system_request_metadata;

const ALL_USER_TYPES: [UserType; 3] = [UserType::Unknown, UserType::System, UserType::User];

/// Static description of the events a service may emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    /// Gate of the emitting service.
    pub origin_gate: String,
    /// Emitting service.
    pub origin_service: String,
    /// gRPC service emitting the event.
    pub grpc_service: String,
    /// gRPC method emitting the event.
    pub grpc_method: String,
    /// Event target type.
    pub target: String,
    /// CRUD actions.
    pub crud_types: Vec<ActionType>,
    /// Custom actions.
    pub custom_types: Vec<String>,
    /// Possible results.
    pub result_types: Vec<ResultType>,
    /// Users that may trigger the event.
    pub user_types: Vec<UserType>,
}

impl EventData {
    /// Lifecycle events of the service `(gate, service)`.
    pub fn lifecycle(settings: &KhaleesiSettings, gate: &str, service: &str) -> Self {
        Self {
            origin_gate: gate.to_string(),
            origin_service: service.to_string(),
            grpc_service: settings.system.service_name.clone(),
            grpc_method: settings.system.lifecycle_method.clone(),
            target: settings.system.lifecycle_target.clone(),
            crud_types: vec![ActionType::Start, ActionType::End],
            custom_types: Vec::new(),
            result_types: vec![
                ResultType::Success,
                ResultType::Warning,
                ResultType::Error,
                ResultType::Fatal,
            ],
            user_types: vec![UserType::System],
        }
    }

    /// Every audit series these events can produce.
    pub fn labels(&self) -> impl Iterator<Item = AuditEventLabels> + '_ {
        let actions = self
            .crud_types
            .iter()
            .map(|crud| (*crud, ""))
            .chain(
                self.custom_types
                    .iter()
                    .map(|custom| (ActionType::Unknown, custom.as_str())),
            )
            .collect::<Vec<_>>();

        self.user_types.iter().flat_map(move |user| {
            let actions = actions.clone();
            actions.into_iter().flat_map(move |(crud, custom)| {
                self.result_types.iter().map(move |result| {
                    AuditEventLabels::new(
                        &self.origin_gate,
                        &self.origin_service,
                        *user,
                        &self.grpc_service,
                        &self.grpc_method,
                        &self.target,
                        crud,
                        custom,
                        *result,
                    )
                })
            })
        })
    }
}

/// Where the call graph comes from.
#[async_trait]
pub trait CallDataSource: Send + Sync {
    /// Call data for the caller described in `request`.
    async fn service_call_data(&self, request: EmptyRequest) -> Result<ServiceCallData>;
}

/// Registers every known series at zero.
pub struct MetricInitializer {
    settings: Arc<KhaleesiSettings>,
    metrics: Arc<KhaleesiMetrics>,
    source: Arc<dyn CallDataSource>,
    events: Vec<EventData>,
}

impl MetricInitializer {
    /// Create an initializer. The service's own lifecycle events are always included.
    pub fn new(
        settings: Arc<KhaleesiSettings>,
        metrics: Arc<KhaleesiMetrics>,
        source: Arc<dyn CallDataSource>,
        mut events: Vec<EventData>,
    ) -> Self {
        events.push(EventData::lifecycle(
            &settings,
            &settings.gate,
            &settings.service,
        ));
        Self {
            settings,
            metrics,
            source,
            events,
        }
    }

    /// Fetch call data and register every request and audit series.
    pub async fn initialize_metrics(&self) -> Result<()> {
        let grpc_request_id = uuid::Uuid::new_v4().to_string();
        let request = EmptyRequest {
            request_metadata: Some(add_system_request_metadata(
                &self.settings,
                "system",
                &grpc_request_id,
                &self.settings.system.initialize_request_metrics_method,
            )),
        };
        let call_data = self.source.service_call_data(request).await?;
        self.register_requests(&call_data);

        let mut audit_series = 0;
        for event in &self.events {
            for labels in event.labels() {
                self.metrics.audit_event.register(&labels);
                audit_series += 1;
            }
        }

        info!(
            methods = call_data.call_list.len(),
            audit_series, "Request metrics initialized"
        );
        Ok(())
    }

    fn register_requests(&self, call_data: &ServiceCallData) {
        let system_service = &self.settings.system.service_name;
        for entry in &call_data.call_list {
            let own = entry.call.clone().unwrap_or_default();
            let users: &[UserType] = if &own.grpc_service == system_service {
                &[UserType::System]
            } else {
                &ALL_USER_TYPES
            };

            for user in users {
                for peer in &entry.calls {
                    if skip_peer(peer, *user, system_service) {
                        continue;
                    }
                    for code in ALL_STATUS_CODES {
                        self.metrics.outgoing_requests.register(&RequestLabels::new(
                            status_name(code),
                            *user,
                            &own.grpc_service,
                            &own.grpc_method,
                            peer,
                        ));
                    }
                }
                for peer in &entry.called_by {
                    if skip_peer(peer, *user, system_service) {
                        continue;
                    }
                    for code in ALL_STATUS_CODES {
                        self.metrics.incoming_requests.register(&RequestLabels::new(
                            status_name(code),
                            *user,
                            &own.grpc_service,
                            &own.grpc_method,
                            peer,
                        ));
                    }
                }
            }
        }
    }
}

// Lifecycle peers only ever talk as SYSTEM.
fn skip_peer(peer: &GrpcCaller, user: UserType, system_service: &str) -> bool {
    peer.grpc_service == system_service && user != UserType::System
}

#[cfg(test)]
mod tests {
    use super::*;
    use khaleesi_proto::sawmill_proto::CallData;
    use std::sync::Mutex;

    struct StaticSource {
        data: ServiceCallData,
        requests: Mutex<Vec<EmptyRequest>>,
    }

    #[async_trait]
    impl CallDataSource for StaticSource {
        async fn service_call_data(&self, request: EmptyRequest) -> Result<ServiceCallData> {
            self.requests.lock().unwrap().push(request);
            Ok(self.data.clone())
        }
    }

    fn caller(gate: &str, service: &str, grpc_service: &str, method: &str) -> GrpcCaller {
        GrpcCaller {
            khaleesi_gate: gate.to_string(),
            khaleesi_service: service.to_string(),
            grpc_service: grpc_service.to_string(),
            grpc_method: method.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_registers_request_series_at_zero() {
        let settings = Arc::new(KhaleesiSettings::for_service("core", "sawmill"));
        let metrics = KhaleesiMetrics::new(&settings).unwrap();
        let front = caller("gw", "front", "Front", "Hit");
        let source = Arc::new(StaticSource {
            data: ServiceCallData {
                call_list: vec![CallData {
                    call: Some(caller("core", "sawmill", "Lumberjack", "LogEvent")),
                    calls: vec![],
                    called_by: vec![front.clone()],
                }],
            },
            requests: Mutex::new(Vec::new()),
        });

        let initializer =
            MetricInitializer::new(settings.clone(), metrics.clone(), source.clone(), vec![]);
        initializer.initialize_metrics().await.unwrap();

        // 3 user types x 17 status codes
        assert_eq!(metrics.incoming_requests.series_count(), 51);
        assert_eq!(metrics.outgoing_requests.series_count(), 0);
        let labels = RequestLabels::new("OK", UserType::User, "Lumberjack", "LogEvent", &front);
        assert_eq!(metrics.incoming_requests.get(&labels), 0);

        let requests = source.requests.lock().unwrap();
        let metadata = requests[0].request_metadata.as_ref().unwrap();
        assert_eq!(
            metadata.grpc_caller.as_ref().unwrap().grpc_method,
            "INITIALIZE_REQUEST_METRICS"
        );
    }

    #[tokio::test]
    async fn test_lifecycle_method_registers_system_only() {
        let settings = Arc::new(KhaleesiSettings::for_service("core", "sawmill"));
        let metrics = KhaleesiMetrics::new(&settings).unwrap();
        let lifecycle = caller("core", "sawmill", "grpc-server", "LIFECYCLE");
        let source = Arc::new(StaticSource {
            data: ServiceCallData {
                call_list: vec![CallData {
                    call: Some(lifecycle),
                    calls: vec![caller("core", "sawmill", "Lumberjack", "LogEvent")],
                    called_by: vec![],
                }],
            },
            requests: Mutex::new(Vec::new()),
        });

        MetricInitializer::new(settings, metrics.clone(), source, vec![])
            .initialize_metrics()
            .await
            .unwrap();

        assert_eq!(metrics.outgoing_requests.series_count(), 17);
    }

    #[test]
    fn test_event_data_label_product() {
        let settings = KhaleesiSettings::for_service("core", "sawmill");
        let data = EventData {
            origin_gate: "core".to_string(),
            origin_service: "sawmill".to_string(),
            grpc_service: "Maid".to_string(),
            grpc_method: "Cleanup".to_string(),
            target: settings.system.batch_job_target.clone(),
            crud_types: vec![ActionType::Start, ActionType::End],
            custom_types: vec!["CLEANUP".to_string()],
            result_types: vec![ResultType::Success, ResultType::Error],
            user_types: vec![UserType::System, UserType::User],
        };

        // 2 users x 3 actions x 2 results
        assert_eq!(data.labels().count(), 12);
        assert_eq!(
            EventData::lifecycle(&settings, "core", "sawmill")
                .labels()
                .count(),
            8
        );
    }
}
