// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server lifecycle: migrate, initialize and start, then drain on SIGTERM.
//!
//! The whole startup is one system HTTP request (method `LIFECYCLE`) and every
//! step is a system gRPC request inside it, so the sink sees each step on its
//! own. Startup and shutdown each end with a lifecycle event targeting the pod.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use khaleesi_core::lifecycle::KhaleesiServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = KhaleesiServer::builder(logger)
//!         .channels(channels)
//!         .migrations(Arc::new(migrations))
//!         .routes(Routes::new(MyServiceServer::new(service)))
//!         .start()
//!         .await?;
//!
//!     server.wait_for_termination().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use khaleesi_proto::common_proto::maid_server::MaidServer;
use khaleesi_proto::sawmill_proto::event::{ResultType, action::ActionType};
use tokio::net::TcpListener;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::Code;
use tonic::service::Routes;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;
use tracing::{info, warn};

use crate::batch::{BatchJobRegistry, Broom, MaidService, NoBroom};
use crate::channels::ChannelManager;
use crate::config::KhaleesiSettings;
use crate::error::{KhaleesiError, LogLevel, Result};
use crate::interceptors::{ClientInterceptor, ServerInterceptorChain};
use crate::logging::{GrpcCallDataSource, StructuredLogger, structured::system_event};
use crate::metrics::{CallDataSource, EventData, HealthState, MetricInitializer, exposition};

/// Schema migrations run by the `MIGRATE` step.
#[async_trait]
pub trait Migrate: Send + Sync {
    /// Apply pending migrations; with `target`, only up to and including that migration.
    async fn migrate(&self, target: Option<&str>) -> Result<()>;
}

/// Builder for a [`RunningServer`].
pub struct KhaleesiServerBuilder {
    logger: StructuredLogger,
    channels: Option<Arc<ChannelManager>>,
    jobs: Option<Arc<BatchJobRegistry>>,
    migrations: Option<Arc<dyn Migrate>>,
    call_data: Option<Arc<dyn CallDataSource>>,
    broom: Arc<dyn Broom>,
    events: Vec<EventData>,
    routes: Option<Routes>,
}

impl std::fmt::Debug for KhaleesiServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KhaleesiServerBuilder")
            .field("gate", &self.logger.settings().gate)
            .field("service", &self.logger.settings().service)
            .field("migrations", &self.migrations.as_ref().map(|_| "..."))
            .field("events", &self.events.len())
            .finish()
    }
}

/// Entry point for building a khaleesi server.
pub struct KhaleesiServer;

impl KhaleesiServer {
    /// Start building a server that logs through `logger`.
    pub fn builder(logger: StructuredLogger) -> KhaleesiServerBuilder {
        KhaleesiServerBuilder {
            logger,
            channels: None,
            jobs: None,
            migrations: None,
            call_data: None,
            broom: Arc::new(NoBroom),
            events: Vec::new(),
            routes: None,
        }
    }
}

impl KhaleesiServerBuilder {
    /// Channels shared with the service's own clients.
    ///
    /// Default: a fresh manager on the configured channel port.
    pub fn channels(mut self, channels: Arc<ChannelManager>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Batch job registry shared with the service's job launchers.
    pub fn jobs(mut self, jobs: Arc<BatchJobRegistry>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Migrations run by the `MIGRATE` step. Without them the step is a no-op and
    /// a configured pre-start migration fails [`start`](Self::start).
    pub fn migrations(mut self, migrations: Arc<dyn Migrate>) -> Self {
        self.migrations = Some(migrations);
        self
    }

    /// Source of call data for metric initialization.
    ///
    /// Default: sawmill's `Forester` over gRPC.
    pub fn call_data(mut self, source: Arc<dyn CallDataSource>) -> Self {
        self.call_data = Some(source);
        self
    }

    /// Cleanup hook behind `Maid.Cleanup`.
    pub fn broom(mut self, broom: Arc<dyn Broom>) -> Self {
        self.broom = broom;
        self
    }

    /// Events the service may emit, pre-registered at zero.
    pub fn event(mut self, event: EventData) -> Self {
        self.events.push(event);
        self
    }

    /// The service's own gRPC services. `Maid` and health are added on top.
    pub fn routes(mut self, routes: Routes) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Run the logged startup sequence.
    pub async fn start(self) -> Result<RunningServer> {
        let settings = self.logger.settings().clone();
        if let Some(target) = &settings.pre_migration {
            let Some(migrations) = &self.migrations else {
                return Err(KhaleesiError::invalid_argument(
                    "",
                    "Pre-start migration requested without migrations",
                    format!("Target \"{target}\" was set but the server has no migration hook."),
                ));
            };
            info!(%target, "Running migrations before server start");
            migrations.migrate(Some(target)).await?;
        }

        let http_request_id = uuid::Uuid::new_v4().to_string();
        let lifecycle_method = settings.system.lifecycle_method.clone();
        self.logger
            .log_http_request(&http_request_id, &lifecycle_method)
            .await;

        let logger = self.logger.clone();
        let result = self.run_steps(&http_request_id).await;
        let status = match &result {
            Ok(_) => Code::Ok,
            Err(e) => e.status,
        };
        logger
            .log_http_response(&http_request_id, &lifecycle_method, status)
            .await;
        result
    }

    async fn run_steps(mut self, http_request_id: &str) -> Result<RunningServer> {
        let settings = self.logger.settings().clone();
        let routes = self.routes.take();
        let step = Step {
            logger: &self.logger,
            http_request_id,
        };

        let migrations = self.migrations.clone();
        step.run(&settings.system.migrate_method, "migration", async {
            match migrations {
                Some(migrations) => migrations.migrate(None).await,
                None => Ok(()),
            }
        })
        .await?;

        let initialized = step
            .run(
                &settings.system.initialize_method,
                "initialization",
                self.initialize(routes),
            )
            .await?;

        step.run(
            &settings.system.lifecycle_method,
            "start",
            initialized.serve(step.http_request_id),
        )
        .await
    }

    async fn initialize(&self, routes: Option<Routes>) -> Result<Initialized> {
        let settings = self.logger.settings().clone();
        let metrics = self.logger.metrics().clone();
        let channels = self
            .channels
            .clone()
            .unwrap_or_else(|| Arc::new(ChannelManager::new(settings.channel_port)));
        let jobs = self.jobs.clone().unwrap_or_default();
        let call_data = self.call_data.clone().unwrap_or_else(|| {
            Arc::new(GrpcCallDataSource::new(
                channels.clone(),
                ClientInterceptor::new(settings.clone(), metrics.clone()),
            ))
        });
        let initializer = MetricInitializer::new(
            settings.clone(),
            metrics.clone(),
            call_data,
            self.events.clone(),
        );

        let listener = bind(settings.grpc_addr, "gRPC").await?;
        let metrics_listener = bind(settings.metrics_addr, "metrics").await?;
        let sigterm = signal(SignalKind::terminate()).map_err(|e| {
            KhaleesiError::internal_server(
                LogLevel::Fatal,
                "",
                "Could not install SIGTERM handler",
                e.to_string(),
            )
        })?;

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        let maid = MaidServer::new(MaidService::new(
            ServerInterceptorChain::new(self.logger.clone()),
            jobs.clone(),
            self.broom.clone(),
        ));
        let routes = match routes {
            Some(routes) => routes.add_service(maid),
            None => Routes::new(maid),
        }
        .add_service(health_service);

        info!(
            grpc_addr = %settings.grpc_addr,
            metrics_addr = %settings.metrics_addr,
            threads = settings.threads,
            "Server initialized"
        );

        Ok(Initialized {
            logger: self.logger.clone(),
            channels,
            jobs,
            initializer,
            listener,
            metrics_listener,
            sigterm,
            health_reporter,
            routes,
        })
    }
}

async fn bind(addr: SocketAddr, name: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        KhaleesiError::internal_server(
            LogLevel::Fatal,
            "",
            format!("Could not bind {name} listener"),
            format!("{addr}: {e}"),
        )
    })
}

/// One logged startup or shutdown step.
struct Step<'a> {
    logger: &'a StructuredLogger,
    http_request_id: &'a str,
}

impl Step<'_> {
    async fn run<T, Fut>(&self, method: &str, activity: &str, step: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let grpc_request_id = uuid::Uuid::new_v4().to_string();
        self.logger
            .log_system_grpc_request(self.http_request_id, &grpc_request_id, method)
            .await;

        let result = AssertUnwindSafe(step)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(KhaleesiError::masking_panic(panic)));

        match result {
            Ok(value) => {
                self.logger
                    .log_system_grpc_response(
                        self.http_request_id,
                        &grpc_request_id,
                        method,
                        Code::Ok,
                    )
                    .await;
                Ok(value)
            }
            Err(e) => {
                self.logger
                    .log_system_error(self.http_request_id, &grpc_request_id, method, &e)
                    .await;
                let event = lifecycle_event(
                    self.logger.settings(),
                    ActionType::Start,
                    ResultType::Fatal,
                    format!(
                        "Server {activity} failed. {}: {}",
                        e.private_message, e.private_details
                    ),
                );
                self.logger
                    .log_system_event(self.http_request_id, &grpc_request_id, method, event)
                    .await;
                self.logger
                    .log_system_grpc_response(self.http_request_id, &grpc_request_id, method, e.status)
                    .await;
                Err(e)
            }
        }
    }
}

fn lifecycle_event(
    settings: &KhaleesiSettings,
    crud_type: ActionType,
    result: ResultType,
    details: impl Into<String>,
) -> khaleesi_proto::sawmill_proto::Event {
    system_event(
        settings,
        &settings.system.lifecycle_target,
        &settings.pod_id,
        crud_type,
        result,
        details,
    )
}

/// Everything the `INITIALIZE` step prepared.
struct Initialized {
    logger: StructuredLogger,
    channels: Arc<ChannelManager>,
    jobs: Arc<BatchJobRegistry>,
    initializer: MetricInitializer,
    listener: TcpListener,
    metrics_listener: TcpListener,
    sigterm: Signal,
    health_reporter: HealthReporter,
    routes: Routes,
}

impl Initialized {
    async fn serve(self, http_request_id: &str) -> Result<RunningServer> {
        let settings = self.logger.settings().clone();
        let metrics = self.logger.metrics().clone();
        self.initializer.initialize_metrics().await?;

        let local_addr = self.listener.local_addr().map_err(|e| KhaleesiError::masking(&e))?;
        let metrics_addr = self
            .metrics_listener
            .local_addr()
            .map_err(|e| KhaleesiError::masking(&e))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let mut builder = Server::builder().concurrency_limit_per_connection(settings.threads);
        let server = builder.add_routes(self.routes).serve_with_incoming_shutdown(
            TcpListenerStream::new(self.listener),
            async {
                shutdown_rx.await.ok();
            },
        );
        let server_task = tokio::spawn(server);

        let metrics_shutdown = Arc::new(Notify::new());
        let metrics_task = tokio::spawn(exposition::serve(
            self.metrics_listener,
            metrics.clone(),
            metrics_shutdown.clone(),
        ));

        metrics.health.set(HealthState::Healthy);
        self.health_reporter
            .set_service_status("", ServingStatus::Serving)
            .await;
        self.health_reporter
            .set_serving::<MaidServer<MaidService>>()
            .await;

        let event = lifecycle_event(
            &settings,
            ActionType::Start,
            ResultType::Success,
            "Server started successfully.",
        );
        self.logger
            .log_system_event(
                http_request_id,
                "system",
                &settings.system.lifecycle_method,
                event,
            )
            .await;
        info!(%local_addr, %metrics_addr, "Server started");

        Ok(RunningServer {
            logger: self.logger,
            channels: self.channels,
            jobs: self.jobs,
            health_reporter: self.health_reporter,
            local_addr,
            metrics_addr,
            sigterm: self.sigterm,
            server_task,
            server_shutdown: shutdown_tx,
            metrics_task,
            metrics_shutdown,
        })
    }
}

/// A started server.
///
/// Call [`wait_for_termination`](Self::wait_for_termination) to serve until SIGTERM,
/// or [`stop`](Self::stop) to drain right away.
pub struct RunningServer {
    logger: StructuredLogger,
    channels: Arc<ChannelManager>,
    jobs: Arc<BatchJobRegistry>,
    health_reporter: HealthReporter,
    local_addr: SocketAddr,
    metrics_addr: SocketAddr,
    sigterm: Signal,
    server_task: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
    server_shutdown: oneshot::Sender<()>,
    metrics_task: JoinHandle<std::io::Result<()>>,
    metrics_shutdown: Arc<Notify>,
}

impl RunningServer {
    /// Address the gRPC server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address the metrics endpoint listens on.
    pub fn metrics_addr(&self) -> SocketAddr {
        self.metrics_addr
    }

    /// Batch job registry of the server.
    pub fn jobs(&self) -> &Arc<BatchJobRegistry> {
        &self.jobs
    }

    /// Serve until SIGTERM, then shut down gracefully.
    pub async fn wait_for_termination(mut self) -> Result<()> {
        self.sigterm.recv().await;
        info!("SIGTERM received");
        self.stop().await
    }

    /// Drain the server, stop batch jobs and close channels.
    ///
    /// Emits END/SUCCESS when everything stopped within the shutdown grace,
    /// END/ERROR when the server had to be aborted and END/FATAL when batch jobs
    /// did not stop.
    pub async fn stop(self) -> Result<()> {
        let settings = self.logger.settings().clone();
        let method = settings.system.lifecycle_method.clone();
        let http_request_id = uuid::Uuid::new_v4().to_string();
        let grpc_request_id = uuid::Uuid::new_v4().to_string();
        self.logger.log_http_request(&http_request_id, &method).await;
        self.logger
            .log_system_grpc_request(&http_request_id, &grpc_request_id, &method)
            .await;

        self.logger.metrics().health.set(HealthState::Terminating);
        self.health_reporter
            .set_service_status("", ServingStatus::NotServing)
            .await;
        self.health_reporter
            .set_not_serving::<MaidServer<MaidService>>()
            .await;

        let RunningServer {
            logger,
            channels,
            jobs,
            mut server_task,
            server_shutdown,
            metrics_task,
            metrics_shutdown,
            ..
        } = self;

        let _ = server_shutdown.send(());
        let grace = settings.shutdown_grace;
        let drained = match tokio::time::timeout(grace, &mut server_task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(KhaleesiError::internal_server(
                LogLevel::Fatal,
                "",
                "Server failed while draining",
                e.to_string(),
            )),
            Ok(Err(e)) => Err(KhaleesiError::masking(&e)),
            Err(_) => {
                warn!(?grace, "Server did not drain in time, aborting");
                server_task.abort();
                Err(KhaleesiError::timeout(
                    "Server stop timed out.",
                    "timeout instead of graceful shutdown",
                ))
            }
        };

        let signaled = jobs.stop_all_jobs();
        let jobs_stopped = jobs.wait_all(grace).await;
        metrics_shutdown.notify_one();
        if let Err(e) = metrics_task.await {
            warn!(error = %e, "Metrics endpoint task failed");
        }

        let (result, event) = match (drained, jobs_stopped) {
            (Ok(()), true) => (
                Ok(()),
                lifecycle_event(
                    &settings,
                    ActionType::End,
                    ResultType::Success,
                    "Server stopped successfully.",
                ),
            ),
            (_, false) => {
                let error = KhaleesiError::timeout(
                    "Server stop timed out.",
                    format!("{} batch jobs did not stop in time.", signaled.len()),
                );
                let event = lifecycle_event(
                    &settings,
                    ActionType::End,
                    ResultType::Fatal,
                    format!(
                        "Server stop failed. {}: {}",
                        error.private_message, error.private_details
                    ),
                );
                (Err(error), event)
            }
            (Err(error), true) => {
                let result = if error.kind == crate::error::ErrorKind::Timeout {
                    ResultType::Error
                } else {
                    ResultType::Fatal
                };
                let event = lifecycle_event(
                    &settings,
                    ActionType::End,
                    result,
                    format!(
                        "Server stop failed. {}: {}",
                        error.private_message, error.private_details
                    ),
                );
                (Err(error), event)
            }
        };

        if let Err(error) = &result {
            logger
                .log_system_error(&http_request_id, &grpc_request_id, &method, error)
                .await;
        }
        logger
            .log_system_event(&http_request_id, &grpc_request_id, &method, event)
            .await;

        let status = match &result {
            Ok(()) => Code::Ok,
            Err(e) => e.status,
        };
        logger
            .log_system_grpc_response(&http_request_id, &grpc_request_id, &method, status)
            .await;
        logger
            .log_http_response(&http_request_id, &method, status)
            .await;

        channels.close_all_channels().await;
        info!("Server stopped");
        result
    }
}
