// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch job contract and runner.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use khaleesi_proto::sawmill_proto::event::{ResultType, action::ActionType};
use tonic::Code;
use tracing::{debug, info};

use super::execution::{JobExecutionRecord, JobExecutionStore};
use super::{JobConfiguration, JobStatus, StopEvent};
use crate::error::{KhaleesiError, LogLevel, Result};
use crate::logging::StructuredLogger;
use crate::logging::structured::system_event;

/// Which page the runner asks for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePolicy {
    /// Pages 1, 2, 3, ...
    Advance,
    /// Always page 1; each batch removes what it processed.
    FirstPage,
}

/// A paginated job over items of type [`BatchJob::Item`].
///
/// Pages are 1-based and ordered consistently between calls.
#[async_trait]
pub trait BatchJob: Send + Sync {
    /// One unit of work.
    type Item: Send;

    /// Size of the whole population.
    async fn count_items(&self) -> Result<i64>;

    /// Page `page` of `page_size` items.
    async fn get_page(&self, page: i64, page_size: i64) -> Result<Vec<Self::Item>>;

    /// Process one page; returns the number of items actually processed.
    async fn execute_batch(&self, items: Vec<Self::Item>) -> Result<i64>;

    /// Page retrieval policy.
    fn page_policy(&self) -> PagePolicy {
        PagePolicy::Advance
    }
}

/// Runs batch jobs and reports their lifecycle.
#[derive(Clone)]
pub struct JobRunner {
    logger: StructuredLogger,
    store: Arc<dyn JobExecutionStore>,
}

struct Progress<'a> {
    config: &'a JobConfiguration,
    execution: JobExecutionRecord,
    items_processed: i64,
}

impl JobRunner {
    /// Create a runner persisting to `store` and reporting through `logger`.
    pub fn new(logger: StructuredLogger, store: Arc<dyn JobExecutionStore>) -> Self {
        Self { logger, store }
    }

    /// Run `job` to completion, stop or time limit.
    ///
    /// Fails only when the execution could not be started or its end could not
    /// be stored; every other failure is recorded on the returned execution.
    pub async fn execute<J: BatchJob>(
        &self,
        job: &J,
        config: &JobConfiguration,
        stop: &StopEvent,
    ) -> Result<JobExecutionRecord> {
        let started_at = Instant::now();

        let execution = match self.start(config).await {
            Ok(execution) => execution,
            Err(error) => {
                self.emit(config, ActionType::Start, ResultType::Fatal, "Job execution could not be started.", 0)
                    .await;
                self.logger.log_error(&error).await;
                return Err(error);
            }
        };
        self.emit(config, ActionType::Start, ResultType::Success, "Job execution started.", 0)
            .await;

        if execution.status() == JobStatus::Skipped {
            self.emit(
                config,
                ActionType::End,
                ResultType::Warning,
                "Job execution skipped, another execution is in progress.",
                0,
            )
            .await;
            return Ok(execution);
        }

        let mut progress = Progress {
            config,
            execution,
            items_processed: 0,
        };

        let total_items = match job.count_items().await {
            Ok(total_items) => total_items,
            Err(error) => {
                return self
                    .fail(
                        progress,
                        error,
                        ResultType::Fatal,
                        "Job execution failed to count the total amount of affected items.",
                    )
                    .await;
            }
        };
        let execution = match self
            .store
            .set_total(&config.job_id, &config.execution_id, total_items)
            .await
        {
            Ok(execution) => execution,
            Err(error) => {
                return self
                    .fail(
                        progress,
                        error,
                        ResultType::Fatal,
                        "Job execution failed to count the total amount of affected items.",
                    )
                    .await;
            }
        };
        progress.execution = execution;

        let policy = job.page_policy();
        let last_page = page_count(total_items, config.batch_size);
        for page_number in 1..=last_page {
            if stop.is_set() {
                return self
                    .end(progress, JobStatus::Abort, ResultType::Warning, "Job execution aborted.")
                    .await;
            }
            if page_number > 1 && started_at.elapsed() > config.timelimit {
                return self
                    .end(progress, JobStatus::Timeout, ResultType::Warning, "Job execution timed out.")
                    .await;
            }

            let requested = match policy {
                PagePolicy::Advance => page_number,
                PagePolicy::FirstPage => 1,
            };
            let page = match job.get_page(requested, config.batch_size).await {
                Ok(page) => page,
                Err(error) => {
                    return self
                        .fail(
                            progress,
                            as_internal(error),
                            ResultType::Error,
                            "Job execution failed to fetch a page.",
                        )
                        .await;
                }
            };
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            let processed = match AssertUnwindSafe(job.execute_batch(page)).catch_unwind().await {
                Ok(Ok(processed)) => processed,
                Ok(Err(error)) => {
                    return self
                        .fail(progress, as_internal(error), ResultType::Error, "Job execution failed.")
                        .await;
                }
                Err(payload) => {
                    return self
                        .fail(
                            progress,
                            KhaleesiError::masking_panic(payload),
                            ResultType::Error,
                            "Job execution failed.",
                        )
                        .await;
                }
            };
            progress.items_processed += processed;
            debug!(
                job_id = %config.job_id,
                page = page_number,
                processed,
                "Batch finished"
            );

            if policy == PagePolicy::FirstPage && processed == 0 {
                let error = KhaleesiError::internal_server(
                    LogLevel::Error,
                    "",
                    "Cleanup batch removed nothing",
                    format!("Page {page_number} of {page_len} items was left in place."),
                );
                return self
                    .fail(progress, error, ResultType::Error, "Job execution failed.")
                    .await;
            }
        }

        self.end(
            progress,
            JobStatus::Success,
            ResultType::Success,
            "Job execution finished successfully.",
        )
        .await
    }

    async fn start(&self, config: &JobConfiguration) -> Result<JobExecutionRecord> {
        self.store.schedule(config).await?;
        self.store.start(&config.job_id, &config.execution_id).await
    }

    async fn end(
        &self,
        progress: Progress<'_>,
        status: JobStatus,
        result: ResultType,
        details: &str,
    ) -> Result<JobExecutionRecord> {
        let finished = self
            .store
            .finish(&progress.execution, status, progress.items_processed, details)
            .await;
        let execution = match finished {
            Ok(execution) => execution,
            Err(error) => {
                self.logger.log_error(&error).await;
                self.emit(
                    progress.config,
                    ActionType::End,
                    ResultType::Fatal,
                    "Job execution could not be recorded as ended.",
                    progress.items_processed,
                )
                .await;
                return Err(error);
            }
        };
        info!(
            job_id = %progress.config.job_id,
            execution_id = %progress.config.execution_id,
            status = %status,
            items_processed = progress.items_processed,
            "Job execution ended"
        );
        self.emit(progress.config, ActionType::End, result, details, progress.items_processed)
            .await;
        Ok(execution)
    }

    async fn fail(
        &self,
        progress: Progress<'_>,
        error: KhaleesiError,
        result: ResultType,
        details: &str,
    ) -> Result<JobExecutionRecord> {
        self.logger.log_error(&error).await;
        self.end(progress, JobStatus::Error, result, details).await
    }

    async fn emit(
        &self,
        config: &JobConfiguration,
        crud_type: ActionType,
        result: ResultType,
        details: &str,
        items_processed: i64,
    ) {
        let settings = self.logger.settings();
        let event = system_event(
            settings,
            &settings.system.batch_job_target,
            &config.job_id,
            crud_type,
            result,
            format!(
                "Job execution \"{}\" for \"{}\": {} {} items processed so far.",
                config.execution_id, config.job_id, details, items_processed
            ),
        );
        self.logger.log_event(event).await;
    }
}

/// Number of pages covering `total_items`.
fn page_count(total_items: i64, batch_size: i64) -> i64 {
    if total_items <= 0 || batch_size <= 0 {
        return 0;
    }
    (total_items + batch_size - 1) / batch_size
}

/// Job errors leave the runner as internal errors.
fn as_internal(error: KhaleesiError) -> KhaleesiError {
    if error.status == Code::Internal {
        error
    } else {
        KhaleesiError::masking(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::execution::SqliteJobExecutionStore;
    use crate::config::KhaleesiSettings;
    use crate::logging::structured::MemoryTransport;
    use crate::metrics::KhaleesiMetrics;
    use crate::migrations;
    use khaleesi_proto::sawmill_proto::Event;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Numbers {
        rows: Vec<i64>,
        batches: AtomicUsize,
        batch_error: Option<KhaleesiError>,
    }

    impl Numbers {
        fn new(count: i64) -> Self {
            Self {
                rows: (1..=count).collect(),
                batches: AtomicUsize::new(0),
                batch_error: None,
            }
        }
    }

    #[async_trait]
    impl BatchJob for Numbers {
        type Item = i64;

        async fn count_items(&self) -> Result<i64> {
            Ok(self.rows.len() as i64)
        }

        async fn get_page(&self, page: i64, page_size: i64) -> Result<Vec<i64>> {
            let start = ((page - 1) * page_size) as usize;
            Ok(self
                .rows
                .iter()
                .skip(start)
                .take(page_size as usize)
                .copied()
                .collect())
        }

        async fn execute_batch(&self, items: Vec<i64>) -> Result<i64> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = &self.batch_error {
                return Err(error.clone());
            }
            Ok(items.len() as i64)
        }
    }

    struct Shrinking {
        rows: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl BatchJob for Shrinking {
        type Item = i64;

        async fn count_items(&self) -> Result<i64> {
            Ok(self.rows.lock().unwrap().len() as i64)
        }

        async fn get_page(&self, _page: i64, page_size: i64) -> Result<Vec<i64>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .take(page_size as usize)
                .copied()
                .collect())
        }

        async fn execute_batch(&self, items: Vec<i64>) -> Result<i64> {
            self.rows.lock().unwrap().retain(|row| !items.contains(row));
            Ok(items.len() as i64)
        }

        fn page_policy(&self) -> PagePolicy {
            PagePolicy::FirstPage
        }
    }

    /// Delegates to sqlite, failing the steps it is told to fail.
    struct FlakyStore {
        inner: SqliteJobExecutionStore,
        fail_set_total: bool,
        fail_finish: bool,
    }

    fn store_down() -> KhaleesiError {
        KhaleesiError::internal_server(LogLevel::Error, "", "Store unavailable", "")
    }

    #[async_trait]
    impl JobExecutionStore for FlakyStore {
        async fn schedule(&self, config: &JobConfiguration) -> Result<JobExecutionRecord> {
            self.inner.schedule(config).await
        }

        async fn start(&self, job_id: &str, execution_id: &str) -> Result<JobExecutionRecord> {
            self.inner.start(job_id, execution_id).await
        }

        async fn set_total(
            &self,
            job_id: &str,
            execution_id: &str,
            total_items: i64,
        ) -> Result<JobExecutionRecord> {
            if self.fail_set_total {
                return Err(store_down());
            }
            self.inner.set_total(job_id, execution_id, total_items).await
        }

        async fn finish(
            &self,
            execution: &JobExecutionRecord,
            status: JobStatus,
            items_processed: i64,
            status_details: &str,
        ) -> Result<JobExecutionRecord> {
            if self.fail_finish {
                return Err(store_down());
            }
            self.inner
                .finish(execution, status, items_processed, status_details)
                .await
        }

        async fn in_progress(&self, job_id: &str) -> Result<Vec<JobExecutionRecord>> {
            self.inner.in_progress(job_id).await
        }

        async fn get(&self, job_id: &str, execution_id: &str) -> Result<Option<JobExecutionRecord>> {
            self.inner.get(job_id, execution_id).await
        }

        async fn get_executions(&self, execution_ids: &[String]) -> Result<Vec<JobExecutionRecord>> {
            self.inner.get_executions(execution_ids).await
        }
    }

    async fn sqlite_store(settings: &KhaleesiSettings) -> SqliteJobExecutionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::run_sqlite(&pool).await.unwrap();
        SqliteJobExecutionStore::new(pool, settings.version.clone())
    }

    fn runner_with(
        settings: Arc<KhaleesiSettings>,
        store: Arc<dyn JobExecutionStore>,
    ) -> (JobRunner, Arc<MemoryTransport>) {
        let metrics = KhaleesiMetrics::new(&settings).unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let logger = StructuredLogger::new(settings, metrics, transport.clone());
        (JobRunner::new(logger, store), transport)
    }

    async fn runner() -> (JobRunner, Arc<MemoryTransport>) {
        let settings = Arc::new(KhaleesiSettings::for_service("core", "sawmill"));
        let store = Arc::new(sqlite_store(&settings).await);
        runner_with(settings, store)
    }

    async fn flaky_runner(
        fail_set_total: bool,
        fail_finish: bool,
    ) -> (JobRunner, Arc<MemoryTransport>, Arc<FlakyStore>) {
        let settings = Arc::new(KhaleesiSettings::for_service("core", "sawmill"));
        let store = Arc::new(FlakyStore {
            inner: sqlite_store(&settings).await,
            fail_set_total,
            fail_finish,
        });
        let (runner, transport) = runner_with(settings, store.clone());
        (runner, transport, store)
    }

    fn config(execution_id: &str, timelimit: Duration) -> JobConfiguration {
        JobConfiguration {
            job_id: "job-1".to_string(),
            execution_id: execution_id.to_string(),
            action: "numbers".to_string(),
            batch_size: 2,
            timelimit,
            is_cleanup_job: false,
            cleanup_delay: Duration::ZERO,
        }
    }

    fn actions(events: &[Event]) -> Vec<(ActionType, ResultType)> {
        events
            .iter()
            .map(|event| {
                let action = event.action.as_ref().unwrap();
                (
                    ActionType::try_from(action.crud_type).unwrap(),
                    ResultType::try_from(action.result).unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_success_processes_every_page() {
        let (runner, transport) = runner().await;
        let job = Numbers::new(6);

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_secs(60)), &StopEvent::new())
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Success);
        assert_eq!(execution.items_processed, 6);
        assert_eq!(execution.total_items, Some(6));
        assert!(execution.status_details.contains("successfully"));
        assert_eq!(job.batches.load(Ordering::SeqCst), 3);
        assert_eq!(
            actions(&transport.events()),
            vec![
                (ActionType::Start, ResultType::Success),
                (ActionType::End, ResultType::Success)
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_before_execute_aborts() {
        let (runner, transport) = runner().await;
        let job = Numbers::new(6);
        let stop = StopEvent::new();
        stop.set();

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_secs(60)), &stop)
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Abort);
        assert_eq!(execution.items_processed, 0);
        assert_eq!(execution.total_items, Some(6));
        assert!(execution.status_details.contains("aborted"));
        assert_eq!(
            actions(&transport.events()),
            vec![
                (ActionType::Start, ResultType::Success),
                (ActionType::End, ResultType::Warning)
            ]
        );
    }

    #[tokio::test]
    async fn test_tiny_timelimit_times_out_after_first_batch() {
        let (runner, _) = runner().await;
        let job = Numbers::new(6);

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_nanos(1)), &StopEvent::new())
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Timeout);
        assert_eq!(execution.items_processed, 2);
    }

    #[tokio::test]
    async fn test_empty_population_succeeds() {
        let (runner, _) = runner().await;
        let job = Numbers::new(0);

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_secs(60)), &StopEvent::new())
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Success);
        assert_eq!(execution.items_processed, 0);
        assert_eq!(execution.total_items, Some(0));
    }

    #[tokio::test]
    async fn test_failing_batch_ends_in_error() {
        let (runner, transport) = runner().await;
        let mut job = Numbers::new(6);
        job.batch_error = Some(KhaleesiError::internal_server(LogLevel::Error, "", "Batch failed", ""));

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_secs(60)), &StopEvent::new())
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Error);
        let errors = transport.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].private_message, "Batch failed");
        assert_eq!(
            actions(&transport.events())[1],
            (ActionType::End, ResultType::Error)
        );
    }

    #[tokio::test]
    async fn test_first_page_policy_drains_population() {
        let (runner, _) = runner().await;
        let job = Shrinking {
            rows: Mutex::new((1..=5).collect()),
        };

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_secs(60)), &StopEvent::new())
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Success);
        assert_eq!(execution.items_processed, 5);
        assert!(job.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_execution_fails_to_start() {
        let (runner, transport) = runner().await;
        let job = Numbers::new(2);
        let config = config("exec-1", Duration::from_secs(60));

        runner.execute(&job, &config, &StopEvent::new()).await.unwrap();
        let error = runner
            .execute(&job, &config, &StopEvent::new())
            .await
            .unwrap_err();

        assert_eq!(error.kind, crate::error::ErrorKind::DbObjectTwin);
        let events = transport.events();
        assert_eq!(
            actions(&events).last(),
            Some(&(ActionType::Start, ResultType::Fatal))
        );
        let details = &events.last().unwrap().action.as_ref().unwrap().details;
        assert!(details.starts_with("Job execution \"exec-1\" for \"job-1\":"));
    }

    #[tokio::test]
    async fn test_exact_multiple_population_succeeds_despite_timelimit() {
        let (runner, transport) = runner().await;
        let job = Numbers::new(2);

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_nanos(1)), &StopEvent::new())
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Success);
        assert_eq!(execution.items_processed, 2);
        assert_eq!(job.batches.load(Ordering::SeqCst), 1);
        assert_eq!(
            actions(&transport.events()),
            vec![
                (ActionType::Start, ResultType::Success),
                (ActionType::End, ResultType::Success)
            ]
        );
    }

    #[tokio::test]
    async fn test_exact_multiple_population_is_not_aborted_after_last_page() {
        let (runner, _) = runner().await;
        let job = Numbers::new(4);

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_secs(60)), &StopEvent::new())
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Success);
        assert_eq!(execution.items_processed, 4);
        assert_eq!(job.batches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_error_is_logged_as_internal() {
        let (runner, transport) = runner().await;
        let mut job = Numbers::new(6);
        job.batch_error = Some(KhaleesiError::invalid_argument("", "Bad row", "row 3"));

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_secs(60)), &StopEvent::new())
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Error);
        let errors = transport.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status, "INTERNAL");
        assert_eq!(errors[0].public_key, "internal-server-error");
        assert!(errors[0].private_details.contains("Bad row"));
    }

    #[tokio::test]
    async fn test_failing_set_total_ends_in_fatal_error() {
        let (runner, transport, store) = flaky_runner(true, false).await;
        let job = Numbers::new(6);

        let execution = runner
            .execute(&job, &config("exec-1", Duration::from_secs(60)), &StopEvent::new())
            .await
            .unwrap();

        assert_eq!(execution.status(), JobStatus::Error);
        assert_eq!(job.batches.load(Ordering::SeqCst), 0);
        assert_eq!(transport.errors().len(), 1);
        assert_eq!(
            actions(&transport.events()).last(),
            Some(&(ActionType::End, ResultType::Fatal))
        );
        assert!(store.in_progress("job-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_finish_still_reports_end() {
        let (runner, transport, store) = flaky_runner(false, true).await;
        let job = Numbers::new(2);

        let error = runner
            .execute(&job, &config("exec-1", Duration::from_secs(60)), &StopEvent::new())
            .await
            .unwrap_err();

        assert_eq!(error.private_message, "Store unavailable");
        assert_eq!(transport.errors().len(), 1);
        assert_eq!(
            actions(&transport.events()),
            vec![
                (ActionType::Start, ResultType::Success),
                (ActionType::End, ResultType::Fatal)
            ]
        );
        assert_eq!(store.in_progress("job-1").await.unwrap().len(), 1);
    }
}
