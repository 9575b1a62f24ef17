// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of running batch jobs.
//!
//! Jobs run on their own tasks, each with a copy of the request state that
//! spawned it. The registry can stop them by job id or all at once, and waits for
//! them on shutdown.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::StopEvent;
use crate::state;

struct RunningJob {
    job_id: String,
    execution_id: String,
    stop: StopEvent,
    handle: JoinHandle<()>,
}

/// Tracks batch job tasks.
#[derive(Default)]
pub struct BatchJobRegistry {
    jobs: Mutex<Vec<RunningJob>>,
}

impl BatchJobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `run` as a batch job task. `run` receives the job's stop signal.
    pub fn spawn<F, Fut>(&self, job_id: &str, execution_id: &str, run: F)
    where
        F: FnOnce(StopEvent) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = StopEvent::new();
        let snapshot = state::snapshot();
        let future = run(stop.clone());
        let handle = tokio::spawn(async move { state::scope_with(&snapshot, future).await });

        info!(job_id, execution_id, "Batch job spawned");
        let mut jobs = self.lock();
        jobs.retain(|job| !job.handle.is_finished());
        jobs.push(RunningJob {
            job_id: job_id.to_string(),
            execution_id: execution_id.to_string(),
            stop,
            handle,
        });
    }

    /// Signal every running execution of `job_id`; returns how many were signaled.
    pub fn stop_job(&self, job_id: &str) -> usize {
        let jobs = self.lock();
        let mut stopped = 0;
        for job in jobs
            .iter()
            .filter(|job| job.job_id == job_id && !job.handle.is_finished())
        {
            job.stop.set();
            stopped += 1;
        }
        info!(job_id, stopped, "Batch job stop requested");
        stopped
    }

    /// Signal every running job; returns the signaled execution ids.
    pub fn stop_all_jobs(&self) -> Vec<String> {
        let jobs = self.lock();
        let stopped = jobs
            .iter()
            .filter(|job| !job.handle.is_finished())
            .map(|job| {
                job.stop.set();
                job.execution_id.clone()
            })
            .collect::<Vec<_>>();
        info!(stopped = stopped.len(), "All batch jobs stop requested");
        stopped
    }

    /// Number of jobs still running.
    pub fn running(&self) -> usize {
        self.lock()
            .iter()
            .filter(|job| !job.handle.is_finished())
            .count()
    }

    /// Wait up to `timeout` for every job to finish. Returns false on timeout.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        let handles = self
            .lock()
            .drain(..)
            .map(|job| job.handle)
            .collect::<Vec<_>>();
        if handles.is_empty() {
            return true;
        }

        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Batch job task failed");
                    }
                }
                true
            }
            Err(_) => {
                warn!(?timeout, "Batch jobs did not finish in time");
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RunningJob>> {
        // A poisoned registry still holds valid handles.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn wait_for_stop(stop: StopEvent) {
        while !stop.is_set() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_job_by_id() {
        let registry = BatchJobRegistry::new();
        registry.spawn("job-1", "exec-1", wait_for_stop);
        registry.spawn("job-2", "exec-2", wait_for_stop);

        assert_eq!(registry.stop_job("job-1"), 1);
        assert_eq!(registry.stop_job("missing"), 0);
        assert!(registry.stop_all_jobs().contains(&"exec-2".to_string()));
        assert!(registry.wait_all(Duration::from_secs(5)).await);
        assert_eq!(registry.running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_all_times_out() {
        let registry = BatchJobRegistry::new();
        registry.spawn("job-1", "exec-1", wait_for_stop);

        assert!(!registry.wait_all(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_job_inherits_request_state() {
        let registry = Arc::new(BatchJobRegistry::new());
        let seen = Arc::new(AtomicBool::new(false));

        state::scope(async {
            state::update(|s| s.request.http_request_id = "http-1".to_string());
            let seen = seen.clone();
            registry.spawn("job-1", "exec-1", move |_| async move {
                let inherited = state::current_request().http_request_id == "http-1";
                seen.store(inherited, Ordering::SeqCst);
            });
        })
        .await;

        assert!(registry.wait_all(Duration::from_secs(5)).await);
        assert!(seen.load(Ordering::SeqCst));
    }
}
