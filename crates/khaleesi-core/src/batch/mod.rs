// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cooperative batch jobs.
//!
//! A job pages through its population and processes one page per batch. Between
//! batches the runner checks the external [`StopEvent`] and the time limit; an
//! in-flight batch is never interrupted.
//!
//! ```text
//!  SCHEDULED ──► IN_PROGRESS ──► SUCCESS | ABORT | TIMEOUT | ERROR
//!      │
//!      └──────► SKIPPED (another execution of the job is active)
//! ```

pub mod cleanup;
pub mod execution;
pub mod job;
pub mod maid;
pub mod registry;

pub use cleanup::{CleanupJob, CleanupSource};
pub use execution::{JobExecutionRecord, JobExecutionStore, SqliteJobExecutionStore};
pub use job::{BatchJob, JobRunner, PagePolicy};
pub use maid::{Broom, MaidService, NoBroom};
pub use registry::BatchJobRegistry;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use khaleesi_proto::common_proto::{JobExecution, job_execution::Status};

use crate::error::{KhaleesiError, Result};

/// Status of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Unrecognized status.
    Unknown,
    /// Created, not started.
    Scheduled,
    /// Running.
    InProgress,
    /// Every page was processed.
    Success,
    /// Not run because another execution of the job was active.
    Skipped,
    /// Stopped from outside.
    Abort,
    /// Ran out of time.
    Timeout,
    /// A batch or the count failed.
    Error,
    /// The execution could not be started.
    Fatal,
}

impl JobStatus {
    /// Upper-case name as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Scheduled => "SCHEDULED",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Skipped => "SKIPPED",
            Self::Abort => "ABORT",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }

    /// Parse a persisted name; unrecognized names are `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "SCHEDULED" => Self::Scheduled,
            "IN_PROGRESS" => Self::InProgress,
            "SUCCESS" => Self::Success,
            "SKIPPED" => Self::Skipped,
            "ABORT" => Self::Abort,
            "TIMEOUT" => Self::Timeout,
            "ERROR" => Self::Error,
            "FATAL" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// Protobuf form.
    pub fn to_proto(self) -> Status {
        Status::from_str_name(self.as_str()).unwrap_or(Status::Unknown)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated parameters of one job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfiguration {
    /// Logical job; at most one execution per job runs at a time.
    pub job_id: String,
    /// This execution.
    pub execution_id: String,
    /// What the job does.
    pub action: String,
    /// Items per batch, always positive.
    pub batch_size: i64,
    /// Wall-clock budget, always positive.
    pub timelimit: Duration,
    /// Whether the job deletes what it pages over.
    pub is_cleanup_job: bool,
    /// Minimum age of rows a cleanup job deletes.
    pub cleanup_delay: Duration,
}

impl JobConfiguration {
    /// Validate a job execution received over the wire.
    pub fn from_proto(execution: &JobExecution) -> Result<Self> {
        let action = execution.action_configuration.clone().unwrap_or_default();
        let cleanup = execution.cleanup_configuration.clone().unwrap_or_default();

        if action.batch_size <= 0 {
            return Err(invalid_field(
                "actionConfiguration.batchSize",
                action.batch_size.to_string(),
            ));
        }
        let timelimit = action
            .timelimit
            .as_ref()
            .and_then(positive_duration)
            .ok_or_else(|| {
                invalid_field(
                    "actionConfiguration.timelimit",
                    format!("{:?}", action.timelimit),
                )
            })?;
        let cleanup_delay = cleanup
            .cleanup_delay
            .as_ref()
            .and_then(|delay| Duration::try_from(delay.clone()).ok())
            .unwrap_or_default();

        Ok(Self {
            job_id: execution.job_id.clone(),
            execution_id: execution.execution_id.clone(),
            action: action.action,
            batch_size: action.batch_size,
            timelimit,
            is_cleanup_job: cleanup.is_cleanup_job,
            cleanup_delay,
        })
    }
}

fn positive_duration(duration: &prost_types::Duration) -> Option<Duration> {
    Duration::try_from(duration.clone())
        .ok()
        .filter(|duration| !duration.is_zero())
}

fn invalid_field(field: &str, value: String) -> KhaleesiError {
    KhaleesiError::invalid_argument(
        format!("{field} must be positive"),
        format!("Invalid {field}"),
        format!("{field}: {value}"),
    )
}

/// External stop signal of a running job. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct StopEvent {
    flag: Arc<AtomicBool>,
}

impl StopEvent {
    /// A fresh, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the job to stop at the next batch boundary.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khaleesi_proto::common_proto::{JobActionConfiguration, JobCleanupActionConfiguration};

    pub(crate) fn execution(batch_size: i64, timelimit_secs: i64) -> JobExecution {
        JobExecution {
            job_id: "job-1".to_string(),
            execution_id: "exec-1".to_string(),
            action_configuration: Some(JobActionConfiguration {
                action: "cleanup-events".to_string(),
                batch_size,
                timelimit: Some(prost_types::Duration {
                    seconds: timelimit_secs,
                    nanos: 0,
                }),
            }),
            cleanup_configuration: Some(JobCleanupActionConfiguration {
                is_cleanup_job: true,
                cleanup_delay: Some(prost_types::Duration {
                    seconds: 3600,
                    nanos: 0,
                }),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_configuration_from_proto() {
        let config = JobConfiguration::from_proto(&execution(2, 60)).unwrap();
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.timelimit, Duration::from_secs(60));
        assert_eq!(config.cleanup_delay, Duration::from_secs(3600));
        assert!(config.is_cleanup_job);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let error = JobConfiguration::from_proto(&execution(0, 60)).unwrap_err();
        assert_eq!(error.status, tonic::Code::InvalidArgument);
        assert!(error.public_details.contains("actionConfiguration.batchSize"));
        assert!(error.private_details.contains("actionConfiguration.batchSize"));
    }

    #[test]
    fn test_missing_timelimit_rejected() {
        let mut proto = execution(2, 60);
        if let Some(action) = proto.action_configuration.as_mut() {
            action.timelimit = None;
        }
        let error = JobConfiguration::from_proto(&proto).unwrap_err();
        assert!(error.public_details.contains("actionConfiguration.timelimit"));
        assert!(error.private_details.contains("actionConfiguration.timelimit"));

        let error = JobConfiguration::from_proto(&execution(2, 0)).unwrap_err();
        assert!(error.public_details.contains("actionConfiguration.timelimit"));
    }

    #[test]
    fn test_status_names_round_trip() {
        for status in [
            JobStatus::Scheduled,
            JobStatus::InProgress,
            JobStatus::Success,
            JobStatus::Skipped,
            JobStatus::Abort,
            JobStatus::Timeout,
            JobStatus::Error,
            JobStatus::Fatal,
        ] {
            assert_eq!(JobStatus::from_name(status.as_str()), status);
            assert_eq!(status.to_proto().as_str_name(), status.as_str());
        }
        assert_eq!(JobStatus::from_name("bogus"), JobStatus::Unknown);
    }

    #[test]
    fn test_stop_event_shared_between_clones() {
        let stop = StopEvent::new();
        let clone = stop.clone();
        assert!(!clone.is_set());
        stop.set();
        assert!(clone.is_set());
    }
}
