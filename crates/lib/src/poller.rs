//! Upload job polling: `submitted → polling → {completed | error | timed_out}`.
//!
//! After the backend acknowledges an upload it indexes the document in the background. The
//! poller asks `GET /api/status` on a two-tier schedule until the job settles or the attempt
//! ceiling is hit. A job only counts as completed once the query engine is ready too.
//! Transport failures are retried on the same schedule; they never fail the job by themselves.

use crate::backend::{until_deadline, Backend, BackendError, StatusResponse};
use crate::config::UploadConfig;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Used when the backend marks a job as failed without saying why.
pub const GENERIC_JOB_ERROR: &str = "document processing failed";

/// Fixed short interval for the first `slow_after` polls, then a fixed longer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub slow_interval: Duration,
    pub slow_after: u32,
    pub max_attempts: u32,
    /// Bound on each status request. A poll that hits it is a failed attempt.
    pub request_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

impl PollPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.poll_interval_ms),
            slow_interval: Duration::from_millis(config.slow_poll_interval_ms),
            slow_after: config.slow_after_attempts,
            max_attempts: config.max_attempts.max(1),
            request_timeout: Duration::from_millis(config.poll_request_timeout_ms),
        }
    }

    /// Delay before the poll that follows `attempts` completed polls.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        if attempts < self.slow_after {
            self.interval
        } else {
            self.slow_interval
        }
    }

    /// Upper bound on total time spent sleeping between polls.
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.max_attempts).map(|a| self.delay_after(a)).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Uploading,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    /// Parse a backend status string. Unknown values are `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uploading" => Some(JobStatus::Uploading),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Uploading => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// Client-side record of one document job.
#[derive(Debug, Clone)]
pub struct UploadJob {
    file_name: String,
    submitted_at: DateTime<Utc>,
    status: JobStatus,
    error: Option<String>,
    attempts: u32,
    next_poll_delay: Duration,
}

impl UploadJob {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            submitted_at: Utc::now(),
            status: JobStatus::Uploading,
            error: None,
            attempts: 0,
            next_poll_delay: Duration::ZERO,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_poll_delay(&self) -> Duration {
        self.next_poll_delay
    }

    /// Move the job forward. Returns false (and leaves the job alone) for backward moves and
    /// for any move out of a terminal status.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if next == self.status {
            return true;
        }
        if self.status.is_terminal() || next.rank() < self.status.rank() {
            log::debug!(
                "job {}: ignoring status change {:?} -> {:?}",
                self.file_name,
                self.status,
                next
            );
            return false;
        }
        self.status = next;
        true
    }
}

/// Last-known backend counters, shown to the user while waiting and on timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub query_engine_ready: bool,
    pub total_files: u32,
    pub completed_files: u32,
    pub processing_files: u32,
    pub error_files: u32,
}

impl From<&StatusResponse> for ProgressSnapshot {
    fn from(status: &StatusResponse) -> Self {
        Self {
            query_engine_ready: status.query_engine_ready,
            total_files: status.total_files,
            completed_files: status.completed_files,
            processing_files: status.processing_files,
            error_files: status.error_files,
        }
    }
}

/// Reported to the front end after every non-terminal poll.
#[derive(Debug, Clone)]
pub struct PollProgress {
    pub attempt: u32,
    pub max_attempts: u32,
    pub job_status: JobStatus,
    /// `None` when the poll failed at the transport level.
    pub snapshot: Option<ProgressSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Submitted,
    Polling,
    Completed,
    Error,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(ProgressSnapshot),
    /// The backend marked the job as failed.
    Failed(String),
    /// Attempt ceiling reached; the job may still finish server-side.
    TimedOut(Option<ProgressSnapshot>),
    /// Attempt ceiling reached and the last poll could not reach the backend.
    Unreachable(String),
    Cancelled,
}

/// Cancels polling from another task (e.g. an explicit clear or Ctrl-C).
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Drives one [`UploadJob`] to a terminal state.
#[derive(Debug)]
pub struct UploadPoller {
    job: UploadJob,
    policy: PollPolicy,
    state: PollState,
    last_snapshot: Option<ProgressSnapshot>,
}

impl UploadPoller {
    pub fn new(job: UploadJob, policy: PollPolicy) -> Self {
        Self {
            job,
            policy,
            state: PollState::Submitted,
            last_snapshot: None,
        }
    }

    pub fn job(&self) -> &UploadJob {
        &self.job
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn last_snapshot(&self) -> Option<ProgressSnapshot> {
        self.last_snapshot
    }

    /// Fold one poll result into the state machine. Returns the outcome once terminal.
    pub fn observe(
        &mut self,
        result: Result<StatusResponse, BackendError>,
    ) -> Option<PollOutcome> {
        if self.state == PollState::Submitted {
            self.state = PollState::Polling;
        }
        self.job.attempts += 1;
        let attempt = self.job.attempts;
        self.job.next_poll_delay = self.policy.delay_after(attempt);

        let transport_error = match result {
            Ok(status) => {
                let snapshot = ProgressSnapshot::from(&status);
                self.last_snapshot = Some(snapshot);
                if let Some(outcome) = self.evaluate(&status, snapshot) {
                    return Some(outcome);
                }
                None
            }
            Err(e) => {
                log::warn!(
                    "job {}: status poll {}/{} failed: {}",
                    self.job.file_name,
                    attempt,
                    self.policy.max_attempts,
                    e
                );
                Some(e.to_string())
            }
        };

        if attempt >= self.policy.max_attempts {
            log::info!(
                "job {}: giving up after {} polls",
                self.job.file_name,
                attempt
            );
            self.state = PollState::TimedOut;
            return Some(match transport_error {
                Some(error) => PollOutcome::Unreachable(error),
                None => PollOutcome::TimedOut(self.last_snapshot),
            });
        }
        None
    }

    fn evaluate(
        &mut self,
        status: &StatusResponse,
        snapshot: ProgressSnapshot,
    ) -> Option<PollOutcome> {
        let Some(detail) = status.file(&self.job.file_name) else {
            log::debug!(
                "job {}: not yet listed by backend ({} files known)",
                self.job.file_name,
                status.files_detail.len()
            );
            return None;
        };
        match JobStatus::parse(&detail.status) {
            Some(JobStatus::Error) => {
                let error = detail
                    .error
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| GENERIC_JOB_ERROR.to_string());
                if !self.job.advance(JobStatus::Error) {
                    log::warn!(
                        "job {}: ignoring error after completion: {}",
                        self.job.file_name,
                        error
                    );
                    return None;
                }
                self.job.error = Some(error.clone());
                self.state = PollState::Error;
                Some(PollOutcome::Failed(error))
            }
            Some(JobStatus::Completed) => {
                self.job.advance(JobStatus::Completed);
                if status.query_engine_ready {
                    self.state = PollState::Completed;
                    Some(PollOutcome::Completed(snapshot))
                } else {
                    log::debug!(
                        "job {}: indexed, waiting for query engine",
                        self.job.file_name
                    );
                    None
                }
            }
            Some(next) => {
                self.job.advance(next);
                None
            }
            None => {
                log::debug!(
                    "job {}: unrecognised status '{}'",
                    self.job.file_name,
                    detail.status
                );
                None
            }
        }
    }

    /// Poll until terminal, the ceiling, or cancellation. Each poll waits out the current
    /// delay first; `on_progress` is called after every non-terminal poll.
    pub async fn run<B: Backend + ?Sized>(
        mut self,
        backend: &B,
        cancel: &CancelToken,
        on_progress: &mut (dyn FnMut(&PollProgress) + Send),
    ) -> PollOutcome {
        self.state = PollState::Polling;
        self.job.advance(JobStatus::Processing);
        self.job.next_poll_delay = self.policy.delay_after(0);
        log::info!(
            "job {}: polling status (max {} attempts)",
            self.job.file_name,
            self.policy.max_attempts
        );
        loop {
            let delay = self.job.next_poll_delay;
            let request_timeout = self.policy.request_timeout;
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("job {}: polling cancelled", self.job.file_name);
                    self.state = PollState::Cancelled;
                    return PollOutcome::Cancelled;
                }
                result = async {
                    tokio::time::sleep(delay).await;
                    until_deadline(Instant::now() + request_timeout, backend.status()).await
                } => result,
            };
            let failed = result.is_err();
            if let Some(outcome) = self.observe(result) {
                return outcome;
            }
            on_progress(&PollProgress {
                attempt: self.job.attempts,
                max_attempts: self.policy.max_attempts,
                job_status: self.job.status,
                snapshot: if failed { None } else { self.last_snapshot },
            });
        }
    }
}
