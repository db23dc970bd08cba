//! Job lifecycle reporter.
//!
//! A [`LifecycleReporter`] is bound to one job document and is the only
//! writer of its `status`, `progress` and `logs` fields while the job runs.
//! Every call is exactly one `update_fields` mutation; nothing is buffered,
//! so the remote document is always what dashboards watching the job see.
//!
//! Writes are best-effort except the terminal one: a lost progress update
//! is logged and forgotten, a failed terminal write is retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::DispatchSettings;
use crate::document::{FieldUpdate, status_of};
use crate::error::{StoreError, StoreResult};
use crate::job::{JobId, JobStatus, Outcome};
use crate::store::DocumentStore;

/// Log line written when a runner claims a job.
pub const START_MARKER: &str = "[BOT] Job received. Starting scanner...";

/// Log line written when the scan engine returns successfully.
pub const COMPLETION_MARKER: &str = "[BOT] Scan completed successfully.";

/// Prefix of engine phase transitions in the job log.
pub const STATE_PREFIX: &str = "[STATE]";

/// Log line recording why a job failed.
pub fn error_line(err: impl std::fmt::Display) -> String {
    format!("[BOT] Error: {err}")
}

/// Integer percentage `floor(current / target * 100)`, capped at 100.
///
/// Returns `None` when `target` is zero.
pub fn percent(current: u64, target: u64) -> Option<u8> {
    if target == 0 {
        return None;
    }
    let pct = (u128::from(current) * 100 / u128::from(target)).min(100);
    Some(pct as u8)
}

/// Single writer of a job document's mutable fields.
pub struct LifecycleReporter {
    store: Arc<dyn DocumentStore>,
    job_id: JobId,
    terminal_attempts: u32,
    retry_delay: Duration,
    progress: AtomicU8,
    terminal: AtomicBool,
}

impl LifecycleReporter {
    /// Reporter for `job_id` with the default terminal retry policy.
    pub fn new(store: Arc<dyn DocumentStore>, job_id: JobId) -> Self {
        let defaults = DispatchSettings::default();
        Self {
            store,
            job_id,
            terminal_attempts: defaults.terminal_write_attempts,
            retry_delay: defaults.terminal_retry_delay(),
            progress: AtomicU8::new(0),
            terminal: AtomicBool::new(false),
        }
    }

    /// Retry policy for the terminal write.
    pub fn with_terminal_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.terminal_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Job this reporter writes to.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Last progress value this reporter wrote.
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    async fn write(&self, what: &'static str, update: FieldUpdate) -> StoreResult<()> {
        let result = self.store.update_fields(&self.job_id, update).await;
        if let Err(e) = &result {
            warn!(job_id = %self.job_id, error = %e, "Failed to write job {what}");
        }
        result
    }

    /// Mark the job running with progress reset to 0.
    pub async fn report_started(&self) {
        self.progress.store(0, Ordering::SeqCst);
        info!(job_id = %self.job_id, "{START_MARKER}");
        let update = FieldUpdate::new()
            .with_status(JobStatus::Running)
            .with_progress(0)
            .with_log(START_MARKER);
        let _ = self.write("start", update).await;
    }

    /// Append one line to the job log and mirror it to the console.
    pub async fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!(job_id = %self.job_id, "{message}");
        let _ = self.write("log", FieldUpdate::new().with_log(message)).await;
    }

    /// Record that `current` of `target` units are done.
    ///
    /// A zero `target` and values below the last written progress are
    /// ignored.
    pub async fn report_progress(&self, current: u64, target: u64) {
        let Some(pct) = percent(current, target) else {
            debug!(job_id = %self.job_id, current, "Ignoring progress with zero target");
            return;
        };
        let previous = self.progress.fetch_max(pct, Ordering::SeqCst);
        if pct < previous {
            debug!(job_id = %self.job_id, pct, previous, "Ignoring regressing progress");
            return;
        }
        let _ = self
            .write("progress", FieldUpdate::new().with_progress(pct))
            .await;
    }

    /// Move the job to its terminal status.
    ///
    /// Returns `Ok(false)` without writing if the job is already terminal,
    /// either by an earlier call on this reporter or on the document itself.
    /// Transient store errors are retried; any other error is returned at once.
    pub async fn report_terminal(&self, outcome: Outcome) -> StoreResult<bool> {
        if self.terminal.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let target = outcome.status();
        match self.store.fetch(&self.job_id).await {
            Ok(fields) => match status_of(&fields) {
                Some(current) if current.is_terminal() => {
                    debug!(job_id = %self.job_id, %current, "Job already terminal");
                    self.terminal.store(true, Ordering::SeqCst);
                    return Ok(false);
                }
                Some(current) if !current.can_transition_to(target) => {
                    // start write was lost; record the outcome anyway
                    warn!(job_id = %self.job_id, %current, %target, "Job status skipped a step");
                }
                _ => {}
            },
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Could not read job status before terminal write");
            }
        }

        let mut update = FieldUpdate::new().with_status(target);
        if outcome.is_success() {
            update = update.with_progress(100);
        }

        let mut last_error: Option<StoreError> = None;
        for attempt in 1..=self.terminal_attempts {
            match self.store.update_fields(&self.job_id, update.clone()).await {
                Ok(()) => {
                    self.terminal.store(true, Ordering::SeqCst);
                    if outcome.is_success() {
                        self.progress.store(100, Ordering::SeqCst);
                    }
                    info!(job_id = %self.job_id, %outcome, "Job reached terminal status");
                    return Ok(true);
                }
                Err(e) => {
                    warn!(
                        job_id = %self.job_id,
                        attempt,
                        attempts = self.terminal_attempts,
                        error = %e,
                        "Terminal status write failed"
                    );
                    if !e.is_transient() {
                        last_error = Some(e);
                        break;
                    }
                    last_error = Some(e);
                    if attempt < self.terminal_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| StoreError::Rejected("no write attempted".into()));
        error!(job_id = %self.job_id, %outcome, error = %err, "Giving up on terminal status write");
        Err(err)
    }
}

impl std::fmt::Debug for LifecycleReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleReporter")
            .field("job_id", &self.job_id)
            .field("progress", &self.progress())
            .field("terminal", &self.terminal.load(Ordering::SeqCst))
            .finish()
    }
}
