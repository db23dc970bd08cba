//! Job runner.
//!
//! A [`JobRunner`] owns the end-to-end execution of one job:
//!
//! ```text
//!   Intake ──→ Resolving ──→ Running ──→ Completed
//!                  │            │
//!                  └────────────┴──→ Failed
//! ```
//!
//! Nothing a job does escapes [`JobRunner::run`]: resolution errors,
//! engine errors, engine panics, cancellation and timeouts all end as a
//! `failed` document with the reason in its log, and a [`RunSummary`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProcessConfig;
use crate::document::Fields;
use crate::engine::{EngineEvent, ScanEngine, ScanSession};
use crate::error::{EngineError, EngineResult, JobError};
use crate::job::{JobId, Outcome};
use crate::reporter::{COMPLETION_MARKER, LifecycleReporter, STATE_PREFIX, error_line};
use crate::resolver::{JobSpec, resolve};
use crate::store::DocumentStore;

/// What happened to one job.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub job_id: JobId,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Why the job failed, if it did.
    pub error: Option<JobError>,
    /// Whether the terminal status reached the document.
    pub terminal_recorded: bool,
}

impl RunSummary {
    /// Wall-clock time from start to terminal write.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Executes jobs against a store and a scan engine.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn DocumentStore>,
    engine: Arc<dyn ScanEngine>,
    config: Arc<ProcessConfig>,
}

impl JobRunner {
    /// Runner sharing `store`, `engine` and `config` across jobs.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        engine: Arc<dyn ScanEngine>,
        config: Arc<ProcessConfig>,
    ) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    /// Run one job to its terminal status.
    ///
    /// `fields` are the document's values as delivered by the change feed.
    /// Cancelling `cancel` aborts the scan and fails the job.
    pub async fn run(&self, job_id: JobId, fields: Fields, cancel: CancellationToken) -> RunSummary {
        let started_at = Utc::now();
        let settings = &self.config.dispatch;
        let reporter = LifecycleReporter::new(self.store.clone(), job_id.clone())
            .with_terminal_retry(
                settings.terminal_write_attempts,
                settings.terminal_retry_delay(),
            );

        reporter.report_started().await;

        let result = self.execute(&reporter, &fields, cancel).await;
        let outcome = match &result {
            Ok(()) => {
                reporter.log(COMPLETION_MARKER).await;
                Outcome::Completed
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Scan job failed");
                reporter.log(error_line(e)).await;
                Outcome::Failed
            }
        };

        let terminal_recorded = reporter.report_terminal(outcome).await.is_ok();

        RunSummary {
            job_id,
            outcome,
            started_at,
            finished_at: Utc::now(),
            error: result.err(),
            terminal_recorded,
        }
    }

    async fn execute(
        &self,
        reporter: &LifecycleReporter,
        fields: &Fields,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        let spec = resolve(&self.config, fields)?;
        info!(
            job_id = %reporter.job_id(),
            engine = self.engine.name(),
            kingdom = %spec.kingdom,
            amount = spec.amount,
            mode = ?spec.mode,
            "Resolved scan job"
        );

        self.run_engine(reporter, spec, cancel).await?;
        Ok(())
    }

    /// Run the engine on its own task while draining its events in order.
    async fn run_engine(
        &self,
        reporter: &LifecycleReporter,
        spec: JobSpec,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let run_token = cancel.child_token();
        let (session, mut events) = ScanSession::new(reporter.job_id().clone(), run_token.clone());

        let engine = self.engine.clone();
        let mut task = tokio::spawn(async move { engine.run(&spec, session).await });

        let timeout = self.config.dispatch.job_timeout();
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => handle_event(reporter, event).await,
                joined = &mut task => break flatten(joined),
                _ = cancel.cancelled() => {
                    task.abort();
                    break Err(EngineError::Cancelled);
                }
                _ = &mut deadline => {
                    run_token.cancel();
                    task.abort();
                    break Err(EngineError::TimedOut(timeout.unwrap_or(Duration::ZERO)));
                }
            }
        };

        drain(reporter, &mut events).await;
        result
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("engine", &self.engine.name())
            .finish_non_exhaustive()
    }
}

async fn handle_event(reporter: &LifecycleReporter, event: EngineEvent) {
    match event {
        EngineEvent::StateChanged(state) => reporter.log(format!("{STATE_PREFIX} {state}")).await,
        EngineEvent::ProgressUpdated { current, target } => {
            reporter.report_progress(current, target).await
        }
        EngineEvent::LineLogged(line) => reporter.log(line).await,
    }
}

/// Handle events the engine queued before it returned.
async fn drain(reporter: &LifecycleReporter, events: &mut mpsc::UnboundedReceiver<EngineEvent>) {
    while let Ok(event) = events.try_recv() {
        handle_event(reporter, event).await;
    }
}

fn flatten(joined: Result<EngineResult<()>, JoinError>) -> EngineResult<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".into());
            Err(EngineError::Panicked(msg))
        }
        Err(e) => {
            warn!(error = %e, "Scan engine task ended without a result");
            Err(EngineError::Cancelled)
        }
    }
}
