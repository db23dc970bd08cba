//! Scan engine capability.
//!
//! The engine does the actual scanning. It reports back to the runner
//! through a [`ScanSession`]: a single ordered channel of
//! [`EngineEvent`]s, plus a cancellation token the engine should poll
//! between units of work.
//!
//! ```text
//!   engine ──StateChanged──┐
//!   engine ──ProgressUpdated──► ScanSession ──(mpsc, in order)──► runner ──► reporter
//!   engine ──LineLogged────┘
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineResult;
use crate::job::JobId;
use crate::resolver::JobSpec;

/// Notification emitted by an engine during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The engine entered a new phase (e.g. "Opening rankings").
    StateChanged(String),
    /// Governor `current` of `target` has been scanned.
    ProgressUpdated { current: u64, target: u64 },
    /// A line of engine output for the job's audit trail.
    LineLogged(String),
}

/// Per-run handle passed to [`ScanEngine::run`].
///
/// Sending never blocks, so blocking engine code may call these methods
/// directly from a `spawn_blocking` thread.
#[derive(Debug, Clone)]
pub struct ScanSession {
    job_id: JobId,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
}

impl ScanSession {
    /// Create a session and the receiver the runner drains.
    pub fn new(
        job_id: JobId,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                job_id,
                events,
                cancel,
            },
            rx,
        )
    }

    /// Job this session reports for.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Emit an event. Returns `false` once the runner stopped listening.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Emit [`EngineEvent::StateChanged`].
    pub fn state(&self, state: impl Into<String>) -> bool {
        self.emit(EngineEvent::StateChanged(state.into()))
    }

    /// Emit [`EngineEvent::ProgressUpdated`].
    pub fn progress(&self, current: u64, target: u64) -> bool {
        self.emit(EngineEvent::ProgressUpdated { current, target })
    }

    /// Emit [`EngineEvent::LineLogged`].
    pub fn line(&self, line: impl Into<String>) -> bool {
        self.emit(EngineEvent::LineLogged(line.into()))
    }

    /// Whether the run has been cancelled or timed out.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the run has been cancelled or timed out.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Drives one scan from start to finish.
///
/// # Contract
///
/// - `run()` returns once the scan is over: `Ok(())` on success, an
///   [`EngineError`](crate::error::EngineError) describing the failure otherwise.
/// - Every event must be emitted before `run()` returns; events sent
///   afterwards are dropped.
/// - The engine connects to `spec.adb_port` and collects exactly the
///   fields enabled in `spec.scan_options`.
/// - Engines shared between runners must keep per-run state inside `run()`.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run the scan described by `spec`.
    async fn run(&self, spec: &JobSpec, session: ScanSession) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_preserves_event_order() {
        let (session, mut rx) = ScanSession::new(JobId::new("j"), CancellationToken::new());
        assert!(session.state("Starting"));
        assert!(session.progress(1, 10));
        assert!(session.line("Governor 1 scanned"));
        drop(session);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                EngineEvent::StateChanged("Starting".into()),
                EngineEvent::ProgressUpdated {
                    current: 1,
                    target: 10
                },
                EngineEvent::LineLogged("Governor 1 scanned".into()),
            ]
        );
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (session, rx) = ScanSession::new(JobId::new("j"), CancellationToken::new());
        drop(rx);
        assert!(!session.line("too late"));
    }

    #[test]
    fn test_session_observes_cancellation() {
        let token = CancellationToken::new();
        let (session, _rx) = ScanSession::new(JobId::new("j"), token.clone());
        assert!(!session.is_cancelled());
        token.cancel();
        assert!(session.is_cancelled());
    }
}
