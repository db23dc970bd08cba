//! Intake dispatcher.
//!
//! The [`Dispatcher`] watches the job collection and starts one
//! [`JobRunner`] per newly added `pending` document. The intake loop
//! never awaits a runner: admitting a job only spawns a task.
//!
//! ```text
//!   change feed ──► intake loop ──┬─► runner task (job a)
//!                    │            ├─► runner task (job b)
//!                    │            └─► backlog (no permit free, stays `pending`)
//!                    │
//!                    └◄── finished task frees a permit, backlog head starts
//! ```
//!
//! - `modified` and `removed` changes are ignored.
//! - A job id is admitted at most once per dispatcher, however many times
//!   the feed redelivers its `added` change. The set of admitted ids is
//!   never pruned, so its memory grows with every job the dispatcher has
//!   seen.
//! - With `max_concurrent_jobs > 0`, jobs beyond the cap wait in FIFO order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DispatchSettings, ProcessConfig};
use crate::document::{ChangeBatch, Fields};
use crate::engine::ScanEngine;
use crate::error::StoreResult;
use crate::job::{JobId, Outcome};
use crate::runner::{JobRunner, RunSummary};
use crate::store::{ChangeFeed, DocumentStore};

const SUMMARY_CHANNEL_CAPACITY: usize = 64;

type RunningJobs = Arc<Mutex<FxHashMap<JobId, CancellationToken>>>;

fn lock(running: &RunningJobs) -> MutexGuard<'_, FxHashMap<JobId, CancellationToken>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters reported when the dispatcher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Distinct pending jobs accepted from the feed.
    pub admitted: u64,
    /// Repeated `added` deliveries of an already admitted job.
    pub duplicates: u64,
    /// Admitted jobs that had to wait for a free permit.
    pub deferred: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Watches a job collection and fans jobs out to runners.
pub struct Dispatcher {
    store: Arc<dyn DocumentStore>,
    runner: JobRunner,
    settings: DispatchSettings,
    summaries: broadcast::Sender<RunSummary>,
}

impl Dispatcher {
    /// Build a dispatcher; nothing is subscribed until [`start`](Self::start).
    pub fn new(
        store: Arc<dyn DocumentStore>,
        engine: Arc<dyn ScanEngine>,
        config: Arc<ProcessConfig>,
    ) -> Self {
        let settings = config.dispatch.clone();
        let (summaries, _) = broadcast::channel(SUMMARY_CHANNEL_CAPACITY);
        Self {
            runner: JobRunner::new(store.clone(), engine, config),
            store,
            settings,
            summaries,
        }
    }

    /// Receive a [`RunSummary`] for every job that finishes.
    pub fn summaries(&self) -> broadcast::Receiver<RunSummary> {
        self.summaries.subscribe()
    }

    /// Subscribe to the collection and start the intake loop.
    pub async fn start(self) -> StoreResult<DispatcherHandle> {
        let feed = self.store.subscribe(&self.settings.collection).await?;
        info!(
            collection = %self.settings.collection,
            max_concurrent_jobs = self.settings.max_concurrent_jobs,
            "Listening for new scan jobs"
        );

        let shutdown = CancellationToken::new();
        let running: RunningJobs = Arc::default();
        let intake = Intake {
            limit: self
                .settings
                .concurrency_limit()
                .map(|n| Arc::new(Semaphore::new(n))),
            store: self.store,
            runner: self.runner,
            collection: self.settings.collection,
            summaries: self.summaries.clone(),
            running: running.clone(),
            jobs: CancellationToken::new(),
            admitted: FxHashSet::default(),
            backlog: VecDeque::new(),
            tasks: JoinSet::new(),
            stats: DispatchStats::default(),
        };
        let task = tokio::spawn(intake.run(feed, shutdown.clone()));

        Ok(DispatcherHandle {
            shutdown,
            running,
            summaries: self.summaries,
            task,
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

/// Control handle for a started [`Dispatcher`].
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: CancellationToken,
    running: RunningJobs,
    summaries: broadcast::Sender<RunSummary>,
    task: JoinHandle<DispatchStats>,
}

impl DispatcherHandle {
    /// Abort one running job. Returns `false` if it is not running.
    pub fn cancel(&self, id: &JobId) -> bool {
        match lock(&self.running).get(id) {
            Some(token) => {
                info!(job_id = %id, "Cancelling scan job");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of the jobs currently running.
    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = lock(&self.running).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Receive a [`RunSummary`] for every job that finishes from now on.
    pub fn summaries(&self) -> broadcast::Receiver<RunSummary> {
        self.summaries.subscribe()
    }

    /// Stop intake, unsubscribe, cancel running jobs and wait for them.
    ///
    /// Jobs still waiting in the backlog are left `pending`.
    pub async fn shutdown(self) -> DispatchStats {
        self.shutdown.cancel();
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Intake loop ended abnormally");
                DispatchStats::default()
            }
        }
    }
}

/// Removes a job from the running set when its task ends, even by panic.
struct RunningGuard {
    running: RunningJobs,
    id: JobId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.id);
    }
}

struct Intake {
    store: Arc<dyn DocumentStore>,
    runner: JobRunner,
    collection: String,
    summaries: broadcast::Sender<RunSummary>,
    limit: Option<Arc<Semaphore>>,
    running: RunningJobs,
    /// Parent of every job's cancellation token.
    jobs: CancellationToken,
    admitted: FxHashSet<JobId>,
    backlog: VecDeque<(JobId, Fields)>,
    tasks: JoinSet<RunSummary>,
    stats: DispatchStats,
}

impl Intake {
    async fn run(mut self, mut feed: ChangeFeed, shutdown: CancellationToken) -> DispatchStats {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down scan job listener");
                    break;
                }
                batch = feed.next() => match batch {
                    Some(Ok(batch)) => self.on_batch(batch),
                    Some(Err(e)) if e.is_transient() => {
                        warn!(error = %e, "Change feed hiccup, waiting for next batch");
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Change feed failed, stopping intake");
                        break;
                    }
                    None => {
                        info!("Change feed closed");
                        break;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_finished(joined);
                    self.start_deferred();
                }
            }
        }

        drop(feed);
        if let Err(e) = self.store.unsubscribe(&self.collection).await {
            warn!(error = %e, "Failed to unsubscribe from change feed");
        }

        let shutting_down = shutdown.is_cancelled();
        if shutting_down {
            self.jobs.cancel();
        }
        while let Some(joined) = self.tasks.join_next().await {
            self.on_finished(joined);
            if !shutting_down {
                self.start_deferred();
            }
        }

        if !self.backlog.is_empty() {
            info!(jobs = self.backlog.len(), "Leaving deferred jobs pending");
        }
        info!(
            admitted = self.stats.admitted,
            completed = self.stats.completed,
            failed = self.stats.failed,
            "Intake stopped"
        );
        self.stats
    }

    fn on_batch(&mut self, batch: ChangeBatch) {
        for change in batch {
            if !change.is_new_pending() {
                continue;
            }
            if !self.admitted.insert(change.document_id.clone()) {
                self.stats.duplicates += 1;
                debug!(job_id = %change.document_id, "Ignoring repeated delivery of admitted job");
                continue;
            }

            self.stats.admitted += 1;
            info!(job_id = %change.document_id, "New pending scan job found");
            self.admit(change.document_id, change.fields);
        }
    }

    fn admit(&mut self, id: JobId, fields: Fields) {
        let Some(limit) = &self.limit else {
            self.spawn(id, fields, None);
            return;
        };
        if self.backlog.is_empty()
            && let Ok(permit) = limit.clone().try_acquire_owned()
        {
            self.spawn(id, fields, Some(permit));
            return;
        }
        self.stats.deferred += 1;
        info!(job_id = %id, backlog = self.backlog.len() + 1, "Concurrency limit reached, job stays pending");
        self.backlog.push_back((id, fields));
    }

    fn start_deferred(&mut self) {
        let Some(limit) = self.limit.clone() else {
            return;
        };
        while !self.backlog.is_empty() {
            let Ok(permit) = limit.clone().try_acquire_owned() else {
                break;
            };
            if let Some((id, fields)) = self.backlog.pop_front() {
                debug!(job_id = %id, "Starting deferred job");
                self.spawn(id, fields, Some(permit));
            }
        }
    }

    fn spawn(&mut self, id: JobId, fields: Fields, permit: Option<OwnedSemaphorePermit>) {
        let token = self.jobs.child_token();
        lock(&self.running).insert(id.clone(), token.clone());
        let guard = RunningGuard {
            running: self.running.clone(),
            id: id.clone(),
        };
        let runner = self.runner.clone();

        self.tasks.spawn(async move {
            let _guard = guard;
            let _permit = permit;
            runner.run(id, fields, token).await
        });
    }

    fn on_finished(&mut self, joined: Result<RunSummary, JoinError>) {
        match joined {
            Ok(summary) => {
                match summary.outcome {
                    Outcome::Completed => self.stats.completed += 1,
                    Outcome::Failed => self.stats.failed += 1,
                }
                info!(
                    job_id = %summary.job_id,
                    outcome = %summary.outcome,
                    elapsed_ms = summary.duration().num_milliseconds(),
                    recorded = summary.terminal_recorded,
                    "Scan job finished"
                );
                // no receivers is fine
                let _ = self.summaries.send(summary);
            }
            Err(e) => {
                self.stats.failed += 1;
                error!(error = %e, "Scan job task aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::document::{Change, ChangeKind, logs_of, progress_of, status_of};
    use crate::engine::ScanSession;
    use crate::error::{EngineError, EngineResult};
    use crate::job::JobStatus;
    use crate::memory::MemoryStore;
    use crate::reporter::{COMPLETION_MARKER, START_MARKER};
    use crate::resolver::JobSpec;

    const COLLECTION: &str = "users/u1/scans";

    /// Scans `amount` governors; kingdom "bad" fails halfway.
    struct CountingEngine;

    #[async_trait]
    impl ScanEngine for CountingEngine {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, spec: &JobSpec, session: ScanSession) -> EngineResult<()> {
            session.state(format!("Scanning kingdom {}", spec.kingdom));
            for current in 1..=spec.amount {
                if spec.kingdom == "bad" && current * 2 > spec.amount {
                    return Err(EngineError::failed("lost connection to emulator"));
                }
                session.progress(current, spec.amount);
                session.line(format!("{} governor {current}", spec.kingdom));
                tokio::task::yield_now().await;
            }
            Ok(())
        }
    }

    /// Blocks every run until a permit is added to `gate`.
    struct GatedEngine {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl ScanEngine for GatedEngine {
        fn name(&self) -> &str {
            "gated"
        }

        async fn run(&self, _spec: &JobSpec, session: ScanSession) -> EngineResult<()> {
            tokio::select! {
                permit = self.gate.acquire() => {
                    permit.map_err(|e| EngineError::failed(e.to_string()))?.forget();
                    Ok(())
                }
                _ = session.cancelled() => Err(EngineError::Cancelled),
            }
        }
    }

    fn job(kingdom: &str, amount: u64) -> Fields {
        match json!({ "status": "pending", "mode": "seed", "kingdom": kingdom, "amount": amount }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn config(max_concurrent_jobs: usize) -> Arc<ProcessConfig> {
        let mut config = ProcessConfig::default();
        config.dispatch.collection = COLLECTION.into();
        config.dispatch.max_concurrent_jobs = max_concurrent_jobs;
        Arc::new(config)
    }

    async fn next_summary(rx: &mut broadcast::Receiver<RunSummary>) -> RunSummary {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("job did not finish in time")
            .expect("summary channel closed")
    }

    async fn wait_for_status(store: &MemoryStore, id: &str, status: JobStatus) {
        let id = JobId::new(id);
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.document(&id).and_then(|d| status_of(&d)) != Some(status) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status not reached in time");
    }

    #[tokio::test]
    async fn test_pending_job_admitted_exactly_once() {
        let store = Arc::new(MemoryStore::new(COLLECTION));
        store.insert("job-1", job("2045", 50));

        let dispatcher = Dispatcher::new(store.clone(), Arc::new(CountingEngine), config(4));
        let mut summaries = dispatcher.summaries();
        let handle = dispatcher.start().await.unwrap();

        store.deliver(vec![
            Change::added("job-1", job("2045", 50)),
            Change::added("job-1", job("2045", 50)),
        ]);

        let summary = next_summary(&mut summaries).await;
        assert_eq!(summary.job_id, JobId::new("job-1"));
        assert_eq!(summary.outcome, Outcome::Completed);

        // delivered again with its current, no longer pending, fields
        assert!(store.redeliver(&JobId::new("job-1")));
        let stats = handle.shutdown().await;
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.completed, 1);
        assert!(summaries.try_recv().is_err());

        let doc = store.document(&JobId::new("job-1")).unwrap();
        assert_eq!(status_of(&doc), Some(JobStatus::Completed));
        assert_eq!(progress_of(&doc), Some(100));

        let logs = logs_of(&doc);
        let start = logs.iter().position(|l| l == START_MARKER).unwrap();
        let done = logs.iter().position(|l| l == COMPLETION_MARKER).unwrap();
        assert!(start < done);
        assert_eq!(logs.last().map(String::as_str), Some(COMPLETION_MARKER));

        let starts = store
            .writes_for(&JobId::new("job-1"))
            .iter()
            .filter(|w| w.status == Some(JobStatus::Running))
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_ignores_non_pending_and_non_added_changes() {
        let store = Arc::new(MemoryStore::new(COLLECTION));
        let mut done = job("1", 5);
        done.insert("status".into(), json!("completed"));
        store.insert("old", done);

        let dispatcher = Dispatcher::new(store.clone(), Arc::new(CountingEngine), config(4));
        let handle = dispatcher.start().await.unwrap();

        store.deliver(vec![
            Change {
                kind: ChangeKind::Modified,
                document_id: JobId::new("m"),
                fields: job("1", 5),
            },
            Change {
                kind: ChangeKind::Removed,
                document_id: JobId::new("r"),
                fields: job("1", 5),
            },
        ]);

        let stats = handle.shutdown().await;
        assert_eq!(stats, DispatchStats::default());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_failure_of_one_job_does_not_touch_another() {
        let store = Arc::new(MemoryStore::new(COLLECTION));
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(CountingEngine), config(0));
        let mut summaries = dispatcher.summaries();
        let handle = dispatcher.start().await.unwrap();

        store.insert("good", job("2045", 20));
        store.insert("bad", job("bad", 20));

        let mut outcomes = FxHashMap::default();
        for _ in 0..2 {
            let summary = next_summary(&mut summaries).await;
            outcomes.insert(summary.job_id.clone(), summary.outcome);
        }
        assert_eq!(outcomes[&JobId::new("good")], Outcome::Completed);
        assert_eq!(outcomes[&JobId::new("bad")], Outcome::Failed);

        let good = store.document(&JobId::new("good")).unwrap();
        assert_eq!(status_of(&good), Some(JobStatus::Completed));
        assert_eq!(progress_of(&good), Some(100));
        assert!(logs_of(&good).iter().all(|l| !l.contains("bad") && !l.contains("Error")));

        let bad = store.document(&JobId::new("bad")).unwrap();
        assert_eq!(status_of(&bad), Some(JobStatus::Failed));
        assert_eq!(progress_of(&bad), Some(50));
        assert!(logs_of(&bad).contains(&"[BOT] Error: lost connection to emulator".to_string()));
        assert!(logs_of(&bad).iter().all(|l| !l.starts_with("2045 ")));

        // each document sees one start write first and one terminal write last
        for id in ["good", "bad"] {
            let writes = store.writes_for(&JobId::new(id));
            assert_eq!(writes.first().and_then(|w| w.status), Some(JobStatus::Running));
            let terminal: Vec<_> = writes
                .iter()
                .filter(|w| w.status.is_some_and(JobStatus::is_terminal))
                .collect();
            assert_eq!(terminal.len(), 1);
            assert!(writes.last().unwrap().status.is_some_and(JobStatus::is_terminal));
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_limit_defers_jobs() {
        let store = Arc::new(MemoryStore::new(COLLECTION));
        store.insert("a", job("1", 10));
        store.insert("b", job("2", 10));

        let gate = Arc::new(Semaphore::new(0));
        let engine = GatedEngine { gate: gate.clone() };
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(engine), config(1));
        let mut summaries = dispatcher.summaries();
        let handle = dispatcher.start().await.unwrap();

        wait_for_status(&store, "a", JobStatus::Running).await;
        assert_eq!(handle.running_jobs(), vec![JobId::new("a")]);
        let b = store.document(&JobId::new("b")).unwrap();
        assert_eq!(status_of(&b), Some(JobStatus::Pending));

        gate.add_permits(1);
        assert_eq!(next_summary(&mut summaries).await.job_id, JobId::new("a"));
        wait_for_status(&store, "b", JobStatus::Running).await;

        gate.add_permits(1);
        assert_eq!(next_summary(&mut summaries).await.job_id, JobId::new("b"));

        let stats = handle.shutdown().await;
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.completed, 2);
    }

    #[tokio::test]
    async fn test_operator_cancel() {
        let store = Arc::new(MemoryStore::new(COLLECTION));
        store.insert("stuck", job("1", 10));

        let engine = GatedEngine {
            gate: Arc::new(Semaphore::new(0)),
        };
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(engine), config(4));
        let mut summaries = dispatcher.summaries();
        let handle = dispatcher.start().await.unwrap();

        wait_for_status(&store, "stuck", JobStatus::Running).await;
        assert!(handle.cancel(&JobId::new("stuck")));
        assert!(!handle.cancel(&JobId::new("unknown")));

        let summary = next_summary(&mut summaries).await;
        assert_eq!(summary.outcome, Outcome::Failed);
        let doc = store.document(&JobId::new("stuck")).unwrap();
        assert!(logs_of(&doc).contains(&"[BOT] Error: scan cancelled".to_string()));
        assert!(handle.running_jobs().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes_and_fails_running_jobs() {
        let store = Arc::new(MemoryStore::new(COLLECTION));
        store.insert("a", job("1", 10));
        store.insert("b", job("2", 10));

        let engine = GatedEngine {
            gate: Arc::new(Semaphore::new(0)),
        };
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(engine), config(1));
        let handle = dispatcher.start().await.unwrap();
        wait_for_status(&store, "a", JobStatus::Running).await;
        assert_eq!(store.subscriber_count(), 1);

        let stats = handle.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(store.subscriber_count(), 0);

        let a = store.document(&JobId::new("a")).unwrap();
        assert_eq!(status_of(&a), Some(JobStatus::Failed));
        let b = store.document(&JobId::new("b")).unwrap();
        assert_eq!(status_of(&b), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn test_start_fails_for_unknown_collection() {
        let store = Arc::new(MemoryStore::new("users/other/scans"));
        let dispatcher = Dispatcher::new(store, Arc::new(CountingEngine), config(4));
        assert!(dispatcher.start().await.is_err());
    }
}
