//! Dispatch scan jobs against the in-memory store.
//!
//! A simulated engine stands in for the real scanner: it walks through a
//! few phases and "scans" governors with a short delay each. Three jobs
//! are submitted; the last one has an unknown output format and fails
//! before reaching the engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scanjob::document::{logs_of, progress_of, status_of};
use scanjob::error::EngineResult;
use scanjob::{
    DispatchSettings, Dispatcher, EngineError, Fields, JobId, JobSpec, MemoryStore,
    ProcessConfig, ScanEngine, ScanSession, telemetry,
};
use serde_json::json;

/// Pretends to scan `spec.amount` governors.
struct SimulatedEngine;

#[async_trait]
impl ScanEngine for SimulatedEngine {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn run(&self, spec: &JobSpec, session: ScanSession) -> EngineResult<()> {
        session.state("Connecting to emulator");
        session.line(format!("Connected on port {}", spec.adb_port));
        session.state("Opening power rankings");

        let fields: Vec<_> = spec.scan_options.enabled().map(|f| f.key()).collect();
        session.line(format!("Collecting: {}", fields.join(", ")));

        for current in 1..=spec.amount {
            if session.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            session.progress(current, spec.amount);
        }

        session.line(format!("Wrote {}", spec.formats.enabled().join(", ")));
        Ok(())
    }
}

fn job(value: serde_json::Value) -> Fields {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Fields::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init(telemetry::DEFAULT_DIRECTIVE)?;

    let mut config = ProcessConfig::load(None)?;
    config.dispatch.collection = DispatchSettings::user_collection("demo-user");
    config.dispatch.max_concurrent_jobs = 2;
    let config = Arc::new(config);

    let store = Arc::new(MemoryStore::new(config.dispatch.collection.clone()));
    let dispatcher = Dispatcher::new(store.clone(), Arc::new(SimulatedEngine), config);
    let mut summaries = dispatcher.summaries();
    let handle = dispatcher.start().await?;

    store.insert(
        "seed-scan",
        job(json!({ "status": "pending", "mode": "seed", "kingdom": "2045", "amount": 10 })),
    );
    store.insert(
        "full-scan",
        job(json!({
            "status": "pending",
            "amount": 5,
            "scanOptions": { "Helps": false },
            "formats": ["csv", "jsonl"]
        })),
    );
    store.insert(
        "bad-formats",
        job(json!({ "status": "pending", "formats": { "pdf": true } })),
    );

    for _ in 0..3 {
        let summary = summaries.recv().await?;
        println!(
            "{}: {} in {}ms",
            summary.job_id,
            summary.outcome,
            summary.duration().num_milliseconds()
        );
    }

    let stats = handle.shutdown().await;
    println!();
    println!("Admitted: {}  Deferred: {}", stats.admitted, stats.deferred);
    println!("Completed: {}  Failed: {}", stats.completed, stats.failed);

    for id in ["seed-scan", "full-scan", "bad-formats"] {
        let Some(doc) = store.document(&JobId::new(id)) else {
            continue;
        };
        println!();
        println!(
            "{id} [{}] {}%",
            status_of(&doc).map(|s| s.to_string()).unwrap_or_default(),
            progress_of(&doc).unwrap_or(0)
        );
        for line in logs_of(&doc) {
            println!("  {line}");
        }
    }

    Ok(())
}
