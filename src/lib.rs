//! Scan-job intake and lifecycle reporting.
//!
//! This crate turns "a new job document appeared" into "a scan ran, with
//! its status and progress reflected back onto that document". It sits
//! between two capabilities it does not implement:
//!
//! - a [`DocumentStore`]: a remote collection of job documents with a
//!   change feed (an in-process [`MemoryStore`] is included), and
//! - a [`ScanEngine`]: the thing that actually drives the game client.
//!
//! # Overview
//!
//! - [`resolve`] merges [`ProcessConfig`] defaults with a document's fields
//!   into a [`JobSpec`]
//! - [`build_options`] derives the [`ScanOptionSet`] of fields to collect
//! - [`LifecycleReporter`] is the only writer of a running job's document
//! - [`JobRunner`] runs one job and maps its result onto a terminal status
//! - [`Dispatcher`] watches the collection and fans jobs out to runners
//!
//! # Lifecycle
//!
//! ```text
//!   change feed ──→ Dispatcher ──→ JobRunner ──→ resolve() ──→ ScanEngine::run()
//!   (added,            (spawn,      (per job)     build_options()      │
//!    pending)           no wait)        │                              │ events
//!                                       └──── LifecycleReporter ◄──────┘
//!                                                   │
//!                                                   ▼
//!                                  status / progress / logs on the document
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use scanjob::{Dispatcher, MemoryStore, ProcessConfig};
//!
//! let config = Arc::new(ProcessConfig::load(None)?);
//! let store = Arc::new(MemoryStore::new(config.dispatch.collection.clone()));
//! let handle = Dispatcher::new(store, Arc::new(MyEngine), config).start().await?;
//! // ...
//! let stats = handle.shutdown().await;
//! ```

pub mod config;
pub mod dispatcher;
pub mod document;
pub mod engine;
pub mod error;
pub mod formats;
pub mod job;
pub mod memory;
pub mod options;
pub mod reporter;
pub mod resolver;
pub mod runner;
pub mod store;
pub mod telemetry;

pub use crate::config::{DispatchSettings, ProcessConfig};
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherHandle};
pub use document::{Change, ChangeBatch, ChangeKind, FieldUpdate, Fields};
pub use engine::{EngineEvent, ScanEngine, ScanSession};
pub use error::{ConfigError, EngineError, JobError, ResolutionError, StoreError};
pub use formats::OutputFormats;
pub use job::{JobId, JobStatus, Outcome};
pub use memory::MemoryStore;
pub use options::{ScanField, ScanMode, ScanOptionSet, build_options};
pub use reporter::LifecycleReporter;
pub use resolver::{JobSpec, resolve};
pub use runner::{JobRunner, RunSummary};
pub use store::{ChangeFeed, DocumentStore};
