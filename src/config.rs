//! Process-wide configuration.
//!
//! [`ProcessConfig`] carries the defaults every job falls back to plus the
//! dispatcher's own settings. It is loaded once at startup, lowest to
//! highest priority:
//!
//! 1. built-in defaults
//! 2. an optional configuration file (format inferred from its extension)
//! 3. `SCANJOB__*` environment variables, `__` separating nested keys
//!    (e.g. `SCANJOB__DISPATCH__MAX_CONCURRENT_JOBS=2`)
//!
//! After loading it is shared read-only behind an `Arc`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::formats::OutputFormats;

const ENV_PREFIX: &str = "SCANJOB";

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX).separator("__")
}

/// Configuration for the whole process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub general: GeneralConfig,
    pub scan: ScanDefaults,
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Emulator debug-bridge port the scan engine connects to.
    pub adb_port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { adb_port: 5555 }
    }
}

/// Defaults for job-input fields a job document may leave out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanDefaults {
    pub kingdom_name: String,
    pub people_to_scan: u64,
    pub resume: bool,
    pub advanced_scroll: bool,
    pub track_inactives: bool,
    pub validate_kills: bool,
    pub reconstruct_kills: bool,
    pub validate_power: bool,
    pub power_threshold: u64,
    pub timings: Timings,
    pub formats: OutputFormats,
}

impl Default for ScanDefaults {
    fn default() -> Self {
        Self {
            kingdom_name: String::new(),
            people_to_scan: 300,
            resume: false,
            advanced_scroll: true,
            track_inactives: false,
            validate_kills: true,
            reconstruct_kills: true,
            validate_power: false,
            power_threshold: 100_000,
            timings: Timings::default(),
            formats: OutputFormats::default(),
        }
    }
}

/// Screen timings in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Wait before closing the governor info panel.
    pub info_close: f64,
    /// Wait before closing the governor profile.
    pub gov_close: f64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            info_close: 0.5,
            gov_close: 1.0,
        }
    }
}

/// Settings for intake and run supervision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Path of the watched job collection.
    pub collection: String,
    /// Cap on simultaneously running jobs; `0` means unbounded.
    pub max_concurrent_jobs: usize,
    /// Abort a scan that runs longer than this.
    pub job_timeout_secs: Option<u64>,
    /// Attempts for the final status write of a job.
    pub terminal_write_attempts: u32,
    pub terminal_retry_delay_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            collection: "scans".into(),
            max_concurrent_jobs: 4,
            job_timeout_secs: None,
            terminal_write_attempts: 3,
            terminal_retry_delay_ms: 500,
        }
    }
}

impl DispatchSettings {
    /// Collection holding the scan jobs submitted by one user.
    pub fn user_collection(user_id: &str) -> String {
        format!("users/{user_id}/scans")
    }

    /// Per-job timeout, if any.
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    /// Pause between terminal write attempts.
    pub fn terminal_retry_delay(&self) -> Duration {
        Duration::from_millis(self.terminal_retry_delay_ms)
    }

    /// `None` when admission is unbounded.
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrent_jobs > 0).then_some(self.max_concurrent_jobs)
    }
}

impl ProcessConfig {
    /// Load configuration from `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, environment())
    }

    fn load_from(path: Option<&Path>, env: ::config::Environment) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(env);

        let config: ProcessConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.adb_port == 0 {
            return Err(ConfigError::Invalid("general.adb_port must be non-zero".into()));
        }

        let timings = [
            ("scan.timings.info_close", self.scan.timings.info_close),
            ("scan.timings.gov_close", self.scan.timings.gov_close),
        ];
        for (key, secs) in timings {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be a non-negative number of seconds, got {secs}"
                )));
            }
        }

        let segments: Vec<&str> = self.dispatch.collection.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) || segments.len() % 2 == 0 {
            return Err(ConfigError::Invalid(format!(
                "dispatch.collection `{}` is not a collection path",
                self.dispatch.collection
            )));
        }

        if self.dispatch.terminal_write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.terminal_write_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
