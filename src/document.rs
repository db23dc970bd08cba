//! Job document schema and change-feed types.
//!
//! A job document is a flat map of JSON fields. This core writes only
//! `status`, `progress` and `logs`; everything else is job input and is
//! read-only here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::{JobId, JobStatus};

/// Raw field values of a job document.
pub type Fields = Map<String, Value>;

/// Wire keys of the job document.
pub mod field {
    pub const STATUS: &str = "status";
    pub const PROGRESS: &str = "progress";
    pub const LOGS: &str = "logs";

    pub const ADB_PORT: &str = "adbPort";
    pub const KINGDOM: &str = "kingdom";
    pub const AMOUNT: &str = "amount";
    pub const MODE: &str = "mode";
    pub const SCAN_OPTIONS: &str = "scanOptions";
    pub const RESUME: &str = "resume";
    pub const ADVANCED_SCROLL: &str = "advancedScroll";
    pub const TRACK_INACTIVES: &str = "trackInactives";
    pub const VALIDATE_KILLS: &str = "validateKills";
    pub const RECONSTRUCT_KILLS: &str = "reconstructKills";
    pub const VALIDATE_POWER: &str = "validatePower";
    pub const POWER_THRESHOLD: &str = "powerThreshold";
    pub const INFO_TIME: &str = "infoTime";
    pub const GOV_TIME: &str = "govTime";
    pub const FORMATS: &str = "formats";
}

/// Read the `status` field, if it holds a recognized value.
pub fn status_of(fields: &Fields) -> Option<JobStatus> {
    fields
        .get(field::STATUS)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

/// Read the `progress` field.
pub fn progress_of(fields: &Fields) -> Option<u8> {
    fields
        .get(field::PROGRESS)
        .and_then(Value::as_u64)
        .and_then(|p| u8::try_from(p).ok())
}

/// Read the `logs` field; missing or malformed entries are skipped.
pub fn logs_of(fields: &Fields) -> Vec<String> {
    fields
        .get(field::LOGS)
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(|l| l.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

/// A partial mutation of the writable fields of a job document.
///
/// `append_logs` has array-union semantics: a line already present in
/// the document is not duplicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append_logs: Vec<String>,
}

impl FieldUpdate {
    /// An update that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `status`.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set `progress`.
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Append one log line.
    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.append_logs.push(line.into());
        self
    }

    /// Merge this update into a document's fields.
    pub fn apply_to(&self, fields: &mut Fields) {
        if let Some(status) = self.status {
            fields.insert(field::STATUS.into(), Value::from(status.as_str()));
        }
        if let Some(progress) = self.progress {
            fields.insert(field::PROGRESS.into(), Value::from(progress));
        }
        if !self.append_logs.is_empty() {
            let logs = fields
                .entry(field::LOGS)
                .or_insert_with(|| Value::Array(Vec::new()));
            if !logs.is_array() {
                *logs = Value::Array(Vec::new());
            }
            if let Value::Array(lines) = logs {
                for line in &self.append_logs {
                    let line = Value::from(line.as_str());
                    if !lines.contains(&line) {
                        lines.push(line);
                    }
                }
            }
        }
    }
}

/// Kind of change delivered by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document change as delivered by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub document_id: JobId,
    /// Field values at the time of the change.
    pub fields: Fields,
}

impl Change {
    /// An `added` change carrying the document's current fields.
    pub fn added(document_id: impl Into<JobId>, fields: Fields) -> Self {
        Self {
            kind: ChangeKind::Added,
            document_id: document_id.into(),
            fields,
        }
    }

    /// An `added` change whose document is still `pending`.
    pub fn is_new_pending(&self) -> bool {
        self.kind == ChangeKind::Added && status_of(&self.fields) == Some(JobStatus::Pending)
    }
}

/// Ordered batch of changes delivered together.
pub type ChangeBatch = Vec<Change>;
