//! Job configuration resolution.
//!
//! [`resolve`] turns the raw fields of a job document into a [`JobSpec`]:
//! each field present on the document is coerced to its expected type,
//! each absent (or `null`) field falls back to the process defaults. The
//! first field that cannot be coerced fails the whole resolution; no
//! partial spec is ever produced.

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

use crate::config::ProcessConfig;
use crate::document::{Fields, field};
use crate::error::ResolutionError;
use crate::formats::OutputFormats;
use crate::options::{ScanField, ScanMode, ScanOptionSet, build_options};

/// Fully resolved configuration for one scan run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
    pub adb_port: u16,
    /// Kingdom to scan; empty means the one the emulator is currently in.
    pub kingdom: String,
    /// Number of governors to scan.
    pub amount: u64,
    pub mode: ScanMode,
    pub scan_options: ScanOptionSet,
    pub resume: bool,
    pub advanced_scroll: bool,
    pub track_inactives: bool,
    pub validate_kills: bool,
    pub reconstruct_kills: bool,
    pub validate_power: bool,
    pub power_threshold: u64,
    /// Seconds.
    pub info_close: f64,
    /// Seconds.
    pub gov_close: f64,
    pub formats: OutputFormats,
}

/// Resolve a job's configuration from process defaults and document fields.
pub fn resolve(defaults: &ProcessConfig, fields: &Fields) -> Result<JobSpec, ResolutionError> {
    let scan = &defaults.scan;

    let mode = match lookup(fields, field::MODE) {
        Some(Value::String(mode)) => ScanMode::from_mode(mode),
        Some(other) => return Err(invalid(field::MODE, "a string", other)),
        None => ScanMode::Full,
    };
    let overrides = lookup(fields, field::SCAN_OPTIONS)
        .map(scan_option_overrides)
        .transpose()?;
    let scan_options = build_options(mode_name(mode), overrides.as_ref());

    let formats = match lookup(fields, field::FORMATS) {
        Some(value) => OutputFormats::from_value(value)?,
        None => scan.formats,
    };

    Ok(JobSpec {
        adb_port: port(fields, field::ADB_PORT, defaults.general.adb_port)?,
        kingdom: string(fields, field::KINGDOM, &scan.kingdom_name)?,
        amount: unsigned(fields, field::AMOUNT, scan.people_to_scan)?,
        mode,
        scan_options,
        resume: boolean(fields, field::RESUME, scan.resume)?,
        advanced_scroll: boolean(fields, field::ADVANCED_SCROLL, scan.advanced_scroll)?,
        track_inactives: boolean(fields, field::TRACK_INACTIVES, scan.track_inactives)?,
        validate_kills: boolean(fields, field::VALIDATE_KILLS, scan.validate_kills)?,
        reconstruct_kills: boolean(fields, field::RECONSTRUCT_KILLS, scan.reconstruct_kills)?,
        validate_power: boolean(fields, field::VALIDATE_POWER, scan.validate_power)?,
        power_threshold: unsigned(fields, field::POWER_THRESHOLD, scan.power_threshold)?,
        info_close: seconds(fields, field::INFO_TIME, scan.timings.info_close)?,
        gov_close: seconds(fields, field::GOV_TIME, scan.timings.gov_close)?,
        formats,
    })
}

fn mode_name(mode: ScanMode) -> &'static str {
    match mode {
        ScanMode::Full => "full",
        ScanMode::Seed => "seed",
    }
}

fn lookup<'a>(fields: &'a Fields, key: &str) -> Option<&'a Value> {
    fields.get(key).filter(|v| !v.is_null())
}

fn invalid(field: &'static str, expected: &'static str, found: &Value) -> ResolutionError {
    ResolutionError::InvalidField {
        field,
        expected,
        found: found.to_string(),
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn unsigned(fields: &Fields, key: &'static str, default: u64) -> Result<u64, ResolutionError> {
    match lookup(fields, key) {
        Some(value) => as_u64(value).ok_or_else(|| invalid(key, "a non-negative integer", value)),
        None => Ok(default),
    }
}

fn port(fields: &Fields, key: &'static str, default: u16) -> Result<u16, ResolutionError> {
    match lookup(fields, key) {
        Some(value) => as_u64(value)
            .and_then(|p| u16::try_from(p).ok())
            .filter(|&p| p != 0)
            .ok_or_else(|| invalid(key, "a port number between 1 and 65535", value)),
        None => Ok(default),
    }
}

fn boolean(fields: &Fields, key: &'static str, default: bool) -> Result<bool, ResolutionError> {
    match lookup(fields, key) {
        Some(value) => as_bool(value).ok_or_else(|| invalid(key, "a boolean", value)),
        None => Ok(default),
    }
}

fn seconds(fields: &Fields, key: &'static str, default: f64) -> Result<f64, ResolutionError> {
    let Some(value) = lookup(fields, key) else {
        return Ok(default);
    };
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    secs.filter(|s| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| invalid(key, "a non-negative number of seconds", value))
}

fn string(fields: &Fields, key: &'static str, default: &str) -> Result<String, ResolutionError> {
    match lookup(fields, key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(invalid(key, "a string", other)),
        None => Ok(default.to_owned()),
    }
}

/// Flags for known fields are coerced; unknown keys are dropped unread.
fn scan_option_overrides(value: &Value) -> Result<FxHashMap<String, bool>, ResolutionError> {
    let Value::Object(map) = value else {
        return Err(invalid(field::SCAN_OPTIONS, "an object of boolean flags", value));
    };
    map.iter()
        .filter(|(key, _)| ScanField::from_key(key).is_some())
        .map(|(key, flag)| {
            as_bool(flag)
                .map(|b| (key.clone(), b))
                .ok_or_else(|| invalid(field::SCAN_OPTIONS, "an object of boolean flags", value))
        })
        .collect()
}
