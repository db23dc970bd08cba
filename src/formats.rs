//! Output-format selection.
//!
//! A job selects any subset of the recognized output formats. On the job
//! document the selection is either an object of flags
//! (`{"xlsx": true, "csv": false}`) or a list of identifiers
//! (`["csv", "jsonl"]`). Formats not mentioned are off.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResolutionError;

/// Identifiers accepted in a format selection.
pub const RECOGNIZED_FORMATS: [&str; 3] = ["xlsx", "csv", "jsonl"];

/// Which output files the scan engine should write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFormats {
    pub xlsx: bool,
    pub csv: bool,
    pub jsonl: bool,
}

impl Default for OutputFormats {
    fn default() -> Self {
        Self {
            xlsx: true,
            csv: false,
            jsonl: false,
        }
    }
}

impl OutputFormats {
    /// A selection with every format off.
    pub fn none() -> Self {
        Self {
            xlsx: false,
            csv: false,
            jsonl: false,
        }
    }

    fn flag_mut(&mut self, id: &str) -> Option<&mut bool> {
        match id {
            "xlsx" => Some(&mut self.xlsx),
            "csv" => Some(&mut self.csv),
            "jsonl" => Some(&mut self.jsonl),
            _ => None,
        }
    }

    /// Parse a selection from its document representation.
    pub fn from_value(value: &Value) -> Result<Self, ResolutionError> {
        let mut formats = Self::none();
        match value {
            Value::Object(flags) => {
                for (id, enabled) in flags {
                    let flag = formats
                        .flag_mut(id)
                        .ok_or_else(|| ResolutionError::UnknownFormat(id.clone()))?;
                    *flag = enabled.as_bool().ok_or_else(|| {
                        ResolutionError::InvalidFormats(format!(
                            "flag for `{id}` must be a boolean, found {enabled}"
                        ))
                    })?;
                }
            }
            Value::Array(ids) => {
                for id in ids {
                    let id = id.as_str().ok_or_else(|| {
                        ResolutionError::InvalidFormats(format!(
                            "format identifiers must be strings, found {id}"
                        ))
                    })?;
                    let flag = formats
                        .flag_mut(id)
                        .ok_or_else(|| ResolutionError::UnknownFormat(id.to_owned()))?;
                    *flag = true;
                }
            }
            other => {
                return Err(ResolutionError::InvalidFormats(format!(
                    "expected an object or a list, found {other}"
                )));
            }
        }
        Ok(formats)
    }

    /// Identifiers of the enabled formats, in recognized order.
    pub fn enabled(&self) -> Vec<&'static str> {
        RECOGNIZED_FORMATS
            .into_iter()
            .zip([self.xlsx, self.csv, self.jsonl])
            .filter_map(|(id, on)| on.then_some(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_object_selection_replaces_default() {
        let formats = OutputFormats::from_value(&json!({ "csv": true })).unwrap();
        assert_eq!(
            formats,
            OutputFormats {
                xlsx: false,
                csv: true,
                jsonl: false
            }
        );
    }

    #[test]
    fn test_list_selection() {
        let formats = OutputFormats::from_value(&json!(["jsonl", "xlsx"])).unwrap();
        assert_eq!(formats.enabled(), vec!["xlsx", "jsonl"]);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let err = OutputFormats::from_value(&json!({ "pdf": true })).unwrap_err();
        assert_eq!(err, ResolutionError::UnknownFormat("pdf".into()));

        let err = OutputFormats::from_value(&json!(["csv", "html"])).unwrap_err();
        assert_eq!(err, ResolutionError::UnknownFormat("html".into()));
    }

    #[test]
    fn test_malformed_selection_rejected() {
        assert!(matches!(
            OutputFormats::from_value(&json!("csv")),
            Err(ResolutionError::InvalidFormats(_))
        ));
        assert!(matches!(
            OutputFormats::from_value(&json!({ "csv": "yes" })),
            Err(ResolutionError::InvalidFormats(_))
        ));
    }

    #[test]
    fn test_default_is_xlsx_only() {
        assert_eq!(OutputFormats::default().enabled(), vec!["xlsx"]);
        assert!(OutputFormats::none().enabled().is_empty());
    }
}
