//! Scan option sets.
//!
//! A [`ScanOptionSet`] tells the scan engine which governor attributes to
//! collect. The key set is fixed: every set holds exactly one flag per
//! [`ScanField`], whatever profile or overrides produced it.
//!
//! | Profile | Enabled fields |
//! |---------|----------------|
//! | `full` | all |
//! | `seed` | ID, Name, Power, Killpoints, Alliance |

use rustc_hash::FxHashMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// A governor attribute the scan engine can collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScanField {
    Id,
    Name,
    Power,
    Killpoints,
    Alliance,
    T1Kills,
    T2Kills,
    T3Kills,
    T4Kills,
    T5Kills,
    Ranged,
    Deads,
    RssAssistance,
    RssGathered,
    Helps,
}

impl ScanField {
    /// Every field, in engine order.
    pub const ALL: [ScanField; 15] = [
        ScanField::Id,
        ScanField::Name,
        ScanField::Power,
        ScanField::Killpoints,
        ScanField::Alliance,
        ScanField::T1Kills,
        ScanField::T2Kills,
        ScanField::T3Kills,
        ScanField::T4Kills,
        ScanField::T5Kills,
        ScanField::Ranged,
        ScanField::Deads,
        ScanField::RssAssistance,
        ScanField::RssGathered,
        ScanField::Helps,
    ];

    /// Key used in `scanOptions` overrides and in the engine's option map.
    pub fn key(self) -> &'static str {
        match self {
            ScanField::Id => "ID",
            ScanField::Name => "Name",
            ScanField::Power => "Power",
            ScanField::Killpoints => "Killpoints",
            ScanField::Alliance => "Alliance",
            ScanField::T1Kills => "T1 Kills",
            ScanField::T2Kills => "T2 Kills",
            ScanField::T3Kills => "T3 Kills",
            ScanField::T4Kills => "T4 Kills",
            ScanField::T5Kills => "T5 Kills",
            ScanField::Ranged => "Ranged",
            ScanField::Deads => "Deads",
            ScanField::RssAssistance => "Rss Assistance",
            ScanField::RssGathered => "Rss Gathered",
            ScanField::Helps => "Helps",
        }
    }

    /// Field for a wire key, if it is one of the fixed set.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }

    /// Whether the `seed` profile collects this field.
    pub fn in_seed_profile(self) -> bool {
        matches!(
            self,
            ScanField::Id
                | ScanField::Name
                | ScanField::Power
                | ScanField::Killpoints
                | ScanField::Alliance
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for ScanField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Built-in profile a job starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Full,
    Seed,
}

impl ScanMode {
    /// `"seed"` selects the seed profile; anything else is a full scan.
    pub fn from_mode(mode: &str) -> Self {
        if mode == "seed" {
            ScanMode::Seed
        } else {
            ScanMode::Full
        }
    }
}

/// Fixed-key map from [`ScanField`] to a "collect this field" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptionSet {
    flags: [bool; ScanField::ALL.len()],
}

impl ScanOptionSet {
    /// Every field enabled.
    pub fn full() -> Self {
        Self {
            flags: [true; ScanField::ALL.len()],
        }
    }

    /// Only identity, name, power, killpoints and alliance enabled.
    pub fn seed() -> Self {
        let mut set = Self {
            flags: [false; ScanField::ALL.len()],
        };
        for field in ScanField::ALL {
            set.set(field, field.in_seed_profile());
        }
        set
    }

    /// Built-in profile for `mode`.
    pub fn profile(mode: ScanMode) -> Self {
        match mode {
            ScanMode::Full => Self::full(),
            ScanMode::Seed => Self::seed(),
        }
    }

    /// Whether `field` is collected.
    pub fn get(&self, field: ScanField) -> bool {
        self.flags[field.index()]
    }

    /// Turn collection of `field` on or off.
    pub fn set(&mut self, field: ScanField, enabled: bool) {
        self.flags[field.index()] = enabled;
    }

    /// Iterate over `(field, enabled)` in engine order.
    pub fn iter(&self) -> impl Iterator<Item = (ScanField, bool)> + '_ {
        ScanField::ALL.into_iter().map(|f| (f, self.get(f)))
    }

    /// Fields that will be collected.
    pub fn enabled(&self) -> impl Iterator<Item = ScanField> + '_ {
        self.iter().filter_map(|(f, on)| on.then_some(f))
    }

    /// Flip flags named in `overrides`. Keys outside the fixed set are ignored.
    pub fn apply_overrides(&mut self, overrides: &FxHashMap<String, bool>) {
        for field in ScanField::ALL {
            if let Some(&enabled) = overrides.get(field.key()) {
                self.set(field, enabled);
            }
        }
    }
}

impl Serialize for ScanOptionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(ScanField::ALL.len()))?;
        for (field, enabled) in self.iter() {
            map.serialize_entry(field.key(), &enabled)?;
        }
        map.end()
    }
}

/// Build the option set for a job.
///
/// Starts from the `seed` profile when `mode == "seed"`, the `full` profile
/// otherwise, then applies `overrides` on top.
pub fn build_options(mode: &str, overrides: Option<&FxHashMap<String, bool>>) -> ScanOptionSet {
    let mut options = ScanOptionSet::profile(ScanMode::from_mode(mode));
    if let Some(overrides) = overrides {
        options.apply_overrides(overrides);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, bool)]) -> FxHashMap<String, bool> {
        pairs.iter().map(|&(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_seed_profile() {
        let options = build_options("seed", None);
        let enabled: Vec<_> = options.enabled().collect();
        assert_eq!(
            enabled,
            vec![
                ScanField::Id,
                ScanField::Name,
                ScanField::Power,
                ScanField::Killpoints,
                ScanField::Alliance
            ]
        );
        assert!(!options.get(ScanField::T4Kills));
        assert!(!options.get(ScanField::Helps));
    }

    #[test]
    fn test_full_profile_for_any_other_mode() {
        assert_eq!(build_options("full", None), ScanOptionSet::full());
        assert_eq!(build_options("", None), ScanOptionSet::full());
        assert_eq!(build_options("Seed", None), ScanOptionSet::full());
        assert!(ScanOptionSet::full().iter().all(|(_, on)| on));
    }

    #[test]
    fn test_overrides_win_over_profile() {
        let options = build_options(
            "seed",
            Some(&overrides(&[("Deads", true), ("Power", false)])),
        );
        assert!(options.get(ScanField::Deads));
        assert!(!options.get(ScanField::Power));
        assert!(options.get(ScanField::Id));

        let options = build_options("full", Some(&overrides(&[("T1 Kills", false)])));
        assert!(!options.get(ScanField::T1Kills));
        assert_eq!(options.enabled().count(), 14);
    }

    #[test]
    fn test_unknown_override_keys_ignored() {
        let options = build_options(
            "seed",
            Some(&overrides(&[("Honor Points", true), ("deads", true)])),
        );
        assert_eq!(options, ScanOptionSet::seed());

        let json = serde_json::to_value(options).unwrap();
        let keys = json.as_object().unwrap();
        assert_eq!(keys.len(), ScanField::ALL.len());
        assert!(!keys.contains_key("Honor Points"));
    }

    #[test]
    fn test_serializes_every_fixed_key() {
        let json = serde_json::to_value(ScanOptionSet::seed()).unwrap();
        assert_eq!(json["ID"], serde_json::json!(true));
        assert_eq!(json["Rss Gathered"], serde_json::json!(false));
        for field in ScanField::ALL {
            assert!(json.get(field.key()).is_some(), "missing {field}");
        }
    }

    #[test]
    fn test_field_key_round_trip() {
        for field in ScanField::ALL {
            assert_eq!(ScanField::from_key(field.key()), Some(field));
        }
        assert_eq!(ScanField::from_key("Kills"), None);
    }
}
