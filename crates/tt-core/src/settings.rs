use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_STALLED_THRESHOLD_DAYS: u32 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanFrequency {
    Hourly,
    Daily,
    Weekly,
}

impl Default for ScanFrequency {
    fn default() -> Self {
        Self::Daily
    }
}

impl ScanFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanFrequency::Hourly => "hourly",
            ScanFrequency::Daily => "daily",
            ScanFrequency::Weekly => "weekly",
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        let hours = match self {
            ScanFrequency::Hourly => 1,
            ScanFrequency::Daily => 24,
            ScanFrequency::Weekly => 24 * 7,
        };
        std::time::Duration::from_secs(hours * 60 * 60)
    }
}

impl fmt::Display for ScanFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanFrequency {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "hourly" => Ok(ScanFrequency::Hourly),
            "daily" => Ok(ScanFrequency::Daily),
            "weekly" => Ok(ScanFrequency::Weekly),
            other => Err(format!("Unknown scan frequency: {other}")),
        }
    }
}

/// User settings stored under the `settings` key. Missing fields fall back
/// to their defaults one by one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_notifications_enabled")]
    pub notifications_enabled: bool,
    #[serde(
        default = "default_threshold_days",
        deserialize_with = "deserialize_threshold_days"
    )]
    pub stalled_threshold_days: u32,
    #[serde(default)]
    pub scan_frequency: ScanFrequency,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            notifications_enabled: default_notifications_enabled(),
            stalled_threshold_days: default_threshold_days(),
            scan_frequency: ScanFrequency::default(),
        }
    }
}

impl Settings {
    pub fn threshold(&self) -> Duration {
        crate::thread::stall_threshold(self.stalled_threshold_days)
    }

    pub fn apply(&self, patch: &SettingsPatch) -> Result<Settings, SettingsError> {
        let mut next = self.clone();
        if let Some(enabled) = patch.notifications_enabled {
            next.notifications_enabled = enabled;
        }
        if let Some(days) = patch.stalled_threshold_days {
            if days == 0 {
                return Err(SettingsError::InvalidThreshold(days));
            }
            next.stalled_threshold_days = days;
        }
        if let Some(frequency) = patch.scan_frequency {
            next.scan_frequency = frequency;
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stalled_threshold_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_frequency: Option<ScanFrequency>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.notifications_enabled.is_none()
            && self.stalled_threshold_days.is_none()
            && self.scan_frequency.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("stalledThresholdDays must be positive, got {0}")]
    InvalidThreshold(u32),
}

fn default_notifications_enabled() -> bool {
    true
}

fn default_threshold_days() -> u32 {
    DEFAULT_STALLED_THRESHOLD_DAYS
}

fn deserialize_threshold_days<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    if raw <= 0 {
        return Ok(DEFAULT_STALLED_THRESHOLD_DAYS);
    }
    Ok(u32::try_from(raw).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_first_run_values() {
        let value = serde_json::to_value(Settings::default()).expect("serialize");
        assert_eq!(
            value,
            json!({
                "notificationsEnabled": true,
                "stalledThresholdDays": 5,
                "scanFrequency": "daily",
            })
        );
    }

    #[test]
    fn partial_record_fills_missing_fields() {
        let settings: Settings =
            serde_json::from_value(json!({"notificationsEnabled": false})).expect("parse");
        assert!(!settings.notifications_enabled);
        assert_eq!(settings.stalled_threshold_days, 5);
        assert_eq!(settings.scan_frequency, ScanFrequency::Daily);
    }

    #[test]
    fn non_positive_threshold_reads_as_default() {
        let settings: Settings =
            serde_json::from_value(json!({"stalledThresholdDays": 0})).expect("parse");
        assert_eq!(settings.stalled_threshold_days, 5);
        let settings: Settings =
            serde_json::from_value(json!({"stalledThresholdDays": -3})).expect("parse");
        assert_eq!(settings.stalled_threshold_days, 5);
    }

    #[test]
    fn patch_rejects_zero_threshold() {
        let patch = SettingsPatch {
            stalled_threshold_days: Some(0),
            ..SettingsPatch::default()
        };
        assert_eq!(
            Settings::default().apply(&patch),
            Err(SettingsError::InvalidThreshold(0))
        );
    }

    #[test]
    fn patch_updates_only_named_fields() {
        let patch = SettingsPatch {
            scan_frequency: Some(ScanFrequency::Hourly),
            ..SettingsPatch::default()
        };
        let next = Settings::default().apply(&patch).expect("apply");
        assert_eq!(next.scan_frequency, ScanFrequency::Hourly);
        assert!(next.notifications_enabled);
        assert_eq!(next.stalled_threshold_days, 5);
    }

    #[test]
    fn scan_frequency_maps_to_interval() {
        assert_eq!(ScanFrequency::Hourly.interval().as_secs(), 3_600);
        assert_eq!(ScanFrequency::Daily.interval().as_secs(), 86_400);
        assert_eq!(ScanFrequency::Weekly.interval().as_secs(), 604_800);
        assert_eq!("Weekly".parse::<ScanFrequency>(), Ok(ScanFrequency::Weekly));
    }
}
