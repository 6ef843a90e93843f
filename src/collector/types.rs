//! Shared value types for collected signals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A sample payload as produced by a probe.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// How sensitive a signal type is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Low,
    Medium,
    High,
}

/// Battery optimization mode derived from the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryMode {
    Normal,
    Low,
    Critical,
}

/// Coarse activity state inferred from recent samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    #[default]
    Idle,
    Sleeping,
    Active,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityState::Idle => write!(f, "idle"),
            ActivityState::Sleeping => write!(f, "sleeping"),
            ActivityState::Active => write!(f, "active"),
        }
    }
}

/// A decrypted sample read back from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Identifier assigned when the sample was cached
    pub id: Uuid,
    /// Probe name
    pub signal_type: String,
    /// When the sample was cached
    pub timestamp: DateTime<Utc>,
    /// Probe output
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_state_display() {
        assert_eq!(ActivityState::default(), ActivityState::Idle);
        assert_eq!(ActivityState::Sleeping.to_string(), "sleeping");
    }

    #[test]
    fn test_enum_serialization() {
        assert_eq!(
            serde_json::to_string(&BatteryMode::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(
            serde_json::from_str::<PrivacyLevel>("\"high\"").unwrap(),
            PrivacyLevel::High
        );
    }
}
