//! Coarse user state inferred from cached samples.

use crate::collector::types::{ActivityState, Sample};
use crate::core::cache::SecureCache;

/// Activity types that count as the user being active.
pub const ACTIVE_ACTIVITY_TYPES: [&str; 3] = ["walking", "running", "exercise"];

/// Infers idle / sleeping / active from the latest sleep and activity samples.
#[derive(Debug, Clone)]
pub struct UserStateDetector {
    sleep_type: String,
    activity_type: String,
}

impl UserStateDetector {
    pub fn new() -> Self {
        Self {
            sleep_type: "sleep".to_string(),
            activity_type: "activity".to_string(),
        }
    }

    pub fn detect(&self, cache: &SecureCache, user_id: &str) -> ActivityState {
        if latest(cache, user_id, &self.sleep_type).map_or(false, |s| is_sleeping(&s)) {
            return ActivityState::Sleeping;
        }
        if latest(cache, user_id, &self.activity_type).map_or(false, |s| is_active(&s)) {
            return ActivityState::Active;
        }
        ActivityState::Idle
    }
}

impl Default for UserStateDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn latest(cache: &SecureCache, user_id: &str, signal_type: &str) -> Option<Sample> {
    match cache.read_recent(user_id, signal_type, 1) {
        Ok(samples) => samples.and_then(|mut s| s.pop()),
        Err(e) => {
            tracing::debug!(user_id, signal_type, error = %e, "State detection read failed");
            None
        }
    }
}

fn is_sleeping(sample: &Sample) -> bool {
    sample.payload.get("state").and_then(|v| v.as_str()) == Some("sleeping")
}

fn is_active(sample: &Sample) -> bool {
    sample
        .payload
        .get("activity_type")
        .and_then(|v| v.as_str())
        .map_or(false, |t| ACTIVE_ACTIVITY_TYPES.contains(&t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::types::Payload;
    use crate::core::cipher::AesGcmCipher;
    use serde_json::json;
    use std::sync::Arc;

    fn cache() -> SecureCache {
        SecureCache::with_cipher(100, Arc::new(AesGcmCipher::from_seed("state")))
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_idle_without_samples() {
        let detector = UserStateDetector::new();
        assert_eq!(detector.detect(&cache(), "u1"), ActivityState::Idle);
    }

    #[test]
    fn test_sleeping_wins_over_activity() {
        let cache = cache();
        cache
            .write("u1", "activity", &payload(json!({"activity_type": "running"})))
            .unwrap();
        cache
            .write("u1", "sleep", &payload(json!({"state": "sleeping"})))
            .unwrap();

        assert_eq!(UserStateDetector::new().detect(&cache, "u1"), ActivityState::Sleeping);
    }

    #[test]
    fn test_only_latest_sample_counts() {
        let cache = cache();
        cache
            .write("u1", "sleep", &payload(json!({"state": "sleeping"})))
            .unwrap();
        cache
            .write("u1", "sleep", &payload(json!({"state": "awake"})))
            .unwrap();
        cache
            .write("u1", "activity", &payload(json!({"activity_type": "walking"})))
            .unwrap();

        assert_eq!(UserStateDetector::new().detect(&cache, "u1"), ActivityState::Active);
    }

    #[test]
    fn test_stationary_is_idle() {
        let cache = cache();
        cache
            .write("u1", "activity", &payload(json!({"activity_type": "stationary"})))
            .unwrap();
        assert_eq!(UserStateDetector::new().detect(&cache, "u1"), ActivityState::Idle);
    }

    #[test]
    fn test_unreadable_cache_is_idle() {
        let cache = cache();
        cache
            .write("u1", "sleep", &payload(json!({"state": "sleeping"})))
            .unwrap();
        cache.install_cipher(Arc::new(AesGcmCipher::from_seed("other")));

        assert_eq!(UserStateDetector::new().detect(&cache, "u1"), ActivityState::Idle);
    }
}
