//! Simulated probes.
//!
//! These stand in for the platform sensor bridges so the collector runs
//! anywhere. Values are plausible but synthetic.

use crate::collector::probe::{ProbeError, ProbeRegistry};
use crate::collector::types::Payload;
use chrono::{Local, Timelike};
use rand::Rng;
use serde_json::{json, Value};

/// Registry with all simulated probes in their canonical order.
pub fn registry() -> ProbeRegistry {
    ProbeRegistry::new()
        .with("pulse", pulse)
        .with("sleep", sleep)
        .with("activity", activity)
        .with("environment", environment)
        .with("voice", voice)
        .with("vitals", vitals)
}

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn current_hour() -> u32 {
    Local::now().hour()
}

/// Heart rate in the 75-84 bpm range.
pub fn pulse(_user_id: &str) -> Result<Payload, ProbeError> {
    let rate: u32 = rand::thread_rng().gen_range(75..85);
    Ok(payload(json!({
        "pulse_rate": rate,
        "rhythm": "regular",
        "strength": "moderate",
    })))
}

/// Sleeping between 22:00 and 06:59 local time.
pub fn sleep(_user_id: &str) -> Result<Payload, ProbeError> {
    Ok(sleep_at_hour(current_hour()))
}

fn sleep_at_hour(hour: u32) -> Payload {
    let is_night = hour >= 22 || hour <= 6;
    let duration_hours = match (is_night, hour >= 22) {
        (false, _) => 0,
        (true, true) => hour - 22,
        (true, false) => hour + 2,
    };
    payload(json!({
        "state": if is_night { "sleeping" } else { "awake" },
        "movement_level": if is_night { 0.2 } else { 0.8 },
        "duration_hours": duration_hours,
    }))
}

/// Walking during the day, stationary at night.
pub fn activity(_user_id: &str) -> Result<Payload, ProbeError> {
    let hour = current_hour();
    let is_active_time = (8..=21).contains(&hour);
    let steps: u32 = if is_active_time {
        rand::thread_rng().gen_range(0..100)
    } else {
        0
    };
    Ok(payload(json!({
        "step_count": steps,
        "activity_type": if is_active_time { "walking" } else { "stationary" },
        "intensity": if is_active_time { 0.6 } else { 0.1 },
    })))
}

pub fn environment(_user_id: &str) -> Result<Payload, ProbeError> {
    let is_daytime = (7..=18).contains(&current_hour());
    let noise: u32 = rand::thread_rng().gen_range(40..70);
    Ok(payload(json!({
        "noise_db": noise,
        "light_lux": if is_daytime { 800 } else { 50 },
        "location_type": "indoor",
    })))
}

/// Passive voice features; speech only between 09:00 and 22:59.
pub fn voice(user_id: &str) -> Result<Payload, ProbeError> {
    Ok(voice_at_hour(user_id, current_hour(), &mut rand::thread_rng()))
}

fn voice_at_hour(user_id: &str, hour: u32, rng: &mut impl Rng) -> Payload {
    let is_speaking_time = (9..=22).contains(&hour);
    let speech_detected = is_speaking_time && rng.gen_bool(0.2);
    // Stable per-user base pitch
    let pitch = 220 + user_id.bytes().map(u32::from).sum::<u32>() % 40;
    let duration: u32 = if is_speaking_time { rng.gen_range(0..60) } else { 0 };
    payload(json!({
        "speech_detected": speech_detected,
        "voice_features": {
            "pitch": pitch,
            "energy": if is_speaking_time { 0.6 } else { 0.2 },
        },
        "duration": duration,
    }))
}

pub fn vitals(_user_id: &str) -> Result<Payload, ProbeError> {
    let mut rng = rand::thread_rng();
    let spo2: u32 = rng.gen_range(95..100);
    let respiratory_rate: u32 = rng.gen_range(12..19);
    let skin_temp: f64 = rng.gen_range(33.0..35.5);
    Ok(payload(json!({
        "spo2_pct": spo2,
        "respiratory_rate": respiratory_rate,
        "skin_temp_c": (skin_temp * 10.0).round() / 10.0,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_range() {
        for _ in 0..20 {
            let sample = pulse("u1").unwrap();
            let rate = sample["pulse_rate"].as_u64().unwrap();
            assert!((75..85).contains(&rate));
        }
    }

    #[test]
    fn test_sleep_by_hour() {
        assert_eq!(sleep_at_hour(23)["state"], "sleeping");
        assert_eq!(sleep_at_hour(23)["duration_hours"], 1);
        assert_eq!(sleep_at_hour(3)["state"], "sleeping");
        assert_eq!(sleep_at_hour(3)["duration_hours"], 5);
        assert_eq!(sleep_at_hour(12)["state"], "awake");
        assert_eq!(sleep_at_hour(12)["duration_hours"], 0);
    }

    #[test]
    fn test_voice_by_hour() {
        let mut rng = rand::thread_rng();
        let night = voice_at_hour("u1", 3, &mut rng);
        assert_eq!(night["speech_detected"], false);
        assert_eq!(night["duration"], 0);
        assert_eq!(night["voice_features"]["energy"], 0.2);

        let day = voice_at_hour("u1", 14, &mut rng);
        assert_eq!(day["voice_features"]["energy"], 0.6);
        assert!(day["duration"].as_u64().unwrap() < 60);
        assert_eq!(
            day["voice_features"]["pitch"],
            voice_at_hour("u1", 20, &mut rng)["voice_features"]["pitch"]
        );
    }

    #[test]
    fn test_all_probes_produce_payloads() {
        let registry = registry();
        for name in registry.names() {
            let sample = registry.get(&name).unwrap().sample("u1").unwrap();
            assert!(!sample.is_empty(), "{name} produced an empty payload");
        }
    }
}
