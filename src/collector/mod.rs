//! Signal collection for the consent collector.
//!
//! This module provides the probe contract and registry, simulated probes
//! standing in for platform sensor bridges, and battery level sources.

pub mod battery;
pub mod probe;
pub mod simulated;
pub mod types;

// Re-export commonly used types
pub use battery::{BatteryAdvisor, FixedBattery, SystemBattery, UNKNOWN_BATTERY_LEVEL};
pub use probe::{ProbeError, ProbeRegistry, SignalProbe};
pub use types::{ActivityState, BatteryMode, Payload, PrivacyLevel, Sample};
