//! Configuration for the consent collector.

use crate::collector::types::{BatteryMode, PrivacyLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of cached samples per (user, signal type).
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Shortest sleep a worker takes between ticks, whatever the config says.
pub const MIN_POLL_FLOOR: Duration = Duration::from_millis(1);

/// Shortest period of the expired-consent sweep.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Main configuration for the collector service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global off-switch
    pub enabled: bool,

    /// Per-signal settings, keyed by probe name
    pub signals: BTreeMap<String, SignalConfig>,

    /// Consent defaults
    pub consent: ConsentConfig,

    /// Battery thresholds and interval multipliers
    pub battery: BatteryConfig,

    /// Cache bounds
    pub cache: CacheConfig,

    /// Worker loop timing
    pub scheduler: SchedulerConfig,

    /// Crisis collaborator delivery limits
    pub crisis: CrisisConfig,

    /// At-rest encryption
    pub security: SecurityConfig,

    /// Path for storing state and transparency logs
    pub data_path: PathBuf,

    /// Path for writing synced batches
    pub export_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("consent-collector");

        let signals = [
            ("pulse", 60, PrivacyLevel::Medium),
            ("sleep", 300, PrivacyLevel::Medium),
            ("activity", 120, PrivacyLevel::Low),
            ("environment", 600, PrivacyLevel::Low),
            ("voice", 1800, PrivacyLevel::High),
            ("vitals", 300, PrivacyLevel::High),
        ]
        .into_iter()
        .map(|(name, secs, privacy_level)| {
            (
                name.to_string(),
                SignalConfig {
                    enabled: true,
                    interval: Duration::from_secs(secs),
                    privacy_level,
                },
            )
        })
        .collect();

        Self {
            enabled: true,
            signals,
            consent: ConsentConfig::default(),
            battery: BatteryConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            crisis: CrisisConfig::default(),
            security: SecurityConfig::default(),
            export_path: data_dir.join("exports"),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::IoError(e.to_string()))?;
            Self::from_json(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from JSON. Missing fields take their defaults.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject durations that would stall or spin the background tasks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheduler = &self.scheduler;
        if scheduler.poll_floor < MIN_POLL_FLOOR {
            return Err(ConfigError::InvalidValue(format!(
                "scheduler.poll_floor must be at least {MIN_POLL_FLOOR:?}"
            )));
        }
        if scheduler.poll_ceiling < scheduler.poll_floor {
            return Err(ConfigError::InvalidValue(
                "scheduler.poll_ceiling must not be below scheduler.poll_floor".to_string(),
            ));
        }
        if scheduler.sync_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "scheduler.sync_interval must be positive".to_string(),
            ));
        }
        if matches!(scheduler.consent_sweep_interval, Some(p) if p < MIN_SWEEP_INTERVAL) {
            return Err(ConfigError::InvalidValue(format!(
                "scheduler.consent_sweep_interval must be null or at least {MIN_SWEEP_INTERVAL:?}"
            )));
        }
        if self.crisis.timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "crisis.timeout must be positive".to_string(),
            ));
        }
        if let Some((name, _)) = self.signals.iter().find(|(_, s)| s.interval.is_zero()) {
            return Err(ConfigError::InvalidValue(format!(
                "signals.{name}.interval_secs must be positive"
            )));
        }
        Ok(())
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("consent-collector")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.export_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Settings for a signal type, if configured.
    pub fn signal(&self, signal_type: &str) -> Option<&SignalConfig> {
        self.signals.get(signal_type)
    }

    /// Whether a signal type may be collected at all.
    ///
    /// Types without an entry are allowed and use [`FALLBACK_INTERVAL`].
    pub fn signal_enabled(&self, signal_type: &str) -> bool {
        self.signal(signal_type).map_or(true, |s| s.enabled)
    }

    /// Base sampling interval for a signal type before overrides and battery scaling.
    pub fn base_interval(&self, signal_type: &str) -> Duration {
        self.signal(signal_type)
            .map_or(FALLBACK_INTERVAL, |s| s.interval)
    }

    /// Privacy level for a signal type.
    pub fn privacy_level(&self, signal_type: &str) -> PrivacyLevel {
        self.signal(signal_type)
            .map_or(PrivacyLevel::Medium, |s| s.privacy_level)
    }
}

/// Interval used for registered probes that have no `signals` entry.
pub const FALLBACK_INTERVAL: Duration = Duration::from_secs(300);

/// Settings for one signal type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub enabled: bool,
    #[serde(rename = "interval_secs", with = "duration_serde")]
    pub interval: Duration,
    pub privacy_level: PrivacyLevel,
}

/// Consent defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentConfig {
    /// Reject registrations that do not name any signal type
    pub require_explicit: bool,
    /// Lifetime of a new grant; `None` means grants never expire
    pub default_expiry_days: Option<u32>,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            require_explicit: true,
            default_expiry_days: Some(365),
        }
    }
}

/// Battery thresholds (percent) and the interval multipliers applied below them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub threshold_low: u8,
    pub threshold_critical: u8,
    pub multiplier_low: u32,
    pub multiplier_critical: u32,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            threshold_low: 20,
            threshold_critical: 10,
            multiplier_low: 2,
            multiplier_critical: 4,
        }
    }
}

impl BatteryConfig {
    /// Classify a battery level.
    pub fn mode(&self, level: u8) -> BatteryMode {
        if level <= self.threshold_critical {
            BatteryMode::Critical
        } else if level <= self.threshold_low {
            BatteryMode::Low
        } else {
            BatteryMode::Normal
        }
    }

    /// Interval multiplier for a battery level.
    pub fn multiplier(&self, level: u8) -> u32 {
        match self.mode(level) {
            BatteryMode::Normal => 1,
            BatteryMode::Low => self.multiplier_low.max(1),
            BatteryMode::Critical => self.multiplier_critical.max(1),
        }
    }
}

/// Cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Worker loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Shortest sleep between two ticks
    #[serde(with = "duration_serde")]
    pub poll_floor: Duration,
    /// Longest sleep between two ticks
    #[serde(with = "duration_serde")]
    pub poll_ceiling: Duration,
    /// How often a worker flushes its user's cache upstream
    #[serde(with = "duration_serde")]
    pub sync_interval: Duration,
    /// Sync interval multiplier while the battery is low or critical
    pub low_battery_sync_factor: u32,
    /// Extra multiplier for non-sleep signals while the user sleeps (1 = off)
    pub sleeping_interval_multiplier: u32,
    /// Period of the expired-consent sweep; `None` disables it
    #[serde(with = "option_duration_serde")]
    pub consent_sweep_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_floor: Duration::from_secs(1),
            poll_ceiling: Duration::from_secs(10),
            sync_interval: Duration::from_secs(900),
            low_battery_sync_factor: 2,
            sleeping_interval_multiplier: 1,
            consent_sweep_interval: Some(Duration::from_secs(3600)),
        }
    }
}

/// Limits for delivering samples to the crisis collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrisisConfig {
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for CrisisConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_in_flight: 8,
        }
    }
}

/// At-rest encryption settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Seed the cache key is derived from
    pub encryption_seed: Option<String>,
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::InvalidValue(e) => write!(f, "Invalid value: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as fractional seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
