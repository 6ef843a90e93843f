//! Privacy-preserving transparency log.
//!
//! This module tracks and exposes statistics about data collection
//! without storing any personal or identifying information: counts only,
//! never payloads or user identifiers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Something that happened in the collection pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent {
    /// A sample was written to the cache
    SampleCollected { signal_type: String, evicted: usize },
    ProbeFailed,
    CacheWriteFailed,
    AlertForwarded,
    AlertFailed,
    WorkerStarted,
    WorkerStopped,
    /// A drained batch was delivered upstream
    BatchSynced { samples: usize },
    SyncFailed,
}

/// Point-in-time values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gauge {
    BatteryLevel,
    ActiveWorkers,
}

/// Best-effort metrics collaborator. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: CollectionEvent);
    fn gauge(&self, gauge: Gauge, value: f64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: CollectionEvent) {}
    fn gauge(&self, _gauge: Gauge, _value: f64) {}
}

/// Transparency statistics for the current session.
#[derive(Debug)]
pub struct TransparencyLog {
    /// Samples written to the cache
    samples_collected: AtomicU64,
    /// Samples dropped by the bounded cache
    samples_evicted: AtomicU64,
    probe_failures: AtomicU64,
    cache_write_failures: AtomicU64,
    alerts_forwarded: AtomicU64,
    alert_failures: AtomicU64,
    workers_started: AtomicU64,
    workers_stopped: AtomicU64,
    batches_synced: AtomicU64,
    samples_synced: AtomicU64,
    sync_failures: AtomicU64,
    /// Samples per signal type
    by_signal: Mutex<BTreeMap<String, u64>>,
    /// Last battery level, f64 bits
    battery_level: AtomicU64,
    active_workers: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    /// Create a new transparency log.
    pub fn new() -> Self {
        Self {
            samples_collected: AtomicU64::new(0),
            samples_evicted: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            cache_write_failures: AtomicU64::new(0),
            alerts_forwarded: AtomicU64::new(0),
            alert_failures: AtomicU64::new(0),
            workers_started: AtomicU64::new(0),
            workers_stopped: AtomicU64::new(0),
            batches_synced: AtomicU64::new(0),
            samples_synced: AtomicU64::new(0),
            sync_failures: AtomicU64::new(0),
            by_signal: Mutex::new(BTreeMap::new()),
            battery_level: AtomicU64::new(f64::NAN.to_bits()),
            active_workers: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a transparency log with persistence.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "Could not load previous transparency stats");
        }

        log
    }

    /// Get the current statistics.
    pub fn stats(&self) -> TransparencyStats {
        let battery = f64::from_bits(self.battery_level.load(Ordering::Relaxed));
        TransparencyStats {
            samples_collected: self.samples_collected.load(Ordering::Relaxed),
            samples_evicted: self.samples_evicted.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
            alerts_forwarded: self.alerts_forwarded.load(Ordering::Relaxed),
            alert_failures: self.alert_failures.load(Ordering::Relaxed),
            workers_started: self.workers_started.load(Ordering::Relaxed),
            workers_stopped: self.workers_stopped.load(Ordering::Relaxed),
            batches_synced: self.batches_synced.load(Ordering::Relaxed),
            samples_synced: self.samples_synced.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
            samples_by_signal: self.by_signal.lock().clone(),
            battery_level: (!battery.is_nan()).then_some(battery),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let by_signal = if stats.samples_by_signal.is_empty() {
            "none".to_string()
        } else {
            stats
                .samples_by_signal
                .iter()
                .map(|(signal, count)| format!("{signal}={count}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "Session Statistics:\n\
             - Samples collected: {} ({})\n\
             - Samples evicted from cache: {}\n\
             - Probe failures: {}\n\
             - Crisis alerts forwarded: {} ({} failed)\n\
             - Workers started/stopped: {}/{}\n\
             - Batches synced: {} ({} samples, {} failed)\n\
             - Session duration: {} seconds\n\
             \n\
             Privacy Guarantee:\n\
             - Collection only with explicit, expiring consent\n\
             - Cached payloads encrypted at rest\n\
             - Only counts retained in this log",
            stats.samples_collected,
            by_signal,
            stats.samples_evicted,
            stats.probe_failures,
            stats.alerts_forwarded,
            stats.alert_failures,
            stats.workers_started,
            stats.workers_stopped,
            stats.batches_synced,
            stats.samples_synced,
            stats.sync_failures,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                samples_collected: stats.samples_collected,
                samples_evicted: stats.samples_evicted,
                probe_failures: stats.probe_failures,
                alerts_forwarded: stats.alerts_forwarded,
                batches_synced: stats.batches_synced,
                samples_synced: stats.samples_synced,
                samples_by_signal: stats.samples_by_signal,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load stats from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.samples_collected
                    .store(persisted.samples_collected, Ordering::Relaxed);
                self.samples_evicted
                    .store(persisted.samples_evicted, Ordering::Relaxed);
                self.probe_failures
                    .store(persisted.probe_failures, Ordering::Relaxed);
                self.alerts_forwarded
                    .store(persisted.alerts_forwarded, Ordering::Relaxed);
                self.batches_synced
                    .store(persisted.batches_synced, Ordering::Relaxed);
                self.samples_synced
                    .store(persisted.samples_synced, Ordering::Relaxed);
                *self.by_signal.lock() = persisted.samples_by_signal;
            }
        }
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in [
            &self.samples_collected,
            &self.samples_evicted,
            &self.probe_failures,
            &self.cache_write_failures,
            &self.alerts_forwarded,
            &self.alert_failures,
            &self.workers_started,
            &self.workers_stopped,
            &self.batches_synced,
            &self.samples_synced,
            &self.sync_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.by_signal.lock().clear();
    }
}

impl MetricsSink for TransparencyLog {
    fn record(&self, event: CollectionEvent) {
        match event {
            CollectionEvent::SampleCollected {
                signal_type,
                evicted,
            } => {
                self.samples_collected.fetch_add(1, Ordering::Relaxed);
                self.samples_evicted
                    .fetch_add(evicted as u64, Ordering::Relaxed);
                *self.by_signal.lock().entry(signal_type).or_insert(0) += 1;
            }
            CollectionEvent::ProbeFailed => {
                self.probe_failures.fetch_add(1, Ordering::Relaxed);
            }
            CollectionEvent::CacheWriteFailed => {
                self.cache_write_failures.fetch_add(1, Ordering::Relaxed);
            }
            CollectionEvent::AlertForwarded => {
                self.alerts_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            CollectionEvent::AlertFailed => {
                self.alert_failures.fetch_add(1, Ordering::Relaxed);
            }
            CollectionEvent::WorkerStarted => {
                self.workers_started.fetch_add(1, Ordering::Relaxed);
            }
            CollectionEvent::WorkerStopped => {
                self.workers_stopped.fetch_add(1, Ordering::Relaxed);
            }
            CollectionEvent::BatchSynced { samples } => {
                self.batches_synced.fetch_add(1, Ordering::Relaxed);
                self.samples_synced
                    .fetch_add(samples as u64, Ordering::Relaxed);
            }
            CollectionEvent::SyncFailed => {
                self.sync_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn gauge(&self, gauge: Gauge, value: f64) {
        match gauge {
            Gauge::BatteryLevel => self.battery_level.store(value.to_bits(), Ordering::Relaxed),
            Gauge::ActiveWorkers => self
                .active_workers
                .store(value.max(0.0) as u64, Ordering::Relaxed),
        }
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transparency statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub samples_collected: u64,
    pub samples_evicted: u64,
    pub probe_failures: u64,
    pub cache_write_failures: u64,
    pub alerts_forwarded: u64,
    pub alert_failures: u64,
    pub workers_started: u64,
    pub workers_stopped: u64,
    pub batches_synced: u64,
    pub samples_synced: u64,
    pub sync_failures: u64,
    pub samples_by_signal: BTreeMap<String, u64>,
    pub battery_level: Option<f64>,
    pub active_workers: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    samples_collected: u64,
    samples_evicted: u64,
    probe_failures: u64,
    alerts_forwarded: u64,
    batches_synced: u64,
    samples_synced: u64,
    #[serde(default)]
    samples_by_signal: BTreeMap<String, u64>,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;

/// Create a new shared transparency log.
pub fn create_shared_log() -> SharedTransparencyLog {
    Arc::new(TransparencyLog::new())
}

/// Create a new shared transparency log with persistence.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedTransparencyLog {
    Arc::new(TransparencyLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collected(signal: &str, evicted: usize) -> CollectionEvent {
        CollectionEvent::SampleCollected {
            signal_type: signal.to_string(),
            evicted,
        }
    }

    #[test]
    fn test_transparency_log_counting() {
        let log = TransparencyLog::new();

        log.record(collected("pulse", 0));
        log.record(collected("pulse", 1));
        log.record(collected("sleep", 0));
        log.record(CollectionEvent::ProbeFailed);
        log.record(CollectionEvent::BatchSynced { samples: 3 });

        let stats = log.stats();
        assert_eq!(stats.samples_collected, 3);
        assert_eq!(stats.samples_evicted, 1);
        assert_eq!(stats.samples_by_signal["pulse"], 2);
        assert_eq!(stats.probe_failures, 1);
        assert_eq!(stats.batches_synced, 1);
        assert_eq!(stats.samples_synced, 3);
    }

    #[test]
    fn test_gauges() {
        let log = TransparencyLog::new();
        assert_eq!(log.stats().battery_level, None);

        log.gauge(Gauge::BatteryLevel, 42.0);
        log.gauge(Gauge::ActiveWorkers, 3.0);

        let stats = log.stats();
        assert_eq!(stats.battery_level, Some(42.0));
        assert_eq!(stats.active_workers, 3);
    }

    #[test]
    fn test_transparency_log_reset() {
        let log = TransparencyLog::new();

        log.record(collected("pulse", 5));
        log.record(CollectionEvent::WorkerStarted);
        log.reset();

        let stats = log.stats();
        assert_eq!(stats.samples_collected, 0);
        assert_eq!(stats.workers_started, 0);
        assert!(stats.samples_by_signal.is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "consent-collector-transparency-{}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let log = TransparencyLog::with_persistence(path.clone());
        log.record(collected("vitals", 0));
        log.record(CollectionEvent::AlertForwarded);
        log.save().unwrap();

        let reloaded = TransparencyLog::with_persistence(path.clone());
        let stats = reloaded.stats();
        assert_eq!(stats.samples_collected, 1);
        assert_eq!(stats.alerts_forwarded, 1);
        assert_eq!(stats.samples_by_signal["vitals"], 1);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_summary_format() {
        let log = TransparencyLog::new();
        let summary = log.summary();

        assert!(summary.contains("Samples collected"));
        assert!(summary.contains("Privacy Guarantee"));
        assert!(summary.contains("encrypted at rest"));
    }
}
