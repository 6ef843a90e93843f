//! State shared by the service and every worker.

use crate::collector::battery::BatteryAdvisor;
use crate::collector::probe::ProbeRegistry;
use crate::collector::types::BatteryMode;
use crate::config::Config;
use crate::core::cache::{SecureCache, SyncBatch};
use crate::core::consent::ConsentRegistry;
use crate::core::state::UserStateDetector;
use crate::crisis::CrisisAlertBridge;
use crate::transparency::{CollectionEvent, Gauge, MetricsSink};
use crate::upstream::UpstreamSink;
use std::sync::Arc;

/// Everything a worker needs, owned by the service and shared through `Arc`.
pub struct CollectorContext {
    pub config: Config,
    pub probes: ProbeRegistry,
    pub consent: ConsentRegistry,
    pub cache: SecureCache,
    pub battery: Arc<dyn BatteryAdvisor>,
    pub bridge: CrisisAlertBridge,
    pub detector: UserStateDetector,
    pub metrics: Arc<dyn MetricsSink>,
    pub upstream: Arc<dyn UpstreamSink>,
}

/// Battery reading with the policy applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    pub level: u8,
    pub mode: BatteryMode,
    pub multiplier: u32,
}

impl CollectorContext {
    /// Consent only accepts probes that exist and are enabled in `config`.
    pub fn new(
        config: Config,
        probes: ProbeRegistry,
        battery: Arc<dyn BatteryAdvisor>,
        bridge: CrisisAlertBridge,
        metrics: Arc<dyn MetricsSink>,
        upstream: Arc<dyn UpstreamSink>,
    ) -> Self {
        let known: Vec<String> = probes
            .names()
            .into_iter()
            .filter(|name| config.signal_enabled(name))
            .collect();
        let consent = ConsentRegistry::new(known, config.consent.clone());
        let cache = SecureCache::new(config.cache.capacity);

        Self {
            config,
            probes,
            consent,
            cache,
            battery,
            bridge,
            detector: UserStateDetector::new(),
            metrics,
            upstream,
        }
    }

    pub fn battery_reading(&self) -> BatteryReading {
        let level = self.battery.level();
        self.metrics.gauge(Gauge::BatteryLevel, f64::from(level));
        BatteryReading {
            level,
            mode: self.config.battery.mode(level),
            multiplier: self.config.battery.multiplier(level),
        }
    }

    /// Drain the user's cache and hand the batch upstream.
    ///
    /// Returns the drained batch, `None` if the user has no cache entry. A
    /// failed delivery is logged and counted; the batch is not re-queued.
    pub fn flush_user(&self, user_id: &str) -> Option<SyncBatch> {
        let batch = self.cache.sync(user_id)?;
        if batch.is_empty() {
            return Some(batch);
        }

        match self.upstream.deliver(&batch) {
            Ok(()) => {
                tracing::debug!(user_id, samples = batch.total(), "Synced cache upstream");
                self.metrics.record(CollectionEvent::BatchSynced {
                    samples: batch.total(),
                });
            }
            Err(e) => {
                tracing::error!(user_id, error = %e, samples = batch.total(), "Upstream delivery failed");
                self.metrics.record(CollectionEvent::SyncFailed);
            }
        }
        Some(batch)
    }
}

impl std::fmt::Debug for CollectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorContext")
            .field("probes", &self.probes)
            .field("consent", &self.consent)
            .field("cache", &self.cache)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}
