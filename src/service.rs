//! The collector service: the single entry point for consent management,
//! worker lifecycle and cache access.

use crate::collector::battery::{BatteryAdvisor, SystemBattery};
use crate::collector::probe::ProbeRegistry;
use crate::collector::types::{ActivityState, BatteryMode, Payload, PrivacyLevel, Sample};
use crate::config::{Config, MIN_SWEEP_INTERVAL};
use crate::context::CollectorContext;
use crate::core::cache::{CacheError, DataExport, SyncBatch, WriteReceipt};
use crate::core::cipher::{AesGcmCipher, Cipher};
use crate::core::consent::{
    ConsentError, ConsentEvent, ConsentExpiry, ConsentStatus, OverrideOutcome, RegisterOutcome,
    RevokeOutcome,
};
use crate::core::scheduler::{WorkerPool, WorkerState};
use crate::crisis::{CrisisAlertBridge, CrisisCollaborator};
use crate::transparency::{create_shared_log, CollectionEvent, MetricsSink, SharedTransparencyLog};
use crate::upstream::{LoggingUpstream, UpstreamSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Service-level errors.
#[derive(Debug)]
pub enum CollectorError {
    /// Background collection is switched off in the configuration
    ServiceDisabled,
    Consent(ConsentError),
    Cache(CacheError),
    /// No tokio runtime to run workers on
    Runtime(String),
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::ServiceDisabled => write!(f, "Background collection is disabled"),
            CollectorError::Consent(e) => write!(f, "Consent error: {e}"),
            CollectorError::Cache(e) => write!(f, "Cache error: {e}"),
            CollectorError::Runtime(e) => write!(f, "Runtime error: {e}"),
        }
    }
}

impl std::error::Error for CollectorError {}

impl From<ConsentError> for CollectorError {
    fn from(e: ConsentError) -> Self {
        CollectorError::Consent(e)
    }
}

impl From<CacheError> for CollectorError {
    fn from(e: CacheError) -> Self {
        CollectorError::Cache(e)
    }
}

/// Collection status for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub user_id: String,
    pub is_collecting: bool,
    /// Signal types being sampled, in registration order
    pub collecting_types: Vec<String>,
    /// Privacy level of each collecting type
    pub privacy_levels: BTreeMap<String, PrivacyLevel>,
    pub last_sync: Option<DateTime<Utc>>,
    /// Buffered samples per signal type
    pub counts: BTreeMap<String, usize>,
    pub battery_level: u8,
    pub battery_mode: BatteryMode,
    pub user_state: ActivityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

struct Sweeper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

async fn run_sweeper(ctx: Arc<CollectorContext>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ctx.consent.sweep_expired(Utc::now());
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

/// Builder for [`CollectorService`].
pub struct CollectorServiceBuilder {
    config: Config,
    probes: Option<ProbeRegistry>,
    battery: Option<Arc<dyn BatteryAdvisor>>,
    cipher: Option<Arc<dyn Cipher>>,
    collaborator: Option<Arc<dyn CrisisCollaborator>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    transparency: Option<SharedTransparencyLog>,
    upstream: Option<Arc<dyn UpstreamSink>>,
    runtime: Option<Handle>,
}

impl CollectorServiceBuilder {
    /// Probes to sample; defaults to the simulated set.
    pub fn with_probes(mut self, probes: ProbeRegistry) -> Self {
        self.probes = Some(probes);
        self
    }

    /// Battery source; defaults to [`SystemBattery`].
    pub fn with_battery(mut self, battery: Arc<dyn BatteryAdvisor>) -> Self {
        self.battery = Some(battery);
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_collaborator(mut self, collaborator: Arc<dyn CrisisCollaborator>) -> Self {
        self.collaborator = Some(collaborator);
        self
    }

    /// Count into an existing transparency log.
    pub fn with_transparency(mut self, log: SharedTransparencyLog) -> Self {
        self.transparency = Some(log);
        self.metrics = None;
        self
    }

    /// Replace the transparency log with another metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self.transparency = None;
        self
    }

    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamSink>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Runtime for worker tasks; defaults to the one `start` is called from.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> CollectorService {
        let (metrics, transparency): (Arc<dyn MetricsSink>, Option<SharedTransparencyLog>) =
            match (self.metrics, self.transparency) {
                (Some(metrics), _) => (metrics, None),
                (None, log) => {
                    let log = log.unwrap_or_else(create_shared_log);
                    let metrics: Arc<dyn MetricsSink> = log.clone();
                    (metrics, Some(log))
                }
            };

        let bridge = match self.collaborator {
            Some(collaborator) => CrisisAlertBridge::new(collaborator, &self.config.crisis),
            None => CrisisAlertBridge::noop(&self.config.crisis),
        };
        let battery: Arc<dyn BatteryAdvisor> = match self.battery {
            Some(battery) => battery,
            None => Arc::new(SystemBattery::new()),
        };
        let upstream: Arc<dyn UpstreamSink> = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(LoggingUpstream),
        };

        let ctx = CollectorContext::new(
            self.config,
            self.probes.unwrap_or_else(ProbeRegistry::simulated),
            battery,
            bridge,
            metrics,
            upstream,
        );
        if let Some(cipher) = self.cipher {
            ctx.cache.install_cipher(cipher);
        }

        let ctx = Arc::new(ctx);
        CollectorService {
            pool: WorkerPool::new(Arc::clone(&ctx)),
            ctx,
            transparency,
            runtime: self.runtime,
            sweeper: Mutex::new(None),
        }
    }
}

/// Consent-driven background collector.
pub struct CollectorService {
    ctx: Arc<CollectorContext>,
    pool: WorkerPool,
    transparency: Option<SharedTransparencyLog>,
    runtime: Option<Handle>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl CollectorService {
    pub fn builder(config: Config) -> CollectorServiceBuilder {
        CollectorServiceBuilder {
            config,
            probes: None,
            battery: None,
            cipher: None,
            collaborator: None,
            metrics: None,
            transparency: None,
            upstream: None,
            runtime: None,
        }
    }

    /// Service with simulated probes and the system battery.
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn context(&self) -> &Arc<CollectorContext> {
        &self.ctx
    }

    pub fn is_enabled(&self) -> bool {
        self.ctx.config.enabled
    }

    /// The transparency log, unless another metrics sink replaced it.
    pub fn transparency(&self) -> Option<&SharedTransparencyLog> {
        self.transparency.as_ref()
    }

    pub fn install_cipher(&self, cipher: Arc<dyn Cipher>) {
        self.ctx.cache.install_cipher(cipher);
    }

    fn apply(&self, event: Option<ConsentEvent>) {
        if let Some(event) = event {
            self.pool.apply(&event);
        }
    }

    /// Grant consent and start collecting for the user if the service runs.
    pub fn register_consent(
        &self,
        user_id: &str,
        signal_types: &[String],
        expiry: ConsentExpiry,
    ) -> Result<RegisterOutcome, CollectorError> {
        if !self.is_enabled() {
            return Err(CollectorError::ServiceDisabled);
        }
        let outcome = self
            .ctx
            .consent
            .register(user_id, signal_types, expiry, Utc::now())?;
        self.apply(Some(outcome.event()));
        Ok(outcome)
    }

    /// Withdraw consent for some or all signal types. Always allowed.
    pub fn revoke_consent(&self, user_id: &str, signal_types: Option<&[String]>) -> RevokeOutcome {
        let outcome = self.ctx.consent.revoke(user_id, signal_types, Utc::now());
        self.apply(outcome.event());
        outcome
    }

    pub fn consent_status(&self, user_id: &str) -> ConsentStatus {
        self.ctx.consent.status(user_id, Utc::now())
    }

    pub fn set_interval_override(
        &self,
        user_id: &str,
        intervals: &BTreeMap<String, u64>,
    ) -> OverrideOutcome {
        self.ctx.consent.set_interval_overrides(user_id, intervals)
    }

    /// Delete expired grants now. Returns the affected users.
    pub fn sweep_expired_consents(&self) -> Vec<String> {
        let removed = self.ctx.consent.sweep_expired(Utc::now());
        for user_id in &removed {
            self.pool.stop_worker(user_id);
        }
        removed
    }

    /// Start workers for every user with active consent.
    pub fn start(&self) -> Result<(), CollectorError> {
        if !self.is_enabled() {
            tracing::info!("Background collection disabled, not starting");
            return Ok(());
        }

        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|e| CollectorError::Runtime(e.to_string()))?,
        };

        if !self.ctx.cache.has_cipher() {
            match &self.ctx.config.security.encryption_seed {
                Some(seed) => self
                    .ctx
                    .cache
                    .install_cipher(Arc::new(AesGcmCipher::from_seed(seed))),
                None => {
                    tracing::warn!("No encryption seed configured, using a per-process key");
                    self.ctx.cache.install_cipher(Arc::new(AesGcmCipher::random()));
                }
            }
        }

        self.pool.open(runtime.clone());
        let users = self.ctx.consent.active_users(Utc::now());
        for user_id in &users {
            self.pool.ensure_worker(user_id);
        }

        if let Some(period) = self.ctx.config.scheduler.consent_sweep_interval {
            let mut sweeper = self.sweeper.lock();
            if sweeper.is_none() {
                let (stop, stop_rx) = watch::channel(false);
                let period = period.max(MIN_SWEEP_INTERVAL);
                let task = runtime.spawn(run_sweeper(Arc::clone(&self.ctx), period, stop_rx));
                *sweeper = Some(Sweeper { stop, task });
            }
        }

        tracing::info!(users = users.len(), "Collector started");
        Ok(())
    }

    /// Stop every worker, wait for them and flush all caches upstream.
    pub async fn stop(&self) {
        if !self.is_enabled() {
            return;
        }

        self.pool.shutdown().await;

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.stop.send(true);
            if let Err(e) = sweeper.task.await {
                tracing::error!(error = %e, "Consent sweeper ended abnormally");
            }
        }

        let mut flushed = 0;
        for user_id in self.ctx.cache.users() {
            if let Some(batch) = self.ctx.flush_user(&user_id) {
                flushed += batch.total();
            }
        }
        tracing::info!(samples = flushed, "Collector stopped");
    }

    pub fn worker_state(&self, user_id: &str) -> WorkerState {
        self.pool.worker_state(user_id)
    }

    pub fn status(&self, user_id: &str) -> CollectionStatus {
        let battery = self.ctx.battery_reading();
        let active = self.ctx.consent.active_types(user_id, Utc::now());
        let is_collecting =
            self.is_enabled() && !active.is_empty() && self.pool.is_running(user_id);

        let message = if !self.is_enabled() {
            Some("Background collection is disabled".to_string())
        } else if active.is_empty() {
            self.consent_status(user_id).message
        } else if !is_collecting {
            Some("Collection is not running".to_string())
        } else {
            None
        };

        let collecting_types = if is_collecting { active } else { Vec::new() };
        let privacy_levels = collecting_types
            .iter()
            .map(|t| (t.clone(), self.ctx.config.privacy_level(t)))
            .collect();

        CollectionStatus {
            user_id: user_id.to_string(),
            is_collecting,
            collecting_types,
            privacy_levels,
            last_sync: self.ctx.cache.last_sync(user_id),
            counts: self.ctx.cache.counts(user_id),
            battery_level: battery.level,
            battery_mode: battery.mode,
            user_state: self.detect_state(user_id),
            message,
        }
    }

    pub fn detect_state(&self, user_id: &str) -> ActivityState {
        self.ctx.detector.detect(&self.ctx.cache, user_id)
    }

    /// Append a sample directly, bypassing probes and consent.
    pub fn write_sample(
        &self,
        user_id: &str,
        signal_type: &str,
        payload: &Payload,
    ) -> Result<WriteReceipt, CollectorError> {
        if !self.is_enabled() {
            return Err(CollectorError::ServiceDisabled);
        }
        let receipt = self.ctx.cache.write(user_id, signal_type, payload)?;
        self.ctx.metrics.record(CollectionEvent::SampleCollected {
            signal_type: signal_type.to_string(),
            evicted: receipt.evicted,
        });
        Ok(receipt)
    }

    pub fn read_recent(
        &self,
        user_id: &str,
        signal_type: &str,
        limit: usize,
    ) -> Result<Option<Vec<Sample>>, CollectorError> {
        Ok(self.ctx.cache.read_recent(user_id, signal_type, limit)?)
    }

    pub fn export(
        &self,
        user_id: &str,
        signal_types: Option<&[String]>,
    ) -> Result<Option<DataExport>, CollectorError> {
        Ok(self.ctx.cache.export(user_id, signal_types)?)
    }

    pub fn clear(&self, user_id: &str, signal_types: Option<&[String]>) -> Option<Vec<String>> {
        let cleared = self.ctx.cache.clear(user_id, signal_types);
        if let Some(types) = &cleared {
            tracing::info!(user_id, cleared = ?types, "Cleared cached data");
        }
        cleared
    }

    /// Drain the user's cache upstream now.
    pub fn sync_user(&self, user_id: &str) -> Option<SyncBatch> {
        self.ctx.flush_user(user_id)
    }
}

impl std::fmt::Debug for CollectorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorService")
            .field("enabled", &self.is_enabled())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
