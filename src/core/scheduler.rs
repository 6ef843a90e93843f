//! Adaptive per-user sampling.
//!
//! Each user with active consent gets one worker task. A worker wakes up,
//! samples every signal type whose effective interval has elapsed, writes the
//! result to the cache and forwards it to the crisis bridge, then sleeps
//! until the next type is due. Workers are owned by [`WorkerPool`] and are
//! only started or stopped through it.

use crate::collector::probe::{ProbeError, SignalProbe};
use crate::collector::types::{ActivityState, BatteryMode, Payload};
use crate::config::MIN_POLL_FLOOR;
use crate::context::CollectorContext;
use crate::core::consent::ConsentEvent;
use crate::transparency::{CollectionEvent, Gauge};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// The signal type exempt from the sleeping multiplier.
const SLEEP_SIGNAL: &str = "sleep";

/// Sampling interval for one signal type after overrides, battery scaling
/// and the optional sleeping multiplier.
pub fn effective_interval(
    ctx: &CollectorContext,
    user_id: &str,
    signal_type: &str,
    battery_multiplier: u32,
    state: ActivityState,
) -> Duration {
    let base = ctx
        .consent
        .interval_override(user_id, signal_type)
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config.base_interval(signal_type));

    let mut interval = base.saturating_mul(battery_multiplier.max(1));
    let sleeping = ctx.config.scheduler.sleeping_interval_multiplier;
    if sleeping > 1 && state == ActivityState::Sleeping && signal_type != SLEEP_SIGNAL {
        interval = interval.saturating_mul(sleeping);
    }
    interval
}

/// Per-worker timing state.
#[derive(Debug, Clone)]
pub struct Cadence {
    last_sampled: HashMap<String, Instant>,
    last_sync: Instant,
}

impl Cadence {
    pub fn new(started: Instant) -> Self {
        Self {
            last_sampled: HashMap::new(),
            last_sync: started,
        }
    }

    pub fn last_sampled(&self, signal_type: &str) -> Option<Instant> {
        self.last_sampled.get(signal_type).copied()
    }

    /// Time left until `signal_type` is due; zero when it never ran.
    fn remaining(&self, signal_type: &str, interval: Duration, now: Instant) -> Duration {
        match self.last_sampled.get(signal_type) {
            Some(last) => interval.saturating_sub(now.saturating_duration_since(*last)),
            None => Duration::ZERO,
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Signal types sampled this tick, in registration order
    pub sampled: Vec<String>,
    /// Samples handed upstream if a periodic sync ran
    pub synced: Option<usize>,
    /// How long to sleep before the next tick
    pub next_wake: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue(TickReport),
    /// The stop signal was raised
    Stopped,
    /// No signal type is active any more
    ConsentEnded,
}

async fn sample_probe(probe: Arc<dyn SignalProbe>, user_id: &str) -> Result<Payload, ProbeError> {
    let user = user_id.to_string();
    match tokio::task::spawn_blocking(move || probe.sample(&user)).await {
        Ok(result) => result,
        Err(e) => Err(ProbeError::Panicked(e.to_string())),
    }
}

/// Run one scheduling pass for `user_id` as of `now`.
pub async fn run_tick(
    ctx: &CollectorContext,
    user_id: &str,
    cadence: &mut Cadence,
    now: Instant,
    stop: &watch::Receiver<bool>,
) -> TickOutcome {
    if *stop.borrow() {
        return TickOutcome::Stopped;
    }

    let active = ctx.consent.active_types(user_id, Utc::now());
    if active.is_empty() {
        return TickOutcome::ConsentEnded;
    }

    let battery = ctx.battery_reading();
    let state = if ctx.config.scheduler.sleeping_interval_multiplier > 1 {
        ctx.detector.detect(&ctx.cache, user_id)
    } else {
        ActivityState::Idle
    };

    let mut sampled = Vec::new();
    for signal_type in &active {
        let interval = effective_interval(ctx, user_id, signal_type, battery.multiplier, state);
        if cadence.remaining(signal_type, interval, now) > Duration::ZERO {
            continue;
        }
        let Some(probe) = ctx.probes.get(signal_type) else {
            continue;
        };

        let result = sample_probe(probe, user_id).await;
        if *stop.borrow() {
            return TickOutcome::Stopped;
        }

        let payload = match result {
            Ok(payload) if payload.is_empty() => {
                tracing::warn!(user_id, signal_type = %signal_type, "Probe returned no data");
                continue;
            }
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(user_id, signal_type = %signal_type, error = %e, "Probe failed");
                ctx.metrics.record(CollectionEvent::ProbeFailed);
                continue;
            }
        };

        // Consent may have been revoked while the probe ran.
        if !ctx.consent.is_active(user_id, signal_type, Utc::now()) {
            tracing::debug!(user_id, signal_type = %signal_type, "Dropping sample, consent withdrawn");
            continue;
        }

        match ctx.cache.write(user_id, signal_type, &payload) {
            Ok(receipt) => {
                tracing::debug!(
                    user_id,
                    signal_type = %signal_type,
                    evicted = receipt.evicted,
                    "Sample cached"
                );
                ctx.metrics.record(CollectionEvent::SampleCollected {
                    signal_type: signal_type.clone(),
                    evicted: receipt.evicted,
                });
            }
            Err(e) => {
                tracing::error!(user_id, signal_type = %signal_type, error = %e, "Cache write failed");
                ctx.metrics.record(CollectionEvent::CacheWriteFailed);
            }
        }

        match ctx.bridge.forward(user_id, signal_type, &payload).await {
            Ok(()) => ctx.metrics.record(CollectionEvent::AlertForwarded),
            Err(e) => {
                tracing::warn!(user_id, signal_type = %signal_type, error = %e, "Crisis forward failed");
                ctx.metrics.record(CollectionEvent::AlertFailed);
            }
        }

        cadence.last_sampled.insert(signal_type.clone(), now);
        sampled.push(signal_type.clone());
    }

    let mut sync_interval = ctx.config.scheduler.sync_interval;
    if battery.mode != BatteryMode::Normal {
        sync_interval =
            sync_interval.saturating_mul(ctx.config.scheduler.low_battery_sync_factor.max(1));
    }
    let synced = if now.saturating_duration_since(cadence.last_sync) >= sync_interval {
        cadence.last_sync = now;
        ctx.flush_user(user_id).map(|batch| batch.total())
    } else {
        None
    };

    let soonest = active
        .iter()
        .map(|t| {
            let interval = effective_interval(ctx, user_id, t, battery.multiplier, state);
            cadence.remaining(t, interval, now)
        })
        .min()
        .unwrap_or(ctx.config.scheduler.poll_ceiling);
    let floor = ctx.config.scheduler.poll_floor.max(MIN_POLL_FLOOR);
    let ceiling = ctx.config.scheduler.poll_ceiling.max(floor);

    TickOutcome::Continue(TickReport {
        sampled,
        synced,
        next_wake: soonest.clamp(floor, ceiling),
    })
}

async fn run_worker(ctx: Arc<CollectorContext>, user_id: String, mut stop: watch::Receiver<bool>) {
    let mut cadence = Cadence::new(Instant::now());
    tracing::info!(user_id = %user_id, "Collection worker started");

    loop {
        match run_tick(&ctx, &user_id, &mut cadence, Instant::now(), &stop).await {
            TickOutcome::Continue(report) => {
                tokio::select! {
                    _ = tokio::time::sleep(report.next_wake) => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            TickOutcome::Stopped => break,
            TickOutcome::ConsentEnded => {
                tracing::info!(user_id = %user_id, "No active consent left");
                break;
            }
        }
    }

    ctx.metrics.record(CollectionEvent::WorkerStopped);
    tracing::info!(user_id = %user_id, "Collection worker stopped");
}

/// Phase of a user's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NoWorker,
    Running,
    Stopping,
}

/// A running worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: Uuid,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn signal_stop(&self) {
        let _ = self.stop.send(true);
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    runtime: Option<Handle>,
    workers: HashMap<String, WorkerHandle>,
    /// Signalled workers that have not exited yet
    draining: Vec<WorkerHandle>,
}

impl PoolInner {
    fn reap(&mut self) {
        self.draining.retain(|w| !w.is_finished());
    }

    fn running(&self) -> usize {
        self.workers.values().filter(|w| !w.is_finished()).count()
    }
}

/// Supervised set of workers keyed by user id.
#[derive(Debug)]
pub struct WorkerPool {
    ctx: Arc<CollectorContext>,
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    /// A closed pool; call [`WorkerPool::open`] before workers can start.
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self {
            ctx,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Accept work, spawning tasks on `runtime`.
    pub fn open(&self, runtime: Handle) {
        self.inner.lock().runtime = Some(runtime);
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().runtime.is_some()
    }

    /// Start a worker for `user_id` unless one is already running.
    ///
    /// Returns whether a worker is running afterwards.
    pub fn ensure_worker(&self, user_id: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.reap();

        let Some(runtime) = inner.runtime.clone() else {
            tracing::debug!(user_id, "Pool closed, not starting worker");
            return false;
        };
        if inner.workers.get(user_id).map_or(false, |w| !w.is_finished()) {
            return true;
        }

        let (stop, stop_rx) = watch::channel(false);
        let task = runtime.spawn(run_worker(Arc::clone(&self.ctx), user_id.to_string(), stop_rx));
        inner.workers.insert(
            user_id.to_string(),
            WorkerHandle {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                started_at: Utc::now(),
                stop,
                task,
            },
        );

        self.ctx.metrics.record(CollectionEvent::WorkerStarted);
        self.ctx
            .metrics
            .gauge(Gauge::ActiveWorkers, inner.running() as f64);
        true
    }

    /// Signal the user's worker to stop. It finishes in the background and
    /// is awaited by [`WorkerPool::shutdown`].
    pub fn stop_worker(&self, user_id: &str) {
        let mut inner = self.inner.lock();
        inner.reap();
        if let Some(worker) = inner.workers.remove(user_id) {
            worker.signal_stop();
            tracing::info!(user_id, worker_id = %worker.id, "Stopping collection worker");
            if !worker.is_finished() {
                inner.draining.push(worker);
            }
        }
        self.ctx
            .metrics
            .gauge(Gauge::ActiveWorkers, inner.running() as f64);
    }

    pub fn apply(&self, event: &ConsentEvent) {
        match event {
            ConsentEvent::Activated { user_id } => {
                self.ensure_worker(user_id);
            }
            ConsentEvent::Deactivated { user_id } => self.stop_worker(user_id),
        }
    }

    pub fn worker_state(&self, user_id: &str) -> WorkerState {
        let inner = self.inner.lock();
        if inner.workers.get(user_id).map_or(false, |w| !w.is_finished()) {
            WorkerState::Running
        } else if inner
            .draining
            .iter()
            .any(|w| w.user_id == user_id && !w.is_finished())
        {
            WorkerState::Stopping
        } else {
            WorkerState::NoWorker
        }
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.worker_state(user_id) == WorkerState::Running
    }

    pub fn running_users(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut users: Vec<String> = inner
            .workers
            .iter()
            .filter(|(_, w)| !w.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        users.sort();
        users
    }

    /// Close the pool, signal every worker and wait until all have exited.
    pub async fn shutdown(&self) {
        let handles: Vec<WorkerHandle> = {
            let mut inner = self.inner.lock();
            inner.runtime = None;
            let mut handles: Vec<WorkerHandle> =
                inner.workers.drain().map(|(_, w)| w).collect();
            handles.append(&mut inner.draining);
            handles
        };

        for worker in &handles {
            worker.signal_stop();
        }
        let count = handles.len();
        for worker in handles {
            if let Err(e) = worker.task.await {
                tracing::error!(user_id = %worker.user_id, error = %e, "Worker ended abnormally");
            }
        }

        self.ctx.metrics.gauge(Gauge::ActiveWorkers, 0.0);
        tracing::info!(workers = count, "Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::battery::FixedBattery;
    use crate::collector::probe::ProbeRegistry;
    use crate::config::Config;
    use crate::core::cipher::AesGcmCipher;
    use crate::core::consent::{ConsentExpiry, MAX_OVERRIDE_INTERVAL_SECS};
    use crate::crisis::CrisisAlertBridge;
    use crate::transparency::TransparencyLog;
    use crate::upstream::LoggingUpstream;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn payload(value: i64) -> Payload {
        let mut payload = Payload::new();
        payload.insert("value".to_string(), value.into());
        payload
    }

    fn counting_probe(counter: Arc<AtomicUsize>) -> impl SignalProbe {
        move |_: &str| -> Result<Payload, ProbeError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(payload(1))
        }
    }

    fn context_with(
        config: Config,
        probes: ProbeRegistry,
        battery: u8,
    ) -> (Arc<CollectorContext>, Arc<TransparencyLog>) {
        let metrics = Arc::new(TransparencyLog::new());
        let bridge = CrisisAlertBridge::noop(&config.crisis);
        let ctx = CollectorContext::new(
            config,
            probes,
            Arc::new(FixedBattery::new(battery)),
            bridge,
            metrics.clone(),
            Arc::new(LoggingUpstream),
        );
        ctx.cache
            .install_cipher(Arc::new(AesGcmCipher::from_seed("scheduler")));
        (Arc::new(ctx), metrics)
    }

    fn context(battery: u8) -> Arc<CollectorContext> {
        context_with(Config::default(), ProbeRegistry::simulated(), battery).0
    }

    fn grant(ctx: &CollectorContext, user: &str, types: &[&str]) {
        let types: Vec<String> = types.iter().map(|s| s.to_string()).collect();
        ctx.consent
            .register(user, &types, ConsentExpiry::Never, Utc::now())
            .unwrap();
    }

    fn report(outcome: TickOutcome) -> TickReport {
        match outcome {
            TickOutcome::Continue(report) => report,
            other => panic!("unexpected tick outcome: {other:?}"),
        }
    }

    #[test]
    fn test_battery_scales_interval() {
        for (level, expected) in [(80, 60), (15, 120), (5, 240)] {
            let ctx = context(level);
            let multiplier = ctx.battery_reading().multiplier;
            assert_eq!(
                effective_interval(&ctx, "u1", "pulse", multiplier, ActivityState::Idle),
                Duration::from_secs(expected),
                "battery {level}%"
            );
        }
    }

    #[test]
    fn test_override_replaces_base_interval() {
        let ctx = context(15);
        ctx.consent
            .set_interval_overrides("u1", &BTreeMap::from([("pulse".to_string(), 30)]));

        let multiplier = ctx.battery_reading().multiplier;
        assert_eq!(
            effective_interval(&ctx, "u1", "pulse", multiplier, ActivityState::Idle),
            Duration::from_secs(60)
        );
        assert_eq!(
            effective_interval(&ctx, "u2", "pulse", multiplier, ActivityState::Idle),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_huge_intervals_saturate() {
        let mut config = Config::default();
        config.scheduler.sleeping_interval_multiplier = u32::MAX;
        if let Some(activity) = config.signals.get_mut("activity") {
            activity.interval = Duration::MAX;
        }
        let (ctx, _) = context_with(config, ProbeRegistry::simulated(), 5);
        ctx.consent
            .set_interval_overrides("u1", &BTreeMap::from([("pulse".to_string(), u64::MAX)]));

        let multiplier = ctx.battery_reading().multiplier;
        assert_eq!(
            effective_interval(&ctx, "u1", "pulse", multiplier, ActivityState::Idle),
            Duration::from_secs(MAX_OVERRIDE_INTERVAL_SECS * u64::from(multiplier))
        );
        assert_eq!(
            effective_interval(&ctx, "u1", "activity", multiplier, ActivityState::Sleeping),
            Duration::MAX
        );
    }

    #[tokio::test]
    async fn test_tick_survives_huge_override_on_low_battery() {
        let ctx = context(15);
        grant(&ctx, "u1", &["pulse"]);
        ctx.consent
            .set_interval_overrides("u1", &BTreeMap::from([("pulse".to_string(), u64::MAX)]));
        let (_tx, rx) = watch::channel(false);
        let mut cadence = Cadence::new(Instant::now());

        let first = report(run_tick(&ctx, "u1", &mut cadence, Instant::now(), &rx).await);
        assert_eq!(first.sampled, vec!["pulse".to_string()]);
        let second = report(run_tick(&ctx, "u1", &mut cadence, Instant::now(), &rx).await);
        assert!(second.sampled.is_empty());
        assert_eq!(second.next_wake, ctx.config.scheduler.poll_ceiling);
    }

    #[test]
    fn test_sleeping_multiplier_spares_sleep_signal() {
        let mut config = Config::default();
        config.scheduler.sleeping_interval_multiplier = 2;
        let (ctx, _) = context_with(config, ProbeRegistry::simulated(), 80);

        assert_eq!(
            effective_interval(&ctx, "u1", "pulse", 1, ActivityState::Sleeping),
            Duration::from_secs(120)
        );
        assert_eq!(
            effective_interval(&ctx, "u1", "sleep", 1, ActivityState::Sleeping),
            Duration::from_secs(300)
        );
        assert_eq!(
            effective_interval(&ctx, "u1", "pulse", 1, ActivityState::Idle),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_tick_samples_in_registration_order() {
        let ctx = context(80);
        grant(&ctx, "u1", &["vitals", "pulse", "activity"]);
        let (_tx, rx) = watch::channel(false);
        let now = Instant::now();
        let mut cadence = Cadence::new(now);

        let report = report(run_tick(&ctx, "u1", &mut cadence, now, &rx).await);
        assert_eq!(report.sampled, vec!["pulse", "activity", "vitals"]);
        assert_eq!(report.synced, None);
        assert_eq!(report.next_wake, Duration::from_secs(10));

        let counts = ctx.cache.counts("u1");
        assert_eq!(counts["pulse"], 1);
        assert!(!counts.contains_key("sleep"));
    }

    #[tokio::test]
    async fn test_only_due_types_are_sampled() {
        let ctx = context(80);
        grant(&ctx, "u1", &["pulse", "sleep"]);
        let (_tx, rx) = watch::channel(false);
        let start = Instant::now();
        let mut cadence = Cadence::new(start);

        report(run_tick(&ctx, "u1", &mut cadence, start, &rx).await);
        let early = report(
            run_tick(&ctx, "u1", &mut cadence, start + Duration::from_secs(30), &rx).await,
        );
        assert!(early.sampled.is_empty());

        let later = report(
            run_tick(&ctx, "u1", &mut cadence, start + Duration::from_secs(60), &rx).await,
        );
        assert_eq!(later.sampled, vec!["pulse"]);
        assert_eq!(ctx.cache.counts("u1")["pulse"], 2);
        assert_eq!(ctx.cache.counts("u1")["sleep"], 1);
    }

    #[tokio::test]
    async fn test_next_wake_is_clamped() {
        let mut config = Config::default();
        config.scheduler.poll_ceiling = Duration::from_secs(1000);
        let (ctx, _) = context_with(config, ProbeRegistry::simulated(), 80);
        grant(&ctx, "u1", &["pulse", "sleep"]);
        let (_tx, rx) = watch::channel(false);
        let start = Instant::now();
        let mut cadence = Cadence::new(start);

        let first = report(run_tick(&ctx, "u1", &mut cadence, start, &rx).await);
        assert_eq!(first.next_wake, Duration::from_secs(60));

        let almost = start + Duration::from_millis(59_500);
        let later = report(run_tick(&ctx, "u1", &mut cadence, almost, &rx).await);
        assert_eq!(later.next_wake, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_poll_floor_still_sleeps() {
        let mut config = Config::default();
        config.scheduler.poll_floor = Duration::ZERO;
        let probes = ProbeRegistry::new().with("pulse", |_: &str| -> Result<Payload, ProbeError> {
            Err(ProbeError::Unavailable("sensor offline".to_string()))
        });
        let (ctx, _) = context_with(config, probes, 80);
        grant(&ctx, "u1", &["pulse"]);
        let (_tx, rx) = watch::channel(false);
        let mut cadence = Cadence::new(Instant::now());

        let tick = report(run_tick(&ctx, "u1", &mut cadence, Instant::now(), &rx).await);
        assert!(tick.sampled.is_empty());
        assert!(tick.next_wake >= MIN_POLL_FLOOR);
    }

    #[tokio::test]
    async fn test_revoked_type_is_not_sampled() {
        let pulse_calls = Arc::new(AtomicUsize::new(0));
        let sleep_calls = Arc::new(AtomicUsize::new(0));
        let probes = ProbeRegistry::new()
            .with("pulse", counting_probe(pulse_calls.clone()))
            .with("sleep", counting_probe(sleep_calls.clone()))
            .with("vitals", counting_probe(Arc::new(AtomicUsize::new(0))));
        let (ctx, _) = context_with(Config::default(), probes, 80);
        grant(&ctx, "u1", &["pulse", "sleep"]);
        let (_tx, rx) = watch::channel(false);
        let start = Instant::now();
        let mut cadence = Cadence::new(start);

        report(run_tick(&ctx, "u1", &mut cadence, start, &rx).await);
        assert_eq!(pulse_calls.load(Ordering::SeqCst), 1);

        ctx.consent
            .revoke("u1", Some(&["pulse".to_string()]), Utc::now());
        let report = report(
            run_tick(&ctx, "u1", &mut cadence, start + Duration::from_secs(600), &rx).await,
        );
        assert_eq!(report.sampled, vec!["sleep"]);
        assert_eq!(pulse_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sleep_calls.load(Ordering::SeqCst), 2);
        assert!(cadence.last_sampled("vitals").is_none());
    }

    #[tokio::test]
    async fn test_probe_failure_is_isolated() {
        let probes = ProbeRegistry::new()
            .with("pulse", |_: &str| -> Result<Payload, ProbeError> {
                Err(ProbeError::Unavailable("sensor offline".to_string()))
            })
            .with("sleep", |_: &str| -> Result<Payload, ProbeError> { Ok(payload(7)) })
            .with("activity", |_: &str| -> Result<Payload, ProbeError> {
                panic!("driver crashed")
            })
            .with("environment", |_: &str| -> Result<Payload, ProbeError> {
                Ok(Payload::new())
            });
        let (ctx, metrics) = context_with(Config::default(), probes, 80);
        grant(&ctx, "u1", &["pulse", "sleep", "activity", "environment"]);
        let (_tx, rx) = watch::channel(false);
        let start = Instant::now();
        let mut cadence = Cadence::new(start);

        let first = report(run_tick(&ctx, "u1", &mut cadence, start, &rx).await);
        assert_eq!(first.sampled, vec!["sleep"]);
        assert_eq!(metrics.stats().probe_failures, 2);
        assert!(cadence.last_sampled("pulse").is_none());
        assert!(cadence.last_sampled("environment").is_none());
        // Failed types are due again right away
        assert_eq!(first.next_wake, Duration::from_secs(1));

        let retry = report(
            run_tick(&ctx, "u1", &mut cadence, start + Duration::from_secs(1), &rx).await,
        );
        assert!(retry.sampled.is_empty());
        assert_eq!(metrics.stats().probe_failures, 4);
    }

    #[tokio::test]
    async fn test_tick_stops_on_signal_and_consent_end() {
        let ctx = context(80);
        let (tx, rx) = watch::channel(false);
        let mut cadence = Cadence::new(Instant::now());

        assert_eq!(
            run_tick(&ctx, "u1", &mut cadence, Instant::now(), &rx).await,
            TickOutcome::ConsentEnded
        );

        grant(&ctx, "u1", &["pulse"]);
        tx.send(true).unwrap();
        assert_eq!(
            run_tick(&ctx, "u1", &mut cadence, Instant::now(), &rx).await,
            TickOutcome::Stopped
        );
    }

    #[tokio::test]
    async fn test_periodic_sync_flushes_cache() {
        let mut config = Config::default();
        config.scheduler.sync_interval = Duration::from_secs(100);
        let (ctx, metrics) = context_with(config, ProbeRegistry::simulated(), 80);
        grant(&ctx, "u1", &["pulse"]);
        let (_tx, rx) = watch::channel(false);
        let start = Instant::now();
        let mut cadence = Cadence::new(start);

        report(run_tick(&ctx, "u1", &mut cadence, start, &rx).await);
        assert_eq!(ctx.cache.counts("u1")["pulse"], 1);

        let report = report(
            run_tick(&ctx, "u1", &mut cadence, start + Duration::from_secs(100), &rx).await,
        );
        assert_eq!(report.synced, Some(2));
        assert_eq!(ctx.cache.counts("u1")["pulse"], 0);
        assert!(ctx.cache.last_sync("u1").is_some());
        assert_eq!(metrics.stats().samples_synced, 2);
    }

    #[tokio::test]
    async fn test_low_battery_delays_sync() {
        let mut config = Config::default();
        config.scheduler.sync_interval = Duration::from_secs(100);
        let (ctx, _) = context_with(config, ProbeRegistry::simulated(), 15);
        grant(&ctx, "u1", &["pulse"]);
        let (_tx, rx) = watch::channel(false);
        let start = Instant::now();
        let mut cadence = Cadence::new(start);

        let at_100 = report(
            run_tick(&ctx, "u1", &mut cadence, start + Duration::from_secs(100), &rx).await,
        );
        assert_eq!(at_100.synced, None);
        let at_200 = report(
            run_tick(&ctx, "u1", &mut cadence, start + Duration::from_secs(200), &rx).await,
        );
        assert!(at_200.synced.is_some());
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        for signal in config.signals.values_mut() {
            signal.interval = Duration::from_millis(20);
        }
        config.scheduler.poll_floor = Duration::from_millis(5);
        config.scheduler.poll_ceiling = Duration::from_millis(20);
        config
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let (ctx, metrics) = context_with(fast_config(), ProbeRegistry::simulated(), 80);
        let pool = WorkerPool::new(Arc::clone(&ctx));
        grant(&ctx, "u1", &["pulse"]);

        assert!(!pool.ensure_worker("u1"));
        assert_eq!(pool.worker_state("u1"), WorkerState::NoWorker);

        pool.open(Handle::current());
        assert!(pool.ensure_worker("u1"));
        assert!(pool.ensure_worker("u1"));
        assert_eq!(pool.worker_state("u1"), WorkerState::Running);
        assert_eq!(pool.running_users(), vec!["u1"]);
        assert_eq!(metrics.stats().workers_started, 1);

        assert!(wait_until(|| ctx.cache.counts("u1").get("pulse").copied().unwrap_or(0) >= 3).await);

        pool.apply(&ConsentEvent::Deactivated {
            user_id: "u1".to_string(),
        });
        assert_ne!(pool.worker_state("u1"), WorkerState::Running);

        pool.shutdown().await;
        assert_eq!(pool.worker_state("u1"), WorkerState::NoWorker);
        assert!(!pool.is_open());
        assert_eq!(metrics.stats().workers_stopped, 1);
    }

    #[tokio::test]
    async fn test_worker_exits_when_consent_ends() {
        let (ctx, _) = context_with(fast_config(), ProbeRegistry::simulated(), 80);
        let pool = WorkerPool::new(Arc::clone(&ctx));
        pool.open(Handle::current());
        grant(&ctx, "u1", &["pulse"]);
        pool.ensure_worker("u1");

        ctx.consent.revoke("u1", None, Utc::now());
        assert!(wait_until(|| pool.worker_state("u1") == WorkerState::NoWorker).await);

        // A finished worker is replaced on the next activation
        grant(&ctx, "u1", &["pulse"]);
        assert!(pool.ensure_worker("u1"));
        assert_eq!(pool.worker_state("u1"), WorkerState::Running);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_workers() {
        let (ctx, _) = context_with(fast_config(), ProbeRegistry::simulated(), 80);
        let pool = WorkerPool::new(Arc::clone(&ctx));
        pool.open(Handle::current());
        for user in ["a", "b", "c"] {
            grant(&ctx, user, &["pulse", "sleep"]);
            pool.ensure_worker(user);
        }
        assert_eq!(pool.running_users(), vec!["a", "b", "c"]);

        pool.shutdown().await;
        assert!(pool.running_users().is_empty());

        let before = ctx.cache.counts("a");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ctx.cache.counts("a"), before);
    }
}
