//! Signal probe contract and the ordered probe registry.
//!
//! A probe produces one sample for one user on demand. The registry keeps
//! probes in registration order; the scheduler samples due signal types in
//! that order on every tick.

use crate::collector::types::Payload;
use std::sync::Arc;

/// Errors a probe can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The underlying sensor or bridge is not reachable right now
    Unavailable(String),
    /// The probe ran but could not produce a sample
    Failed(String),
    /// The probe panicked
    Panicked(String),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Unavailable(msg) => write!(f, "Probe unavailable: {msg}"),
            ProbeError::Failed(msg) => write!(f, "Probe failed: {msg}"),
            ProbeError::Panicked(msg) => write!(f, "Probe panicked: {msg}"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// A named collection capability.
pub trait SignalProbe: Send + Sync {
    /// Take one sample for `user_id`.
    fn sample(&self, user_id: &str) -> Result<Payload, ProbeError>;
}

impl<F> SignalProbe for F
where
    F: Fn(&str) -> Result<Payload, ProbeError> + Send + Sync,
{
    fn sample(&self, user_id: &str) -> Result<Payload, ProbeError> {
        self(user_id)
    }
}

/// Probes keyed by signal-type name, in registration order.
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: Vec<(String, Arc<dyn SignalProbe>)>,
}

impl ProbeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the simulated pulse, sleep, activity, environment, voice
    /// and vitals probes.
    pub fn simulated() -> Self {
        crate::collector::simulated::registry()
    }

    /// Register a probe. Re-registering a name replaces the probe in place.
    pub fn register(&mut self, name: impl Into<String>, probe: impl SignalProbe + 'static) {
        self.register_arc(name, Arc::new(probe));
    }

    /// Register a shared probe.
    pub fn register_arc(&mut self, name: impl Into<String>, probe: Arc<dyn SignalProbe>) {
        let name = name.into();
        match self.probes.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = probe,
            None => self.probes.push((name, probe)),
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, probe: impl SignalProbe + 'static) -> Self {
        self.register(name, probe);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SignalProbe>> {
        self.probes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| Arc::clone(p))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.probes.iter().any(|(n, _)| n == name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.probes.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

impl std::fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("probes", &self.names())
            .finish()
    }
}
