//! Fan-out of collected samples to an external crisis-detection collaborator.
//!
//! The collaborator runs on the blocking pool under a timeout. A cap on
//! outstanding calls keeps a hung collaborator from piling up blocked threads.

use crate::collector::types::Payload;
use crate::config::CrisisConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receives every collected sample.
pub trait CrisisCollaborator: Send + Sync {
    fn notify(&self, user_id: &str, signal_type: &str, payload: &Payload);
}

impl<F> CrisisCollaborator for F
where
    F: Fn(&str, &str, &Payload) + Send + Sync,
{
    fn notify(&self, user_id: &str, signal_type: &str, payload: &Payload) {
        self(user_id, signal_type, payload)
    }
}

/// Collaborator that ignores every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollaborator;

impl CrisisCollaborator for NoopCollaborator {
    fn notify(&self, _user_id: &str, _signal_type: &str, _payload: &Payload) {}
}

/// Forwarding errors. None of them affect the cache write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The collaborator did not return within the timeout
    Timeout(Duration),
    /// Too many notifications are still outstanding
    Saturated(usize),
    /// The collaborator panicked
    Collaborator(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Timeout(d) => write!(f, "Crisis collaborator timed out after {d:?}"),
            BridgeError::Saturated(n) => {
                write!(f, "Crisis collaborator has {n} notifications outstanding")
            }
            BridgeError::Collaborator(msg) => write!(f, "Crisis collaborator failed: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Releases an in-flight slot when the blocking call finishes, even after
/// the caller has given up waiting.
struct SlotGuard(Arc<AtomicUsize>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded-timeout bridge to a [`CrisisCollaborator`].
pub struct CrisisAlertBridge {
    collaborator: Arc<dyn CrisisCollaborator>,
    timeout: Duration,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
}

impl CrisisAlertBridge {
    pub fn new(collaborator: Arc<dyn CrisisCollaborator>, config: &CrisisConfig) -> Self {
        Self {
            collaborator,
            timeout: config.timeout,
            max_in_flight: config.max_in_flight.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bridge to [`NoopCollaborator`].
    pub fn noop(config: &CrisisConfig) -> Self {
        Self::new(Arc::new(NoopCollaborator), config)
    }

    /// Notifications currently running on the blocking pool.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Option<SlotGuard> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_in_flight {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(SlotGuard(Arc::clone(&self.in_flight))),
                Err(actual) => current = actual,
            }
        }
    }

    /// Hand a sample to the collaborator and wait at most the configured timeout.
    pub async fn forward(
        &self,
        user_id: &str,
        signal_type: &str,
        payload: &Payload,
    ) -> Result<(), BridgeError> {
        let slot = self
            .acquire()
            .ok_or(BridgeError::Saturated(self.max_in_flight))?;

        let collaborator = Arc::clone(&self.collaborator);
        let user = user_id.to_string();
        let signal = signal_type.to_string();
        let payload = payload.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            collaborator.notify(&user, &signal, &payload);
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Collaborator(e.to_string())),
            Err(_) => Err(BridgeError::Timeout(self.timeout)),
        }
    }
}

impl std::fmt::Debug for CrisisAlertBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrisisAlertBridge")
            .field("timeout", &self.timeout)
            .field("max_in_flight", &self.max_in_flight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn config(timeout_ms: u64, max_in_flight: usize) -> CrisisConfig {
        CrisisConfig {
            timeout: Duration::from_millis(timeout_ms),
            max_in_flight,
        }
    }

    #[tokio::test]
    async fn test_forward_reaches_collaborator() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let bridge = CrisisAlertBridge::new(
            Arc::new(move |user: &str, signal: &str, _: &Payload| {
                sink.lock().push((user.to_string(), signal.to_string()));
            }),
            &config(1000, 4),
        );

        bridge.forward("u1", "pulse", &Payload::new()).await.unwrap();
        assert_eq!(*seen.lock(), vec![("u1".to_string(), "pulse".to_string())]);
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_noop_collaborator() {
        let bridge = CrisisAlertBridge::noop(&CrisisConfig::default());
        assert!(bridge.forward("u1", "sleep", &Payload::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_collaborator_times_out() {
        let bridge = CrisisAlertBridge::new(
            Arc::new(|_: &str, _: &str, _: &Payload| {
                std::thread::sleep(Duration::from_millis(300));
            }),
            &config(20, 4),
        );

        let err = bridge.forward("u1", "pulse", &Payload::new()).await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_saturation_rejects_without_calling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let bridge = CrisisAlertBridge::new(
            Arc::new(move |_: &str, _: &str, _: &Payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
            }),
            &config(10, 1),
        );

        assert!(matches!(
            bridge.forward("u1", "pulse", &Payload::new()).await,
            Err(BridgeError::Timeout(_))
        ));
        assert_eq!(
            bridge.forward("u1", "pulse", &Payload::new()).await,
            Err(BridgeError::Saturated(1))
        );
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_collaborator_panic_is_contained() {
        let bridge = CrisisAlertBridge::new(
            Arc::new(|_: &str, _: &str, _: &Payload| panic!("collaborator bug")),
            &config(1000, 4),
        );

        assert!(matches!(
            bridge.forward("u1", "pulse", &Payload::new()).await,
            Err(BridgeError::Collaborator(_))
        ));
        assert_eq!(bridge.in_flight(), 0);
    }
}
