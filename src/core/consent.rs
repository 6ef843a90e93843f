//! Consent registry: per-user, per-signal-type grants with expiry, plus
//! per-user interval overrides.
//!
//! Reads never delete anything. An expired grant is reported as such and is
//! removed by the next mutating call for that user or by [`ConsentRegistry::sweep_expired`].

use crate::config::ConsentConfig;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Shortest interval an override may request.
pub const MIN_OVERRIDE_INTERVAL_SECS: u64 = 10;

/// Longest interval an override may request (one week).
pub const MAX_OVERRIDE_INTERVAL_SECS: u64 = 7 * 24 * 3600;

/// When a new grant expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsentExpiry {
    /// Use `consent.default_expiry_days`
    #[default]
    Default,
    Never,
    At(DateTime<Utc>),
}

/// A user's explicit authorization for background collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentGrant {
    pub user_id: String,
    pub signal_types: BTreeSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl ConsentGrant {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expiry| now >= expiry)
    }

    pub fn is_active(&self, signal_type: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.signal_types.contains(signal_type)
    }
}

/// Lifecycle notifications for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentEvent {
    /// The user has at least one active signal type
    Activated { user_id: String },
    /// The user has no active signal type left
    Deactivated { user_id: String },
}

/// Result of a registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOutcome {
    pub user_id: String,
    /// Accepted types, in probe registration order
    pub registered: Vec<String>,
    /// Unknown or disabled types that were dropped
    pub rejected: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RegisterOutcome {
    /// Warning for dropped signal types, if any.
    pub fn warning(&self) -> Option<String> {
        if self.rejected.is_empty() {
            None
        } else {
            Some(format!(
                "Unsupported signal types: {}",
                self.rejected.join(", ")
            ))
        }
    }

    pub fn event(&self) -> ConsentEvent {
        ConsentEvent::Activated {
            user_id: self.user_id.clone(),
        }
    }
}

/// Result of a revocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevokeOutcome {
    pub user_id: String,
    /// Types that were active and are now removed
    pub revoked: Vec<String>,
    /// Types still granted
    pub remaining: Vec<String>,
    /// The whole grant was deleted
    pub grant_removed: bool,
}

impl RevokeOutcome {
    pub fn event(&self) -> Option<ConsentEvent> {
        self.grant_removed.then(|| ConsentEvent::Deactivated {
            user_id: self.user_id.clone(),
        })
    }
}

/// Result of setting interval overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideOutcome {
    /// Stored overrides in seconds, after clamping
    pub applied: BTreeMap<String, u64>,
    /// Unknown types that were ignored
    pub not_applied: Vec<String>,
    /// All overrides now in effect for the user
    pub current: BTreeMap<String, u64>,
}

/// Consent state as seen by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentStatus {
    pub has_consent: bool,
    pub signal_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Consent registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentError {
    /// An explicit list of signal types is required
    NoSignalTypesRequested,
    /// None of the requested types can be collected
    NoSupportedSignalTypes { rejected: Vec<String> },
}

impl std::fmt::Display for ConsentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsentError::NoSignalTypesRequested => {
                write!(f, "Consent must name at least one signal type")
            }
            ConsentError::NoSupportedSignalTypes { rejected } => {
                write!(f, "No supported signal types in request: {}", rejected.join(", "))
            }
        }
    }
}

impl std::error::Error for ConsentError {}

#[derive(Debug, Default)]
struct UserConsent {
    grant: Option<ConsentGrant>,
    overrides: BTreeMap<String, u64>,
}

/// Stores and validates consent grants and interval overrides.
#[derive(Debug)]
pub struct ConsentRegistry {
    /// Collectable signal types in probe registration order
    known: Vec<String>,
    config: ConsentConfig,
    users: RwLock<HashMap<String, Arc<Mutex<UserConsent>>>>,
}

impl ConsentRegistry {
    /// `known` lists the collectable signal types in registration order.
    pub fn new(known: Vec<String>, config: ConsentConfig) -> Self {
        Self {
            known,
            config,
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn known_types(&self) -> &[String] {
        &self.known
    }

    pub fn is_known(&self, signal_type: &str) -> bool {
        self.known.iter().any(|k| k == signal_type)
    }

    fn user(&self, user_id: &str) -> Option<Arc<Mutex<UserConsent>>> {
        self.users.read().get(user_id).cloned()
    }

    /// Mutate the user's entry, creating it if needed.
    ///
    /// The map lock is held for the whole mutation so [`Self::prune`] cannot
    /// remove the entry in between.
    fn with_user_mut<R>(&self, user_id: &str, f: impl FnOnce(&mut UserConsent) -> R) -> R {
        {
            let users = self.users.read();
            if let Some(user) = users.get(user_id) {
                let mut entry = user.lock();
                return f(&mut *entry);
            }
        }
        let mut users = self.users.write();
        let user = users.entry(user_id.to_string()).or_default();
        let mut entry = user.lock();
        f(&mut *entry)
    }

    /// Mutate the user's entry if it exists, under the map lock.
    fn with_existing_user<R>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut UserConsent) -> R,
    ) -> Option<R> {
        let users = self.users.read();
        let user = users.get(user_id)?;
        let mut entry = user.lock();
        Some(f(&mut *entry))
    }

    /// Drop the user's entry if it holds neither a grant nor overrides.
    fn prune(&self, user_id: &str) {
        let mut users = self.users.write();
        let empty = users.get(user_id).map_or(false, |u| {
            let u = u.lock();
            u.grant.is_none() && u.overrides.is_empty()
        });
        if empty {
            users.remove(user_id);
        }
    }

    fn in_known_order(&self, types: &BTreeSet<String>) -> Vec<String> {
        self.known
            .iter()
            .filter(|k| types.contains(*k))
            .cloned()
            .collect()
    }

    /// Record a grant for `signal_types`, replacing any previous grant.
    pub fn register(
        &self,
        user_id: &str,
        signal_types: &[String],
        expiry: ConsentExpiry,
        now: DateTime<Utc>,
    ) -> Result<RegisterOutcome, ConsentError> {
        let requested: Vec<String> = if signal_types.is_empty() {
            if self.config.require_explicit {
                return Err(ConsentError::NoSignalTypesRequested);
            }
            self.known.clone()
        } else {
            signal_types.to_vec()
        };

        let (accepted, rejected): (Vec<String>, Vec<String>) =
            requested.into_iter().partition(|t| self.is_known(t));
        let accepted: BTreeSet<String> = accepted.into_iter().collect();
        let rejected: Vec<String> = rejected
            .into_iter()
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();

        if accepted.is_empty() {
            return Err(ConsentError::NoSupportedSignalTypes { rejected });
        }

        let expires_at = match expiry {
            ConsentExpiry::Default => self
                .config
                .default_expiry_days
                .map(|days| now + Duration::days(i64::from(days))),
            ConsentExpiry::Never => None,
            ConsentExpiry::At(at) => Some(at),
        };

        let registered = self.in_known_order(&accepted);
        let grant = ConsentGrant {
            user_id: user_id.to_string(),
            signal_types: accepted,
            expires_at,
            last_updated: now,
        };
        self.with_user_mut(user_id, |entry| entry.grant = Some(grant));

        tracing::info!(user_id, types = ?registered, "Consent registered");
        if !rejected.is_empty() {
            tracing::warn!(user_id, rejected = ?rejected, "Ignoring unsupported signal types");
        }

        Ok(RegisterOutcome {
            user_id: user_id.to_string(),
            registered,
            rejected,
            expires_at,
        })
    }

    /// Remove `signal_types` (all when `None`) from the user's grant.
    ///
    /// Revoking something that is not granted is not an error. An expired
    /// grant is deleted outright.
    pub fn revoke(
        &self,
        user_id: &str,
        signal_types: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> RevokeOutcome {
        let mut outcome = RevokeOutcome {
            user_id: user_id.to_string(),
            ..RevokeOutcome::default()
        };

        self.with_existing_user(user_id, |entry| {
            let Some(grant) = entry.grant.as_mut() else {
                return;
            };

            if grant.is_expired(now) {
                tracing::info!(user_id, "Removing expired consent");
                entry.grant = None;
                entry.overrides.clear();
                outcome.grant_removed = true;
            } else {
                let removed: BTreeSet<String> = match signal_types {
                    Some(types) => types
                        .iter()
                        .filter(|t| grant.signal_types.remove(t.as_str()))
                        .cloned()
                        .collect(),
                    None => std::mem::take(&mut grant.signal_types),
                };
                grant.last_updated = now;
                outcome.revoked = self.in_known_order(&removed);
                outcome.remaining = self.in_known_order(&grant.signal_types);

                if grant.signal_types.is_empty() {
                    entry.grant = None;
                    entry.overrides.clear();
                    outcome.grant_removed = true;
                }
            }
        });

        if outcome.grant_removed {
            self.prune(user_id);
        }
        if !outcome.revoked.is_empty() || outcome.grant_removed {
            tracing::info!(
                user_id,
                revoked = ?outcome.revoked,
                grant_removed = outcome.grant_removed,
                "Consent revoked"
            );
        }
        outcome
    }

    /// Consent state without side effects.
    pub fn status(&self, user_id: &str, now: DateTime<Utc>) -> ConsentStatus {
        let grant = self.user(user_id).and_then(|u| u.lock().grant.clone());

        match grant {
            None => ConsentStatus {
                has_consent: false,
                signal_types: Vec::new(),
                expires_at: None,
                expired_at: None,
                last_updated: None,
                message: Some("User has not authorized background collection".to_string()),
            },
            Some(grant) if grant.is_expired(now) => ConsentStatus {
                has_consent: false,
                signal_types: Vec::new(),
                expires_at: None,
                expired_at: grant.expires_at,
                last_updated: Some(grant.last_updated),
                message: Some("User authorization has expired".to_string()),
            },
            Some(grant) => ConsentStatus {
                has_consent: true,
                signal_types: self.in_known_order(&grant.signal_types),
                expires_at: grant.expires_at,
                expired_at: None,
                last_updated: Some(grant.last_updated),
                message: None,
            },
        }
    }

    /// The stored grant, expired or not.
    pub fn grant(&self, user_id: &str) -> Option<ConsentGrant> {
        self.user(user_id).and_then(|u| u.lock().grant.clone())
    }

    /// Active signal types in registration order; empty when none or expired.
    pub fn active_types(&self, user_id: &str, now: DateTime<Utc>) -> Vec<String> {
        match self.grant(user_id) {
            Some(grant) if !grant.is_expired(now) => self.in_known_order(&grant.signal_types),
            _ => Vec::new(),
        }
    }

    pub fn is_active(&self, user_id: &str, signal_type: &str, now: DateTime<Utc>) -> bool {
        self.grant(user_id)
            .map_or(false, |g| g.is_active(signal_type, now))
    }

    /// Users with at least one active signal type.
    pub fn active_users(&self, now: DateTime<Utc>) -> Vec<String> {
        let users: Vec<(String, Arc<Mutex<UserConsent>>)> = self
            .users
            .read()
            .iter()
            .map(|(id, u)| (id.clone(), Arc::clone(u)))
            .collect();

        let mut active: Vec<String> = users
            .into_iter()
            .filter(|(_, u)| {
                u.lock()
                    .grant
                    .as_ref()
                    .map_or(false, |g| !g.is_expired(now) && !g.signal_types.is_empty())
            })
            .map(|(id, _)| id)
            .collect();
        active.sort();
        active
    }

    /// Store interval overrides, clamped to
    /// [`MIN_OVERRIDE_INTERVAL_SECS`]..=[`MAX_OVERRIDE_INTERVAL_SECS`].
    pub fn set_interval_overrides(
        &self,
        user_id: &str,
        intervals: &BTreeMap<String, u64>,
    ) -> OverrideOutcome {
        let mut outcome = OverrideOutcome::default();
        for (signal_type, secs) in intervals {
            if self.is_known(signal_type) {
                outcome.applied.insert(
                    signal_type.clone(),
                    (*secs).clamp(MIN_OVERRIDE_INTERVAL_SECS, MAX_OVERRIDE_INTERVAL_SECS),
                );
            } else {
                outcome.not_applied.push(signal_type.clone());
            }
        }

        if outcome.applied.is_empty() {
            outcome.current = self
                .user(user_id)
                .map(|u| u.lock().overrides.clone())
                .unwrap_or_default();
        } else {
            let applied = outcome.applied.clone();
            outcome.current = self.with_user_mut(user_id, |entry| {
                entry.overrides.extend(applied);
                entry.overrides.clone()
            });
        }

        tracing::info!(
            user_id,
            applied = ?outcome.applied,
            not_applied = ?outcome.not_applied,
            "Interval overrides updated"
        );
        outcome
    }

    /// Override for one signal type, in seconds.
    pub fn interval_override(&self, user_id: &str, signal_type: &str) -> Option<u64> {
        self.user(user_id)
            .and_then(|u| u.lock().overrides.get(signal_type).copied())
    }

    /// Delete every expired grant. Returns the affected users.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let users: Vec<(String, Arc<Mutex<UserConsent>>)> = self
            .users
            .read()
            .iter()
            .map(|(id, u)| (id.clone(), Arc::clone(u)))
            .collect();

        let mut removed = Vec::new();
        for (user_id, user) in users {
            let mut entry = user.lock();
            if entry.grant.as_ref().map_or(false, |g| g.is_expired(now)) {
                entry.grant = None;
                entry.overrides.clear();
                removed.push(user_id);
            }
        }

        for user_id in &removed {
            self.prune(user_id);
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Swept expired consent grants");
        }
        removed.sort();
        removed
    }
}
