//! Encrypted, bounded, per-user sample cache.
//!
//! Every (user, signal type) pair owns a ring buffer holding at most
//! `capacity` encrypted samples; the oldest entry is evicted on overflow.
//! Buffers of one user share a mutex that is held only while the buffers are
//! mutated or copied. Encryption and decryption always happen outside it.

use crate::collector::types::{Payload, Sample};
use crate::core::cipher::{Cipher, CipherError};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// An encrypted sample as stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSample {
    pub id: Uuid,
    pub user_id: String,
    pub signal_type: String,
    pub timestamp: DateTime<Utc>,
    /// Nonce-prefixed ciphertext of the JSON payload
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Samples dropped from the front to stay within capacity
    pub evicted: usize,
}

/// Decrypted buffers of one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataExport {
    pub user_id: String,
    pub exported_at: DateTime<Utc>,
    pub samples: BTreeMap<String, Vec<Sample>>,
    pub counts: BTreeMap<String, usize>,
}

impl DataExport {
    pub fn signal_types(&self) -> Vec<String> {
        self.samples.keys().cloned().collect()
    }
}

/// Samples drained from the cache for upstream delivery. Still encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatch {
    pub user_id: String,
    pub synced_at: DateTime<Utc>,
    pub samples: BTreeMap<String, Vec<CachedSample>>,
}

impl SyncBatch {
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.samples
            .iter()
            .map(|(t, s)| (t.clone(), s.len()))
            .collect()
    }

    pub fn total(&self) -> usize {
        self.samples.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Cache errors.
#[derive(Debug)]
pub enum CacheError {
    /// No cipher has been installed yet
    EncryptionNotConfigured,
    Cipher(CipherError),
    Serialization(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::EncryptionNotConfigured => write!(f, "Encryption is not configured"),
            CacheError::Cipher(e) => write!(f, "Cache cipher error: {e}"),
            CacheError::Serialization(msg) => write!(f, "Cache serialization error: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<CipherError> for CacheError {
    fn from(e: CipherError) -> Self {
        CacheError::Cipher(e)
    }
}

#[derive(Default)]
struct UserBuffers {
    buffers: BTreeMap<String, VecDeque<CachedSample>>,
    last_sync: Option<DateTime<Utc>>,
}

/// Encrypted sample cache shared by all workers.
pub struct SecureCache {
    capacity: usize,
    cipher: RwLock<Option<Arc<dyn Cipher>>>,
    users: RwLock<HashMap<String, Arc<Mutex<UserBuffers>>>>,
}

impl SecureCache {
    /// Create a cache without a cipher. Writes fail until one is installed.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            cipher: RwLock::new(None),
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_cipher(capacity: usize, cipher: Arc<dyn Cipher>) -> Self {
        let cache = Self::new(capacity);
        cache.install_cipher(cipher);
        cache
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn install_cipher(&self, cipher: Arc<dyn Cipher>) {
        *self.cipher.write() = Some(cipher);
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.read().is_some()
    }

    fn cipher(&self) -> Result<Arc<dyn Cipher>, CacheError> {
        self.cipher
            .read()
            .clone()
            .ok_or(CacheError::EncryptionNotConfigured)
    }

    fn user(&self, user_id: &str) -> Option<Arc<Mutex<UserBuffers>>> {
        self.users.read().get(user_id).cloned()
    }

    /// Mutate the user's buffers, creating the entry if needed. The map lock
    /// is held throughout so a concurrent [`SecureCache::clear`] cannot detach
    /// the entry mid-write.
    fn with_user_mut<R>(&self, user_id: &str, f: impl FnOnce(&mut UserBuffers) -> R) -> R {
        {
            let users = self.users.read();
            if let Some(user) = users.get(user_id) {
                let mut state = user.lock();
                return f(&mut *state);
            }
        }
        let mut users = self.users.write();
        let user = users.entry(user_id.to_string()).or_default();
        let mut state = user.lock();
        f(&mut *state)
    }

    /// Encrypt and append a sample, evicting the oldest entries beyond capacity.
    pub fn write(
        &self,
        user_id: &str,
        signal_type: &str,
        payload: &Payload,
    ) -> Result<WriteReceipt, CacheError> {
        let cipher = self.cipher()?;
        let plaintext =
            serde_json::to_vec(payload).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let ciphertext = cipher.encrypt(&plaintext)?;

        let capacity = self.capacity;
        let receipt = self.with_user_mut(user_id, |state| {
            let buffer = state.buffers.entry(signal_type.to_string()).or_default();

            let mut timestamp = Utc::now();
            if let Some(newest) = buffer.back() {
                if timestamp <= newest.timestamp {
                    timestamp = newest.timestamp + Duration::microseconds(1);
                }
            }

            let id = Uuid::new_v4();
            buffer.push_back(CachedSample {
                id,
                user_id: user_id.to_string(),
                signal_type: signal_type.to_string(),
                timestamp,
                ciphertext,
            });

            let mut evicted = 0;
            while buffer.len() > capacity {
                buffer.pop_front();
                evicted += 1;
            }

            WriteReceipt {
                id,
                timestamp,
                evicted,
            }
        });
        Ok(receipt)
    }

    /// Up to `limit` most recent samples, oldest first.
    ///
    /// Returns `None` when the buffer does not exist or is empty.
    pub fn read_recent(
        &self,
        user_id: &str,
        signal_type: &str,
        limit: usize,
    ) -> Result<Option<Vec<Sample>>, CacheError> {
        let Some(user) = self.user(user_id) else {
            return Ok(None);
        };

        let entries: Vec<CachedSample> = {
            let state = user.lock();
            match state.buffers.get(signal_type) {
                Some(buffer) if !buffer.is_empty() => {
                    let skip = buffer.len().saturating_sub(limit);
                    buffer.iter().skip(skip).cloned().collect()
                }
                _ => return Ok(None),
            }
        };

        self.decrypt_all(&entries).map(Some)
    }

    /// Decrypt every buffered sample for `signal_types` (all types when `None`
    /// or empty). Does not clear anything.
    pub fn export(
        &self,
        user_id: &str,
        signal_types: Option<&[String]>,
    ) -> Result<Option<DataExport>, CacheError> {
        let Some(user) = self.user(user_id) else {
            return Ok(None);
        };

        let copied: BTreeMap<String, Vec<CachedSample>> = {
            let state = user.lock();
            state
                .buffers
                .iter()
                .filter(|(_, b)| !b.is_empty())
                .filter(|(t, _)| match signal_types {
                    Some(types) if !types.is_empty() => types.contains(t),
                    _ => true,
                })
                .map(|(t, b)| (t.clone(), b.iter().cloned().collect()))
                .collect()
        };

        if copied.is_empty() {
            return Ok(None);
        }

        let mut samples = BTreeMap::new();
        for (signal_type, entries) in copied {
            samples.insert(signal_type, self.decrypt_all(&entries)?);
        }
        let counts = samples
            .iter()
            .map(|(t, s): (&String, &Vec<Sample>)| (t.clone(), s.len()))
            .collect();

        Ok(Some(DataExport {
            user_id: user_id.to_string(),
            exported_at: Utc::now(),
            samples,
            counts,
        }))
    }

    /// Drain all buffers of a user and stamp the last-sync time.
    ///
    /// Returns `None` when the cache holds nothing for the user.
    pub fn sync(&self, user_id: &str) -> Option<SyncBatch> {
        let user = self.user(user_id)?;
        let mut state = user.lock();
        let synced_at = Utc::now();

        let samples = state
            .buffers
            .iter_mut()
            .filter(|(_, b)| !b.is_empty())
            .map(|(t, b)| (t.clone(), std::mem::take(b).into_iter().collect()))
            .collect();
        state.last_sync = Some(synced_at);

        Some(SyncBatch {
            user_id: user_id.to_string(),
            synced_at,
            samples,
        })
    }

    /// Remove buffers for `signal_types` (all when `None` or empty).
    ///
    /// Returns the cleared types, or `None` when the user has no data.
    pub fn clear(&self, user_id: &str, signal_types: Option<&[String]>) -> Option<Vec<String>> {
        match signal_types {
            Some(types) if !types.is_empty() => {
                let user = self.user(user_id)?;
                let mut state = user.lock();
                let cleared: Vec<String> = types
                    .iter()
                    .filter(|t| state.buffers.remove(t.as_str()).is_some())
                    .cloned()
                    .collect();
                Some(cleared)
            }
            _ => {
                let mut users = self.users.write();
                let user = users.remove(user_id)?;
                let state = user.lock();
                Some(state.buffers.keys().cloned().collect())
            }
        }
    }

    /// Buffered sample count per signal type.
    pub fn counts(&self, user_id: &str) -> BTreeMap<String, usize> {
        self.user(user_id)
            .map(|user| {
                user.lock()
                    .buffers
                    .iter()
                    .map(|(t, b)| (t.clone(), b.len()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_sync(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.user(user_id).and_then(|user| user.lock().last_sync)
    }

    /// Users with a cache entry.
    pub fn users(&self) -> Vec<String> {
        self.users.read().keys().cloned().collect()
    }

    fn decrypt_all(&self, entries: &[CachedSample]) -> Result<Vec<Sample>, CacheError> {
        let cipher = self.cipher()?;
        entries
            .iter()
            .map(|entry| {
                let plaintext = cipher.decrypt(&entry.ciphertext)?;
                let payload: Payload = serde_json::from_slice(&plaintext)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                Ok(Sample {
                    id: entry.id,
                    signal_type: entry.signal_type.clone(),
                    timestamp: entry.timestamp,
                    payload,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for SecureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCache")
            .field("capacity", &self.capacity)
            .field("has_cipher", &self.has_cipher())
            .field("users", &self.users.read().len())
            .finish()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
