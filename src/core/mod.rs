//! Core functionality for the consent collector.
//!
//! This module contains:
//! - The consent registry with expiring per-signal grants
//! - The encrypted, bounded sample cache and its cipher
//! - User state detection from cached samples
//! - The adaptive per-user scheduler and its worker pool

pub mod cache;
pub mod cipher;
pub mod consent;
pub mod scheduler;
pub mod state;

// Re-export commonly used types
pub use cache::{CacheError, CachedSample, DataExport, SecureCache, SyncBatch, WriteReceipt};
pub use cipher::{AesGcmCipher, Cipher, CipherError};
pub use consent::{
    ConsentError, ConsentEvent, ConsentExpiry, ConsentGrant, ConsentRegistry, ConsentStatus,
    OverrideOutcome, RegisterOutcome, RevokeOutcome, MIN_OVERRIDE_INTERVAL_SECS,
};
pub use scheduler::{effective_interval, WorkerPool, WorkerState};
pub use state::UserStateDetector;
