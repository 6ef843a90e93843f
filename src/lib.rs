//! Consent Collector - consent-driven adaptive background telemetry.
//!
//! This library samples per-user physiological and behavioral signals in the
//! background, only for signal types a user has explicitly consented to, at
//! intervals that stretch as the device battery drains. Samples are kept
//! encrypted in a small bounded cache and handed to a crisis-detection
//! collaborator as they arrive.
//!
//! # Privacy Guarantees
//!
//! - **Explicit consent**: nothing is sampled without a grant naming the signal type
//! - **Expiring consent**: grants lapse after a configurable number of days
//! - **Encrypted at rest**: cached payloads are AES-256-GCM encrypted
//! - **Bounded retention**: at most 100 samples per user and signal type
//! - **Transparency**: all collection is counted and auditable
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      CollectorService                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   events   ┌─────────────┐                  │
//! │  │   Consent   │───────────▶│ Worker pool │ one task / user  │
//! │  │  Registry   │◀───────────│ (scheduler) │                  │
//! │  └─────────────┘   gating   └─────────────┘                  │
//! │                               │         │                    │
//! │                        probes ▼         ▼ forward            │
//! │                      ┌─────────────┐ ┌─────────────┐         │
//! │                      │ SecureCache │ │   Crisis    │         │
//! │                      │ (encrypted) │ │   Bridge    │         │
//! │                      └─────────────┘ └─────────────┘         │
//! │                               │ sync                         │
//! │                               ▼                              │
//! │                      ┌─────────────┐  ┌─────────────┐        │
//! │                      │  Upstream   │  │Transparency │        │
//! │                      │    Sink     │  │    Log      │        │
//! │                      └─────────────┘  └─────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use consent_collector::{CollectorService, Config, ConsentExpiry};
//!
//! # async fn run() -> Result<(), consent_collector::CollectorError> {
//! let service = CollectorService::new(Config::default());
//! service.start()?;
//!
//! let types = vec!["pulse".to_string(), "sleep".to_string()];
//! service.register_consent("user-1", &types, ConsentExpiry::Default)?;
//!
//! let status = service.status("user-1");
//! println!("collecting: {}", status.is_collecting);
//!
//! service.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod context;
pub mod core;
pub mod crisis;
pub mod service;
pub mod transparency;
pub mod upstream;

// Re-export key types at crate root for convenience
pub use collector::{
    ActivityState, BatteryAdvisor, BatteryMode, FixedBattery, Payload, PrivacyLevel, ProbeError,
    ProbeRegistry, Sample, SignalProbe, SystemBattery,
};
pub use config::Config;
pub use context::CollectorContext;
pub use core::{
    AesGcmCipher, Cipher, ConsentExpiry, ConsentStatus, DataExport, SecureCache, SyncBatch,
    WorkerState,
};
pub use crisis::{BridgeError, CrisisAlertBridge, CrisisCollaborator, NoopCollaborator};
pub use service::{CollectionStatus, CollectorError, CollectorService, CollectorServiceBuilder};
pub use transparency::{
    CollectionEvent, MetricsSink, NoopMetrics, SharedTransparencyLog, TransparencyLog,
    TransparencyStats,
};
pub use upstream::{FileUpstream, LoggingUpstream, UpstreamError, UpstreamSink};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║            CONSENT COLLECTOR - PRIVACY DECLARATION               ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This collector samples wellbeing signals in the background.     ║
║                                                                  ║
║  ✓ WHAT WE COLLECT (only with your consent):                     ║
║    • Pulse, sleep, activity and environment readings             ║
║    • Voice features and vitals                                   ║
║    • Only the signal types you explicitly authorized             ║
║    • Less often when your battery is low                         ║
║                                                                  ║
║  ✗ WHAT WE NEVER DO:                                             ║
║    • Collect a signal type you did not authorize                 ║
║    • Keep collecting after consent is revoked or expires         ║
║    • Store readings unencrypted                                  ║
║    • Keep more than the 100 most recent readings per signal      ║
║                                                                  ║
║  You can revoke consent, export or clear your data at any time.  ║
║                                                                  ║
║  You can view collection statistics anytime with:                ║
║    consent-collector status                                      ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
