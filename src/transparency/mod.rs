//! Transparency module for the consent collector.
//!
//! This module provides tools for tracking and exposing what data
//! the collector gathers, supporting user trust and regulatory compliance.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, CollectionEvent, Gauge, MetricsSink,
    NoopMetrics, SharedTransparencyLog, TransparencyLog, TransparencyStats,
};
