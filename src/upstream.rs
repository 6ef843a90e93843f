//! Destinations for drained cache batches.

use crate::core::cache::SyncBatch;
use std::path::PathBuf;

/// Upstream delivery errors.
#[derive(Debug)]
pub enum UpstreamError {
    Io(std::io::Error),
    Serialize(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Io(e) => write!(f, "Upstream write failed: {e}"),
            UpstreamError::Serialize(e) => write!(f, "Upstream serialization failed: {e}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<std::io::Error> for UpstreamError {
    fn from(e: std::io::Error) -> Self {
        UpstreamError::Io(e)
    }
}

/// Receives batches drained from the cache.
pub trait UpstreamSink: Send + Sync {
    fn deliver(&self, batch: &SyncBatch) -> Result<(), UpstreamError>;
}

/// Logs a one-line summary of every batch and discards it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingUpstream;

impl UpstreamSink for LoggingUpstream {
    fn deliver(&self, batch: &SyncBatch) -> Result<(), UpstreamError> {
        tracing::info!(
            user_id = %batch.user_id,
            samples = batch.total(),
            counts = ?batch.counts(),
            "Sync batch ready for upstream"
        );
        Ok(())
    }
}

/// Writes each batch as `sync_<user>_<timestamp>.json` under a directory.
/// Payloads stay encrypted.
#[derive(Debug, Clone)]
pub struct FileUpstream {
    dir: PathBuf,
}

impl FileUpstream {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn file_name(batch: &SyncBatch) -> String {
        let user: String = batch
            .user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!(
            "sync_{}_{}.json",
            user,
            batch.synced_at.format("%Y%m%dT%H%M%S%.6fZ")
        )
    }
}

impl UpstreamSink for FileUpstream {
    fn deliver(&self, batch: &SyncBatch) -> Result<(), UpstreamError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::file_name(batch));
        let json = serde_json::to_string_pretty(batch)
            .map_err(|e| UpstreamError::Serialize(e.to_string()))?;
        std::fs::write(&path, json)?;
        tracing::debug!(path = %path.display(), samples = batch.total(), "Wrote sync batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::types::Payload;
    use crate::core::cache::SecureCache;
    use crate::core::cipher::AesGcmCipher;
    use std::sync::Arc;

    fn batch() -> SyncBatch {
        let cache = SecureCache::with_cipher(10, Arc::new(AesGcmCipher::from_seed("up")));
        let mut payload = Payload::new();
        payload.insert("pulse_rate".to_string(), 72.into());
        cache.write("user/1", "pulse", &payload).unwrap();
        cache.sync("user/1").unwrap()
    }

    #[test]
    fn test_logging_upstream_accepts() {
        assert!(LoggingUpstream.deliver(&batch()).is_ok());
    }

    #[test]
    fn test_file_upstream_writes_batch() {
        let dir = std::env::temp_dir().join(format!("consent-collector-upstream-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let sink = FileUpstream::new(&dir);
        let batch = batch();

        sink.deliver(&batch).unwrap();

        let files: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("sync_user_1_"));

        let content = std::fs::read_to_string(dir.join(&files[0])).unwrap();
        let parsed: SyncBatch = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.total(), 1);
        assert!(!content.contains("pulse_rate"));

        let _ = std::fs::remove_dir_all(dir);
    }
}
