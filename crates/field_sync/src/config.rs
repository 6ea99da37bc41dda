//! Sync configuration: timer intervals, network deadlines and retry policy.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the engine, the connectivity monitor and the real-time
/// channel. Durations are stored in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Periodic sync interval while the real-time channel is down
    pub sync_interval_ms: u64,
    /// Periodic sync interval while the real-time channel is connected
    pub realtime_sync_interval_ms: u64,
    /// Interval between liveness probes
    pub probe_interval_ms: u64,
    /// Deadline for a single liveness probe
    pub probe_timeout_ms: u64,
    /// Consecutive probe failures before going offline
    pub probe_failure_threshold: u32,
    /// Deadline for fetches and negotiation
    pub read_timeout_ms: u64,
    /// Deadline for queued writes
    pub upload_timeout_ms: u64,
    /// Attempts a queued action gets before it is discarded
    pub max_retries: u32,
    /// Every Nth reconciliation cycle fetches everything
    pub full_resync_every: u64,
    /// Real-time reconnect delays; the last one repeats
    pub reconnect_backoff_ms: Vec<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 10_000,
            realtime_sync_interval_ms: 30_000,
            probe_interval_ms: 3_000,
            probe_timeout_ms: 3_000,
            probe_failure_threshold: 2,
            read_timeout_ms: 10_000,
            upload_timeout_ms: 30_000,
            max_retries: crate::queue::MAX_RETRIES,
            full_resync_every: crate::cursor::FULL_RESYNC_EVERY,
            reconnect_backoff_ms: vec![2_000, 4_000, 8_000, 15_000, 30_000],
        }
    }
}

impl SyncConfig {
    /// Load a config file.
    ///
    /// A missing file yields the defaults. A file that cannot be parsed is
    /// logged and also yields the defaults, so a bad edit never stops the
    /// client from syncing.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        match serde_json::from_str::<SyncConfig>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!("Failed to parse sync config, using defaults: {}", e);
                Ok(Self::default())
            }
        }
    }

    /// Reject values that would stall or spin the sync loops.
    pub fn validate(&self) -> SyncResult<()> {
        let intervals = [
            ("syncIntervalMs", self.sync_interval_ms),
            ("realtimeSyncIntervalMs", self.realtime_sync_interval_ms),
            ("probeIntervalMs", self.probe_interval_ms),
            ("probeTimeoutMs", self.probe_timeout_ms),
            ("readTimeoutMs", self.read_timeout_ms),
            ("uploadTimeoutMs", self.upload_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::Config(format!("{} must be greater than zero", name)));
        }
        if self.probe_failure_threshold == 0 {
            return Err(SyncError::Config("probeFailureThreshold must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(SyncError::Config("maxRetries must be at least 1".into()));
        }
        if self.full_resync_every == 0 {
            return Err(SyncError::Config("fullResyncEvery must be at least 1".into()));
        }
        if self.reconnect_backoff_ms.is_empty() {
            return Err(SyncError::Config("reconnectBackoffMs must not be empty".into()));
        }
        Ok(())
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = millis(interval);
        self
    }

    pub fn with_realtime_sync_interval(mut self, interval: Duration) -> Self {
        self.realtime_sync_interval_ms = millis(interval);
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval_ms = millis(interval);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = millis(timeout);
        self
    }

    pub fn with_probe_failure_threshold(mut self, threshold: u32) -> Self {
        self.probe_failure_threshold = threshold;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = millis(timeout);
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout_ms = millis(timeout);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_full_resync_every(mut self, cycles: u64) -> Self {
        self.full_resync_every = cycles;
        self
    }

    pub fn with_reconnect_backoff(mut self, delays: &[Duration]) -> Self {
        self.reconnect_backoff_ms = delays.iter().map(|d| millis(*d)).collect();
        self
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn realtime_sync_interval(&self) -> Duration {
        Duration::from_millis(self.realtime_sync_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Vec<Duration> {
        self.reconnect_backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval(), Duration::from_secs(10));
        assert_eq!(config.realtime_sync_interval(), Duration::from_secs(30));
        assert_eq!(config.probe_interval(), Duration::from_secs(3));
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.probe_failure_threshold, 2);
        assert_eq!(config.upload_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.full_resync_every, 5);
        assert_eq!(config.reconnect_backoff().last(), Some(&Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = SyncConfig::default()
            .with_sync_interval(Duration::from_secs(1))
            .with_read_timeout(Duration::from_millis(250))
            .with_max_retries(5)
            .with_reconnect_backoff(&[Duration::from_secs(1), Duration::from_secs(2)]);

        assert_eq!(config.sync_interval_ms, 1_000);
        assert_eq!(config.read_timeout_ms, 250);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.reconnect_backoff_ms, vec![1_000, 2_000]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SyncConfig::default().with_probe_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let config = SyncConfig::default().with_max_retries(0);
        assert!(config.validate().is_err());

        let config = SyncConfig::default().with_reconnect_backoff(&[]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_partial_and_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.json");
        assert_eq!(SyncConfig::load(&path).unwrap(), SyncConfig::default());

        std::fs::write(&path, r#"{"syncIntervalMs": 5000, "maxRetries": 4}"#).unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.sync_interval(), Duration::from_secs(5));
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.probe_failure_threshold, 2);

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap(), SyncConfig::default());
    }
}
