//! Engine configuration.
//!
//! The defaults match the limits of the hosted state service the engine was
//! built against: one submission per 50ms, and deltas kept under roughly
//! 2KB of JSON or 15 keys.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Delta queue limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum spacing between two submissions.
    #[serde(with = "millis")]
    pub min_spacing: Duration,
    /// Gap enforced after the last submission when an idle queue wakes up
    /// inside `min_spacing`.
    #[serde(with = "millis")]
    pub resume_window: Duration,
    /// Serialized size (updates JSON + deletions JSON) at which a batch is split.
    pub chunk_char_budget: usize,
    /// Maximum update keys, and separately deletions, per chunk.
    pub chunk_max_keys: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(50),
            resume_window: Duration::from_millis(100),
            chunk_char_budget: 2048,
            chunk_max_keys: 15,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identifier stamped on this client's moves.
    pub client_id: String,
    /// Buffered change notifications per subscriber.
    pub notification_capacity: usize,
    pub queue: QueueConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4().simple().to_string(),
            notification_capacity: 256,
            queue: QueueConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| SyncError::SnapshotParse(format!("Invalid configuration: {e}")))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();
        assert_eq!(config.min_spacing, Duration::from_millis(50));
        assert_eq!(config.resume_window, Duration::from_millis(100));
        assert_eq!(config.chunk_char_budget, 2048);
        assert_eq!(config.chunk_max_keys, 15);
    }

    #[test]
    fn test_client_ids_differ() {
        let a = SyncConfig::default();
        let b = SyncConfig::default();
        assert_ne!(a.client_id, b.client_id);
        assert_eq!(a.notification_capacity, 256);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"client_id": "me", "queue": {"min_spacing": 20}}"#).unwrap();
        assert_eq!(config.client_id, "me");
        assert_eq!(config.queue.min_spacing, Duration::from_millis(20));
        assert_eq!(config.queue.chunk_max_keys, 15);
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"notification_capacity": 8}}"#).unwrap();
        let config = SyncConfig::from_path(file.path()).unwrap();
        assert_eq!(config.notification_capacity, 8);
    }

    #[test]
    fn test_from_path_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(SyncConfig::from_path(file.path()).is_err());
    }
}
