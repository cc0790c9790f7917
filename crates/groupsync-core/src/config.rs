//! Runtime configuration for group contexts

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GroupError, GroupResult};

/// Default capacity for the per-group event broadcast channel
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default deadline for a single log append
pub const DEFAULT_APPEND_TIMEOUT_MS: u64 = 10_000;

/// Default bound on cached message keys per device
pub const DEFAULT_MAX_SKIPPED_KEYS: usize = 1024;

/// Default number of entries applied per replication batch
pub const DEFAULT_REPLICATION_BATCH_SIZE: usize = 64;

/// Tunables shared by every store of a group context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Capacity of the event broadcast channel; lagging subscribers lose the
    /// oldest notifications once it is full
    pub event_channel_capacity: usize,
    /// Deadline for one append to the log substrate
    pub append_timeout_ms: u64,
    /// How far past its furthest derived position a device chain may be
    /// advanced in one step
    pub max_skipped_keys: usize,
    /// Maximum entries the replication consumer applies in one batch
    pub replication_batch_size: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            append_timeout_ms: DEFAULT_APPEND_TIMEOUT_MS,
            max_skipped_keys: DEFAULT_MAX_SKIPPED_KEYS,
            replication_batch_size: DEFAULT_REPLICATION_BATCH_SIZE,
        }
    }
}

impl GroupConfig {
    /// Build a configuration from defaults overridden by `GROUPSYNC_*`
    /// environment variables.
    pub fn from_env() -> GroupResult<Self> {
        let defaults = Self::default();
        let config = Self {
            event_channel_capacity: env_or("GROUPSYNC_EVENT_CAPACITY", defaults.event_channel_capacity)?,
            append_timeout_ms: env_or("GROUPSYNC_APPEND_TIMEOUT_MS", defaults.append_timeout_ms)?,
            max_skipped_keys: env_or("GROUPSYNC_MAX_SKIPPED_KEYS", defaults.max_skipped_keys)?,
            replication_batch_size: env_or(
                "GROUPSYNC_REPLICATION_BATCH",
                defaults.replication_batch_size,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the append deadline.
    pub fn with_append_timeout(mut self, timeout: Duration) -> Self {
        self.append_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Set the per-device message key bound.
    pub fn with_max_skipped_keys(mut self, max: usize) -> Self {
        self.max_skipped_keys = max;
        self
    }

    /// Append deadline as a [`Duration`].
    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }

    /// Reject values that would stall or disable a store.
    pub fn validate(&self) -> GroupResult<()> {
        if self.event_channel_capacity == 0 {
            return Err(GroupError::InvalidInput(
                "event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.append_timeout_ms == 0 {
            return Err(GroupError::InvalidInput(
                "append_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_skipped_keys == 0 {
            return Err(GroupError::InvalidInput(
                "max_skipped_keys must be greater than zero".to_string(),
            ));
        }
        if self.replication_batch_size == 0 {
            return Err(GroupError::InvalidInput(
                "replication_batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> GroupResult<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GroupError::InvalidInput(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GroupConfig::default();
        config.validate().unwrap();
        assert_eq!(config.append_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = GroupConfig::default().with_event_channel_capacity(0);
        assert!(matches!(config.validate(), Err(GroupError::InvalidInput(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GroupConfig = serde_json::from_str(r#"{"append_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.append_timeout_ms, 250);
        assert_eq!(config.event_channel_capacity, DEFAULT_EVENT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_env_parse_error() {
        let result = env_or::<u64>("GROUPSYNC_TEST_UNSET_VARIABLE", 7);
        assert_eq!(result.unwrap(), 7);
    }
}
