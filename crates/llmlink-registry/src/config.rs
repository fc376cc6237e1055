//! Registry timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error(
        "staleness window ({staleness:?}) must exceed the heartbeat interval ({heartbeat:?}) by at least half an interval"
    )]
    StalenessTooShort {
        heartbeat: Duration,
        staleness: Duration,
    },
}

/// Heartbeat, staleness and health-check timing
///
/// Durations are (de)serialized as whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often desktop agents are expected to heartbeat
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a record is evicted
    #[serde(with = "duration_secs")]
    pub staleness_window: Duration,
    /// Period of the background health loop
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
    /// Consecutive failed checks before a tunnel is hidden from discovery
    pub failure_threshold: u32,
    /// Upper bound for a single reachability probe
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
    /// Probe each tunnel's public URL in addition to heartbeat recency
    pub probe_enabled: bool,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(30);
        Self {
            heartbeat_interval,
            staleness_window: heartbeat_interval * 3,
            health_check_interval: Duration::from_secs(15),
            failure_threshold: 3,
            probe_timeout: Duration::from_secs(5),
            probe_enabled: false,
        }
    }
}

impl RegistryConfig {
    /// Config with the staleness window set to `multiplier` heartbeat intervals
    pub fn with_heartbeat(heartbeat_interval: Duration, multiplier: u32) -> Self {
        Self {
            heartbeat_interval,
            staleness_window: heartbeat_interval * multiplier,
            ..Default::default()
        }
    }

    /// A heartbeat older than this counts as missed
    ///
    /// One interval plus half an interval of jitter tolerance.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_interval / 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::Zero("health_check_interval"));
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Zero("probe_timeout"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure_threshold"));
        }
        if self.staleness_window <= self.heartbeat_deadline() {
            return Err(ConfigError::StalenessTooShort {
                heartbeat: self.heartbeat_interval,
                staleness: self.staleness_window,
            });
        }
        Ok(())
    }
}
