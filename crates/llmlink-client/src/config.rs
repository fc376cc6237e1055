//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::routing_policy::ExecutionContext;

/// Default address of the local LLM runtime
pub const DEFAULT_DIRECT_URL: &str = "http://localhost:11434";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Discovery polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Base URL of the tunnel registry
    pub registry_url: String,
    /// Background poll period, independent of request traffic
    #[serde(with = "duration_secs", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Cache age after which the request path triggers a refresh
    #[serde(with = "duration_secs", default = "default_freshness_threshold")]
    pub freshness_threshold: Duration,
    /// Upper bound for one registry round trip
    #[serde(with = "duration_secs", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Failed client-side probes before the cached tunnel is considered unhealthy
    #[serde(default = "default_tunnel_failure_threshold")]
    pub tunnel_failure_threshold: u32,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_freshness_threshold() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_tunnel_failure_threshold() -> u32 {
    3
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

impl DiscoveryConfig {
    pub fn new(registry_url: impl Into<String>) -> Self {
        Self {
            registry_url: registry_url.into(),
            poll_interval: default_poll_interval(),
            freshness_threshold: default_freshness_threshold(),
            request_timeout: default_request_timeout(),
            tunnel_failure_threshold: default_tunnel_failure_threshold(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_freshness_threshold(mut self, threshold: Duration) -> Self {
        self.freshness_threshold = threshold;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tunnel_failure_threshold(mut self, threshold: u32) -> Self {
        self.tunnel_failure_threshold = threshold;
        self
    }
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }
        if self.freshness_threshold.is_zero() {
            return Err(ConfigError::Zero("freshness_threshold"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero("request_timeout"));
        }
        if self.tunnel_failure_threshold == 0 {
            return Err(ConfigError::Zero("tunnel_failure_threshold"));
        }
        Ok(())
    }
}

/// Endpoint selection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionManagerConfig {
    pub execution_context: ExecutionContext,
    /// Local LLM runtime, `None` disables direct connections entirely
    pub direct_url: Option<String>,
    /// Period of the direct reachability monitor
    pub direct_check_interval: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            execution_context: ExecutionContext::Desktop,
            direct_url: Some(DEFAULT_DIRECT_URL.to_string()),
            direct_check_interval: Duration::from_secs(30),
        }
    }
}

impl ConnectionManagerConfig {
    pub fn new(execution_context: ExecutionContext) -> Self {
        Self {
            execution_context,
            ..Default::default()
        }
    }

    pub fn with_direct_url(mut self, direct_url: Option<String>) -> Self {
        self.direct_url = direct_url;
        self
    }

    pub fn with_direct_check_interval(mut self, interval: Duration) -> Self {
        self.direct_check_interval = interval;
        self
    }
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.direct_check_interval.is_zero() {
            return Err(ConfigError::Zero("direct_check_interval"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_defaults() {
        let config = DiscoveryConfig::new("https://registry.example");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.freshness_threshold, Duration::from_secs(60));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.tunnel_failure_threshold, 3);
    }

    #[test]
    fn test_discovery_from_yaml() {
        let yaml = "registry_url: https://registry.example\npoll_interval: 5\n";
        let config: DiscoveryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_values_rejected() {
        let base = DiscoveryConfig::new("https://registry.example");
        assert!(base.validate().is_ok());

        assert_eq!(
            base.clone().with_poll_interval(Duration::ZERO).validate(),
            Err(ConfigError::Zero("poll_interval"))
        );
        assert_eq!(
            base.clone().with_freshness_threshold(Duration::ZERO).validate(),
            Err(ConfigError::Zero("freshness_threshold"))
        );
        assert_eq!(
            base.clone().with_request_timeout(Duration::ZERO).validate(),
            Err(ConfigError::Zero("request_timeout"))
        );
        assert_eq!(
            base.with_tunnel_failure_threshold(0).validate(),
            Err(ConfigError::Zero("tunnel_failure_threshold"))
        );

        let config = ConnectionManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.with_direct_check_interval(Duration::ZERO).validate(),
            Err(ConfigError::Zero("direct_check_interval"))
        );
    }

    #[test]
    fn test_zero_from_yaml_rejected() {
        let yaml = "registry_url: https://registry.example\npoll_interval: 0\n";
        let config: DiscoveryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::Zero("poll_interval")));
    }

    #[test]
    fn test_connection_manager_defaults() {
        let config = ConnectionManagerConfig::new(ExecutionContext::Browser);
        assert_eq!(config.execution_context, ExecutionContext::Browser);
        assert_eq!(config.direct_url.as_deref(), Some(DEFAULT_DIRECT_URL));

        let config = config.with_direct_url(None);
        assert!(config.direct_url.is_none());
    }
}
