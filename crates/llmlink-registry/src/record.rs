//! Tunnel records and their health

use chrono::{DateTime, Utc};
use llmlink_proto::{TunnelDetails, TunnelHealth, TunnelInfo};
use std::time::Duration;

use crate::error::RegistryError;

/// One registered tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelRecord {
    pub user_id: String,
    /// Generated at registration, never reused
    pub tunnel_id: String,
    pub public_url: String,
    pub local_url: String,
    pub share_token: String,
    pub protocol: Option<String>,
    pub user_agent: Option<String>,
    pub client_version: Option<String>,
    pub platform: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl TunnelRecord {
    /// Build a fresh record from an already validated payload
    pub fn new(user_id: String, tunnel_id: String, info: TunnelInfo) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            tunnel_id,
            public_url: info.public_url,
            local_url: info.local_url,
            share_token: info.share_token,
            protocol: info.protocol,
            user_agent: info.user_agent,
            client_version: info.client_version,
            platform: info.platform,
            registered_at: now,
            last_heartbeat_at: now,
        }
    }

    pub fn to_details(&self, health: &HealthStatus) -> TunnelDetails {
        TunnelDetails {
            tunnel_id: self.tunnel_id.clone(),
            user_id: self.user_id.clone(),
            public_url: self.public_url.clone(),
            local_url: self.local_url.clone(),
            share_token: self.share_token.clone(),
            protocol: self.protocol.clone(),
            user_agent: self.user_agent.clone(),
            client_version: self.client_version.clone(),
            platform: self.platform.clone(),
            registered_at: self.registered_at,
            last_heartbeat_at: self.last_heartbeat_at,
            health: health.to_wire(),
        }
    }
}

/// Health of one tunnel as maintained by the health loop
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_check_at: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            last_check_at: Utc::now(),
            response_time_ms: None,
        }
    }

    /// Any success resets the failure streak
    pub fn record_success(&mut self, response_time: Option<Duration>) {
        self.is_healthy = true;
        self.consecutive_failures = 0;
        self.last_check_at = Utc::now();
        if let Some(rtt) = response_time {
            self.response_time_ms = Some(rtt.as_millis() as u64);
        }
    }

    pub fn record_failure(&mut self, failure_threshold: u32) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.is_healthy = self.consecutive_failures < failure_threshold;
        self.last_check_at = Utc::now();
    }

    /// Whether discovery may hand this tunnel out
    pub fn is_discoverable(&self, failure_threshold: u32) -> bool {
        self.is_healthy && self.consecutive_failures < failure_threshold
    }

    pub fn to_wire(&self) -> TunnelHealth {
        TunnelHealth {
            is_healthy: self.is_healthy,
            consecutive_failures: self.consecutive_failures,
            last_check_at: self.last_check_at,
            response_time_ms: self.response_time_ms,
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Check the required registration fields
///
/// `publicUrl` and `localUrl` must be absolute http(s) URLs with a host;
/// `shareToken` must be non-empty and contain no whitespace.
pub fn validate_tunnel_info(info: &TunnelInfo) -> Result<(), RegistryError> {
    validate_url("publicUrl", &info.public_url)?;
    validate_url("localUrl", &info.local_url)?;

    let token = info.share_token.trim();
    if token.is_empty() {
        return Err(RegistryError::InvalidTunnelInfo(
            "shareToken is required".to_string(),
        ));
    }
    if token.len() != info.share_token.len() || token.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidTunnelInfo(
            "shareToken must not contain whitespace".to_string(),
        ));
    }

    Ok(())
}

fn validate_url(field: &str, value: &str) -> Result<(), RegistryError> {
    if value.trim().is_empty() {
        return Err(RegistryError::InvalidTunnelInfo(format!(
            "{} is required",
            field
        )));
    }

    let parsed = url::Url::parse(value).map_err(|e| {
        RegistryError::InvalidTunnelInfo(format!("{} is not a valid URL: {}", field, e))
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RegistryError::InvalidTunnelInfo(format!(
            "{} must use http or https, got '{}'",
            field,
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(RegistryError::InvalidTunnelInfo(format!(
            "{} has no host",
            field
        )));
    }

    Ok(())
}
