//! Tunnel registration and discovery messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Registration payload sent by the desktop agent
///
/// `publicUrl`, `localUrl` and `shareToken` are required; the registry
/// rejects the payload when any of them is empty or malformed. The rest is
/// descriptive metadata and never influences routing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    /// Externally reachable URL of the tunnel
    #[serde(default)]
    pub public_url: String,
    /// Loopback URL of the LLM runtime the tunnel represents
    #[serde(default)]
    pub local_url: String,
    /// Credential required to address the public endpoint
    #[serde(default)]
    pub share_token: String,
    /// Tunnel protocol as reported by the tunnel provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Desktop agent version
    #[serde(
        default,
        rename = "version",
        alias = "clientVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl TunnelInfo {
    pub fn new(
        public_url: impl Into<String>,
        local_url: impl Into<String>,
        share_token: impl Into<String>,
    ) -> Self {
        Self {
            public_url: public_url.into(),
            local_url: local_url.into(),
            share_token: share_token.into(),
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = Some(version.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }
}

/// Response to a successful registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RegisterTunnelResponse {
    pub tunnel_id: String,
}

/// Response to unregister and heartbeat calls
///
/// `success: false` is a benign outcome (unknown or superseded tunnel id),
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct SuccessResponse {
    pub success: bool,
}

/// Registry-side health as seen by the last health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct TunnelHealth {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_check_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

/// A registered tunnel as returned by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct TunnelDetails {
    pub tunnel_id: String,
    pub user_id: String,
    pub public_url: String,
    pub local_url: String,
    pub share_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub health: TunnelHealth,
}

/// Discovery result for the calling user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_info: Option<TunnelDetails>,
}

impl DiscoverResponse {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            tunnel_info: None,
        }
    }

    pub fn found(details: TunnelDetails) -> Self {
        Self {
            available: true,
            tunnel_info: Some(details),
        }
    }
}
