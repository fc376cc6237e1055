//! Wire types for the tunnel registry
//!
//! Shared by the registry HTTP surface, the desktop agent and the discovery
//! client that runs inside each per-user proxy. All JSON is camelCase.

pub mod stats;
pub mod tunnel;

pub use stats::{ErrorResponse, HealthResponse, RegistryStats};
pub use tunnel::{
    DiscoverResponse, RegisterTunnelResponse, SuccessResponse, TunnelDetails, TunnelHealth,
    TunnelInfo,
};

/// Collection route: `POST` registers a tunnel
pub const TUNNELS_PATH: &str = "/tunnels";

/// Discovery route for the caller's own tunnel
pub const DISCOVER_PATH: &str = "/tunnels/me";

/// Operator statistics route
pub const STATS_PATH: &str = "/tunnels/stats";

/// Unauthenticated liveness route
pub const HEALTH_PATH: &str = "/health";

/// Route for a single tunnel (`DELETE` unregisters)
pub fn tunnel_path(tunnel_id: &str) -> String {
    format!("{}/{}", TUNNELS_PATH, tunnel_id)
}

/// Route for a tunnel heartbeat
pub fn heartbeat_path(tunnel_id: &str) -> String {
    format!("{}/{}/heartbeat", TUNNELS_PATH, tunnel_id)
}
