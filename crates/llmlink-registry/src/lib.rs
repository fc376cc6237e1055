//! Tunnel registry
//!
//! Single source of truth for "which public tunnel, if any, currently
//! represents user U's local LLM". Desktop agents register and heartbeat;
//! per-user proxies discover. A background [`HealthMonitor`] marks tunnels
//! unhealthy and evicts the ones whose heartbeats went stale.

pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod probe;
pub mod record;
pub mod registry;

pub use config::{ConfigError, RegistryConfig};
pub use error::RegistryError;
pub use events::RegistryEvent;
pub use monitor::HealthMonitor;
pub use probe::{HealthProbe, HttpHealthProbe, NoopProbe, ProbeError};
pub use record::{validate_tunnel_info, HealthStatus, TunnelRecord};
pub use registry::{HealthCheckSummary, TunnelRegistry};
