//! Proxy-side tunnel discovery and endpoint selection
//!
//! A [`DiscoveryService`] polls the registry for one user's tunnel, a
//! [`ConnectionManager`] turns its cache into the endpoint the LLM request
//! path should use, and [`ClientRoutingPolicy`] vetoes choices the calling
//! environment must never attempt.

pub mod config;
pub mod connection_manager;
pub mod discovery;
pub mod error;
pub mod probe;
pub mod routing_policy;

pub use config::{ConfigError, ConnectionManagerConfig, DiscoveryConfig, DEFAULT_DIRECT_URL};
pub use connection_manager::{
    default_strategies, ConnectionManager, ConnectionMode, ConnectionStatus, DirectMonitor,
    DirectStrategy, Endpoint, EndpointStrategy, SelectionContext, TunnelStrategy,
};
pub use discovery::{
    DiscoveredTunnel, DiscoveryPoller, DiscoveryService, DiscoveryStats, HttpRegistryClient,
    InProcessRegistryClient, RegistryClient,
};
pub use error::{ConnectionError, DiscoveryError, ProbeError};
pub use probe::{EndpointProbe, HttpEndpointProbe};
pub use routing_policy::{
    ClientRoutingPolicy, ConnectionAvailability, ConnectionType, ExecutionContext,
};
