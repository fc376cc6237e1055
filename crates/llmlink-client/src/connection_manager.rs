//! Endpoint selection for the LLM request path
//!
//! Selection walks an ordered list of strategies and takes the first one
//! that yields an endpoint the routing policy allows. The default order is
//! tunnel, then direct; when neither applies the request path gets the
//! "unavailable" sentinel and fails fast.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConnectionManagerConfig};
use crate::discovery::{DiscoveredTunnel, DiscoveryService, DiscoveryStats};
use crate::error::ConnectionError;
use crate::probe::EndpointProbe;
use crate::routing_policy::{ClientRoutingPolicy, ConnectionType, ExecutionContext};

/// Transport currently selected to reach the user's LLM runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Tunnel,
    Direct,
    None,
}

impl ConnectionMode {
    pub fn connection_type(self) -> ConnectionType {
        match self {
            ConnectionMode::Tunnel => ConnectionType::CloudTunnel,
            ConnectionMode::Direct => ConnectionType::Direct,
            ConnectionMode::None => ConnectionType::None,
        }
    }
}

/// Where to send an LLM request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub mode: ConnectionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Credential for addressing a tunnel endpoint
    #[serde(skip)]
    pub share_token: Option<String>,
}

impl Endpoint {
    /// Sentinel for "nothing to connect to"
    pub fn unavailable() -> Self {
        Self {
            mode: ConnectionMode::None,
            url: None,
            share_token: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.mode != ConnectionMode::None
    }
}

/// Snapshot a strategy decides from
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    pub execution_context: ExecutionContext,
    pub tunnel: Option<&'a DiscoveredTunnel>,
    pub direct_url: Option<&'a str>,
    pub direct_reachable: bool,
}

/// One way of reaching the LLM runtime
pub trait EndpointStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Policy category, used for the routing veto
    fn connection_type(&self) -> ConnectionType;

    fn select(&self, ctx: &SelectionContext<'_>) -> Option<Endpoint>;
}

/// The discovered tunnel, when healthy
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelStrategy;

impl EndpointStrategy for TunnelStrategy {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::CloudTunnel
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> Option<Endpoint> {
        let tunnel = ctx.tunnel.filter(|t| t.is_usable())?;
        Some(Endpoint {
            mode: ConnectionMode::Tunnel,
            url: Some(tunnel.tunnel.public_url.clone()),
            share_token: Some(tunnel.tunnel.share_token.clone()),
        })
    }
}

/// The configured local runtime, when reachable
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectStrategy;

impl EndpointStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Direct
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> Option<Endpoint> {
        if !ctx.direct_reachable {
            return None;
        }
        ctx.direct_url.map(|url| Endpoint {
            mode: ConnectionMode::Direct,
            url: Some(url.to_string()),
            share_token: None,
        })
    }
}

/// Default strategy order: tunnel first, then direct
pub fn default_strategies() -> Vec<Box<dyn EndpointStrategy>> {
    vec![Box::new(TunnelStrategy), Box::new(DirectStrategy)]
}

/// Snapshot returned by [`ConnectionManager::get_status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connection_mode: ConnectionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    #[serde(rename = "zrokAvailable")]
    pub tunnel_available: bool,
    pub direct_available: bool,
    pub discovery_stats: DiscoveryStats,
}

/// Picks the endpoint for one user's LLM requests
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    discovery: Arc<DiscoveryService>,
    strategies: Vec<Box<dyn EndpointStrategy>>,
    direct_probe: Option<Arc<dyn EndpointProbe>>,
    direct_reachable: AtomicBool,
    mode_tx: watch::Sender<ConnectionMode>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionManagerConfig, discovery: Arc<DiscoveryService>) -> Self {
        Self::with_strategies(config, discovery, default_strategies())
    }

    pub fn with_strategies(
        config: ConnectionManagerConfig,
        discovery: Arc<DiscoveryService>,
        strategies: Vec<Box<dyn EndpointStrategy>>,
    ) -> Self {
        // Without a probe a configured direct URL is trusted
        let direct_reachable = config.direct_url.is_some();
        let (mode_tx, _) = watch::channel(ConnectionMode::None);

        Self {
            config,
            discovery,
            strategies,
            direct_probe: None,
            direct_reachable: AtomicBool::new(direct_reachable),
            mode_tx,
        }
    }

    /// Verify direct reachability with `probe` instead of trusting the config
    ///
    /// Direct stays unavailable until the first [`ConnectionManager::check_direct`].
    pub fn with_direct_probe(mut self, probe: Arc<dyn EndpointProbe>) -> Self {
        self.direct_probe = Some(probe);
        self.direct_reachable.store(false, Ordering::Release);
        self
    }

    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.config
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    /// Receive the connection mode whenever a selection changes it
    pub fn subscribe(&self) -> watch::Receiver<ConnectionMode> {
        self.mode_tx.subscribe()
    }

    pub fn is_direct_reachable(&self) -> bool {
        self.direct_reachable.load(Ordering::Acquire)
    }

    /// Best endpoint for the current discovery snapshot
    ///
    /// Deterministic: without an intervening state change repeated calls
    /// return the same endpoint.
    pub fn get_best_endpoint(&self) -> Endpoint {
        let cached = self.discovery.cached();
        self.select(cached.as_ref())
    }

    fn select(&self, tunnel: Option<&DiscoveredTunnel>) -> Endpoint {
        let ctx = SelectionContext {
            execution_context: self.config.execution_context,
            tunnel,
            direct_url: self.config.direct_url.as_deref(),
            direct_reachable: self.is_direct_reachable(),
        };

        let endpoint = self
            .strategies
            .iter()
            .filter(|s| ClientRoutingPolicy::permits(ctx.execution_context, s.connection_type()))
            .find_map(|strategy| {
                let endpoint = strategy.select(&ctx)?;
                let url = endpoint.url.as_deref().unwrap_or_default();
                if ClientRoutingPolicy::permits_url(ctx.execution_context, url) {
                    Some(endpoint)
                } else {
                    debug!(
                        strategy = strategy.name(),
                        url = %url,
                        context = %ctx.execution_context,
                        "Endpoint vetoed by routing policy"
                    );
                    None
                }
            })
            .unwrap_or_else(Endpoint::unavailable);

        self.record_mode(endpoint.mode);
        endpoint
    }

    fn record_mode(&self, mode: ConnectionMode) {
        let changed = self.mode_tx.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                *current = mode;
                true
            }
        });
        if changed {
            info!(mode = ?mode, "Connection mode changed");
        }
    }

    /// Endpoint for a request about to be dispatched
    ///
    /// Kicks off a background discovery refresh when the cache is stale and
    /// selects from the current cache without waiting for it.
    pub fn require_endpoint(&self) -> Result<Endpoint, ConnectionError> {
        self.discovery.refresh_if_stale();
        let endpoint = self.get_best_endpoint();
        if endpoint.is_available() {
            Ok(endpoint)
        } else {
            Err(ConnectionError::NoConnectionAvailable)
        }
    }

    /// Status consistent with [`ConnectionManager::get_best_endpoint`]
    pub fn get_status(&self) -> ConnectionStatus {
        let cached = self.discovery.cached();
        let endpoint = self.select(cached.as_ref());

        ConnectionStatus {
            connection_mode: endpoint.mode,
            endpoint_url: endpoint.url,
            tunnel_available: cached.as_ref().is_some_and(DiscoveredTunnel::is_usable),
            direct_available: self.direct_permitted() && self.is_direct_reachable(),
            discovery_stats: self.discovery.stats(),
        }
    }

    fn direct_permitted(&self) -> bool {
        self.config.direct_url.is_some()
            && ClientRoutingPolicy::permits(self.config.execution_context, ConnectionType::Direct)
    }

    /// Probe the direct URL and record the outcome
    ///
    /// Never probes in a browser context, where direct is not allowed.
    pub async fn check_direct(&self) -> bool {
        let Some(url) = self.config.direct_url.as_deref() else {
            return false;
        };
        if !ClientRoutingPolicy::permits(self.config.execution_context, ConnectionType::Direct) {
            return false;
        }
        let Some(probe) = &self.direct_probe else {
            return self.is_direct_reachable();
        };

        let reachable = match probe.check(url).await {
            Ok(_) => true,
            Err(e) => {
                debug!(url = %url, error = %e, "Direct endpoint unreachable");
                false
            }
        };

        let was = self.direct_reachable.swap(reachable, Ordering::AcqRel);
        if was != reachable {
            info!(url = %url, reachable, "Direct endpoint reachability changed");
        }
        reachable
    }

    /// Check the direct URL every `direct_check_interval`, starting now
    pub fn start_direct_monitor(self: &Arc<Self>) -> Result<DirectMonitor, ConfigError> {
        self.config.validate()?;

        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();
        let manager = self.clone();
        let period = self.config.direct_check_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_task.cancelled() => break,
                    _ = interval.tick() => {
                        manager.check_direct().await;
                        // Publish a mode change caused by reachability alone
                        manager.get_best_endpoint();
                    }
                }
            }
        });

        Ok(DirectMonitor { cancel, handle })
    }
}

/// Handle to the direct reachability loop
pub struct DirectMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DirectMonitor {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Direct monitor ended abnormally");
        }
    }
}
