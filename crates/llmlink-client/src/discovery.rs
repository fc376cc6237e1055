//! Per-user tunnel discovery
//!
//! Runs inside the proxy serving one user. Polls the registry on a fixed
//! interval and keeps the most recent answer in a cache the request path
//! reads without waiting on the network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llmlink_proto::{DiscoverResponse, TunnelDetails, DISCOVER_PATH};
use llmlink_registry::TunnelRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, DiscoveryConfig};
use crate::error::DiscoveryError;
use crate::probe::EndpointProbe;

/// Source of discovery answers for one user
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn discover(&self) -> Result<DiscoverResponse, DiscoveryError>;
}

/// Talks to a remote registry over HTTP
pub struct HttpRegistryClient {
    client: reqwest::Client,
    discover_url: String,
    token: String,
}

impl HttpRegistryClient {
    pub fn new(
        registry_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DiscoveryError> {
        let base = url::Url::parse(registry_url).map_err(|e| DiscoveryError::Http(e.to_string()))?;
        let discover_url = format!("{}{}", base.as_str().trim_end_matches('/'), DISCOVER_PATH);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::Http(e.to_string()))?;

        Ok(Self {
            client,
            discover_url,
            token: token.into(),
        })
    }

    pub fn discover_url(&self) -> &str {
        &self.discover_url
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn discover(&self) -> Result<DiscoverResponse, DiscoveryError> {
        let response = self
            .client
            .get(&self.discover_url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DiscoveryError::Timeout
                } else {
                    DiscoveryError::Http(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Status(response.status().as_u16()));
        }

        response
            .json::<DiscoverResponse>()
            .await
            .map_err(|e| DiscoveryError::Decode(e.to_string()))
    }
}

/// Answers from a registry living in the same process
pub struct InProcessRegistryClient {
    registry: Arc<TunnelRegistry>,
    user_id: String,
}

impl InProcessRegistryClient {
    pub fn new(registry: Arc<TunnelRegistry>, user_id: impl Into<String>) -> Self {
        Self {
            registry,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl RegistryClient for InProcessRegistryClient {
    async fn discover(&self) -> Result<DiscoverResponse, DiscoveryError> {
        Ok(self.registry.discover_tunnels(&self.user_id))
    }
}

/// Cached view of the user's tunnel plus client-side bookkeeping
///
/// The health fields reflect what this client observed, not the registry's
/// own accounting; the two may disagree for a while.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTunnel {
    pub tunnel: TunnelDetails,
    pub discovered_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl DiscoveredTunnel {
    fn new(tunnel: TunnelDetails) -> Self {
        Self {
            tunnel,
            discovered_at: Utc::now(),
            last_health_check: None,
            is_healthy: true,
            consecutive_failures: 0,
            response_time_ms: None,
        }
    }

    /// Usable for routing: healthy on both sides
    pub fn is_usable(&self) -> bool {
        self.is_healthy && self.tunnel.health.is_healthy
    }

    pub fn public_url(&self) -> &str {
        &self.tunnel.public_url
    }
}

/// Poll bookkeeping exposed through the connection status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStats {
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    /// Polls in a row that did not yield a tunnel
    pub consecutive_failures: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tunnel_available: bool,
}

#[derive(Default)]
struct DiscoveryState {
    cached: Option<DiscoveredTunnel>,
    polled_at: Option<Instant>,
    stats: DiscoveryStats,
}

/// Polls the registry and caches the user's current tunnel
pub struct DiscoveryService {
    config: DiscoveryConfig,
    client: Arc<dyn RegistryClient>,
    probe: Option<Arc<dyn EndpointProbe>>,
    state: RwLock<DiscoveryState>,
    /// Serializes polls so results are applied in order
    poll_lock: tokio::sync::Mutex<()>,
    refreshing: AtomicBool,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig, client: Arc<dyn RegistryClient>) -> Self {
        Self {
            config,
            client,
            probe: None,
            state: RwLock::new(DiscoveryState::default()),
            poll_lock: tokio::sync::Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Probe each discovered tunnel's public URL after every poll
    pub fn with_probe(mut self, probe: Arc<dyn EndpointProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn read_state(&self) -> RwLockReadGuard<'_, DiscoveryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, DiscoveryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Poll the registry once and update the cache
    ///
    /// A found tunnel replaces the cache. "Not available", a registry error
    /// and a timeout all clear it and count as a failed poll.
    pub async fn discover_tunnels(&self) -> Option<DiscoveredTunnel> {
        let _poll = self.poll_lock.lock().await;

        let outcome =
            match tokio::time::timeout(self.config.request_timeout, self.client.discover()).await {
                Ok(result) => result,
                Err(_) => Err(DiscoveryError::Timeout),
            };

        match outcome {
            Ok(DiscoverResponse {
                available: true,
                tunnel_info: Some(details),
            }) => {
                let entry = self.refresh_entry(details).await;
                self.apply_success(entry)
            }
            Ok(_) => {
                self.apply_failure("no tunnel available".to_string(), false);
                None
            }
            Err(e) => {
                self.apply_failure(e.to_string(), true);
                None
            }
        }
    }

    /// Build the new cache entry, carrying client-side health over when the
    /// registry still reports the same tunnel
    async fn refresh_entry(&self, details: TunnelDetails) -> DiscoveredTunnel {
        let previous = self
            .read_state()
            .cached
            .clone()
            .filter(|cached| cached.tunnel.tunnel_id == details.tunnel_id);

        let mut entry = match previous {
            Some(mut previous) => {
                previous.tunnel = details;
                previous
            }
            None => DiscoveredTunnel::new(details),
        };

        if let Some(probe) = &self.probe {
            let result = probe.check(entry.public_url()).await;
            entry.last_health_check = Some(Utc::now());
            match result {
                Ok(latency) => {
                    entry.is_healthy = true;
                    entry.consecutive_failures = 0;
                    entry.response_time_ms = Some(latency.as_millis() as u64);
                }
                Err(e) => {
                    entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                    entry.is_healthy =
                        entry.consecutive_failures < self.config.tunnel_failure_threshold;
                    debug!(
                        tunnel_id = %entry.tunnel.tunnel_id,
                        consecutive_failures = entry.consecutive_failures,
                        error = %e,
                        "Tunnel probe failed"
                    );
                }
            }
        }

        entry
    }

    fn apply_success(&self, entry: DiscoveredTunnel) -> Option<DiscoveredTunnel> {
        let mut state = self.write_state();
        let changed = state
            .cached
            .as_ref()
            .map_or(true, |c| c.tunnel.tunnel_id != entry.tunnel.tunnel_id);
        if changed {
            info!(
                tunnel_id = %entry.tunnel.tunnel_id,
                public_url = %entry.tunnel.public_url,
                "Discovered tunnel"
            );
        } else {
            debug!(tunnel_id = %entry.tunnel.tunnel_id, "Tunnel still available");
        }

        let now = Utc::now();
        state.polled_at = Some(Instant::now());
        state.stats.total_polls += 1;
        state.stats.successful_polls += 1;
        state.stats.consecutive_failures = 0;
        state.stats.last_poll_at = Some(now);
        state.stats.last_success_at = Some(now);
        state.stats.last_error = None;
        state.stats.tunnel_available = true;
        state.cached = Some(entry);
        state.cached.clone()
    }

    fn apply_failure(&self, reason: String, is_error: bool) {
        let mut state = self.write_state();
        if let Some(previous) = state.cached.take() {
            info!(
                tunnel_id = %previous.tunnel.tunnel_id,
                reason = %reason,
                "Tunnel no longer available"
            );
        }

        state.polled_at = Some(Instant::now());
        state.stats.total_polls += 1;
        state.stats.failed_polls += 1;
        state.stats.consecutive_failures = state.stats.consecutive_failures.saturating_add(1);
        state.stats.last_poll_at = Some(Utc::now());
        state.stats.tunnel_available = false;

        if is_error {
            warn!(
                consecutive_failures = state.stats.consecutive_failures,
                error = %reason,
                "Discovery poll failed"
            );
        } else {
            debug!(
                consecutive_failures = state.stats.consecutive_failures,
                "No tunnel available"
            );
        }
        state.stats.last_error = Some(reason);
    }

    /// Current cache entry, no I/O
    pub fn cached(&self) -> Option<DiscoveredTunnel> {
        self.read_state().cached.clone()
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.read_state().stats.clone()
    }

    /// Never polled, or last poll older than the freshness threshold
    pub fn is_stale(&self) -> bool {
        match self.read_state().polled_at {
            Some(at) => at.elapsed() > self.config.freshness_threshold,
            None => true,
        }
    }

    /// Start a background poll if the cache is stale and none is running
    ///
    /// Returns immediately; callers keep using the current cache. Returns
    /// whether a refresh was started.
    pub fn refresh_if_stale(self: &Arc<Self>) -> bool {
        if !self.is_stale() {
            return false;
        }
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.refreshing.store(false, Ordering::Release);
            return false;
        };

        debug!("Discovery cache stale, refreshing");
        let service = self.clone();
        runtime.spawn(async move {
            service.discover_tunnels().await;
            service.refreshing.store(false, Ordering::Release);
        });
        true
    }

    /// Poll every `poll_interval`, starting now
    ///
    /// Refuses to start with an invalid config.
    pub fn start_polling(self: &Arc<Self>) -> Result<DiscoveryPoller, ConfigError> {
        self.config.validate()?;

        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();
        let service = self.clone();
        let period = self.config.poll_interval;

        info!(
            registry_url = %self.config.registry_url,
            interval = ?period,
            "Starting discovery polling"
        );

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_task.cancelled() => break,
                    _ = interval.tick() => {
                        service.discover_tunnels().await;
                    }
                }
            }
        });

        Ok(DiscoveryPoller { cancel, handle })
    }
}

/// Handle to the background poll loop
pub struct DiscoveryPoller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DiscoveryPoller {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Discovery poller ended abnormally");
        }
        debug!("Discovery polling stopped");
    }
}
