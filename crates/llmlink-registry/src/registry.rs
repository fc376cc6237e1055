//! In-memory tunnel registry
//!
//! Records are keyed by user id in a sharded map, so writers for one user
//! only contend with users that hash to the same shard and never hold a
//! lock across an await point. Every mutation of a user's slot is a single
//! map operation (`insert`, `remove_if`, `get_mut`), which is what keeps
//! supersession and eviction atomic with respect to concurrent readers.

use dashmap::{DashMap, DashSet};
use llmlink_auth::IdentityValidator;
use llmlink_proto::{DiscoverResponse, RegistryStats, TunnelDetails, TunnelInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::events::RegistryEvent;
use crate::probe::{HealthProbe, NoopProbe, ProbeError};
use crate::record::{validate_tunnel_info, HealthStatus, TunnelRecord};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The active record of one user plus its liveness bookkeeping
#[derive(Debug, Clone)]
struct TunnelSlot {
    record: TunnelRecord,
    health: HealthStatus,
    /// Monotonic twin of `record.last_heartbeat_at`
    last_heartbeat: Instant,
}

impl TunnelSlot {
    fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

/// Outcome of one pass of the health loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckSummary {
    pub checked: usize,
    /// Checks that succeeded
    pub passed: usize,
    /// Checks that failed, whether or not the tunnel crossed the threshold
    pub failed: usize,
    pub evicted: usize,
    /// Results dropped because the record was superseded mid-check
    pub discarded: usize,
}

struct ProbeTarget {
    user_id: String,
    tunnel_id: String,
    public_url: String,
    heartbeat_overdue: bool,
}

/// Registry of active tunnels, at most one per user
pub struct TunnelRegistry {
    config: RegistryConfig,
    validator: Arc<dyn IdentityValidator>,
    probe: Arc<dyn HealthProbe>,
    tunnels: DashMap<String, TunnelSlot>,
    known_users: DashSet<String>,
    total_registrations: AtomicU64,
    evicted_tunnels: AtomicU64,
    started_at: Instant,
    events: broadcast::Sender<RegistryEvent>,
}

impl TunnelRegistry {
    /// Create a registry that relies on heartbeat recency only
    pub fn new(config: RegistryConfig, validator: Arc<dyn IdentityValidator>) -> Self {
        Self::with_probe(config, validator, Arc::new(NoopProbe))
    }

    /// Create a registry that additionally probes each tunnel's public URL
    pub fn with_probe(
        config: RegistryConfig,
        validator: Arc<dyn IdentityValidator>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        info!(
            heartbeat_interval = ?config.heartbeat_interval,
            staleness_window = ?config.staleness_window,
            failure_threshold = config.failure_threshold,
            "Creating tunnel registry"
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            validator,
            probe,
            tunnels: DashMap::new(),
            known_users: DashSet::new(),
            total_registrations: AtomicU64::new(0),
            evicted_tunnels: AtomicU64::new(0),
            started_at: Instant::now(),
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Receive lifecycle events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register a tunnel for `user_id`, superseding any previous one
    ///
    /// The token must resolve to `user_id`. The new record replaces the old
    /// one in a single map operation, so no reader ever observes both or
    /// neither.
    pub async fn register_tunnel(
        &self,
        user_id: &str,
        info: TunnelInfo,
        auth_token: &str,
    ) -> Result<String, RegistryError> {
        let identity = self.validator.validate(auth_token).await.map_err(|e| {
            warn!(user_id = %user_id, error = %e, "Rejected tunnel registration");
            RegistryError::from(e)
        })?;

        if identity.user_id != user_id {
            warn!(
                user_id = %user_id,
                token_subject = %identity.user_id,
                "Token subject does not match registering user"
            );
            return Err(RegistryError::Unauthorized(
                "Token does not belong to this user".to_string(),
            ));
        }

        validate_tunnel_info(&info)?;

        let tunnel_id = uuid::Uuid::new_v4().to_string();
        let record = TunnelRecord::new(user_id.to_string(), tunnel_id.clone(), info);
        let public_url = record.public_url.clone();
        let slot = TunnelSlot {
            record,
            health: HealthStatus::new(),
            last_heartbeat: Instant::now(),
        };

        let previous = self.tunnels.insert(user_id.to_string(), slot);
        self.known_users.insert(user_id.to_string());
        self.total_registrations.fetch_add(1, Ordering::Relaxed);

        if let Some(old) = previous {
            info!(
                user_id = %user_id,
                old_tunnel_id = %old.record.tunnel_id,
                new_tunnel_id = %tunnel_id,
                "Superseded previous tunnel"
            );
            self.emit(RegistryEvent::Superseded {
                user_id: user_id.to_string(),
                old_tunnel_id: old.record.tunnel_id,
                new_tunnel_id: tunnel_id.clone(),
            });
        }

        info!(
            user_id = %user_id,
            tunnel_id = %tunnel_id,
            public_url = %public_url,
            "Registered tunnel"
        );
        self.emit(RegistryEvent::Registered {
            user_id: user_id.to_string(),
            tunnel_id: tunnel_id.clone(),
        });

        Ok(tunnel_id)
    }

    /// Remove the user's tunnel if `tunnel_id` is still the active one
    ///
    /// Returns false for unknown or superseded ids so a stale request can
    /// never remove a newer tunnel.
    pub fn unregister_tunnel(&self, user_id: &str, tunnel_id: &str) -> bool {
        let removed = self
            .tunnels
            .remove_if(user_id, |_, slot| slot.record.tunnel_id == tunnel_id);

        if removed.is_some() {
            info!(user_id = %user_id, tunnel_id = %tunnel_id, "Unregistered tunnel");
            self.emit(RegistryEvent::Unregistered {
                user_id: user_id.to_string(),
                tunnel_id: tunnel_id.to_string(),
            });
            true
        } else {
            debug!(
                user_id = %user_id,
                tunnel_id = %tunnel_id,
                "Ignoring unregister for unknown or superseded tunnel"
            );
            false
        }
    }

    /// Refresh the heartbeat of the user's active tunnel
    ///
    /// Returns false for unknown or superseded ids, and for records whose
    /// heartbeat already went stale: a dead record is only waiting for
    /// eviction and the agent has to register again.
    pub fn update_heartbeat(&self, user_id: &str, tunnel_id: &str) -> bool {
        let now = Instant::now();
        let Some(mut slot) = self.tunnels.get_mut(user_id) else {
            debug!(user_id = %user_id, tunnel_id = %tunnel_id, "Heartbeat for unknown user");
            return false;
        };

        if slot.record.tunnel_id != tunnel_id {
            debug!(
                user_id = %user_id,
                tunnel_id = %tunnel_id,
                active_tunnel_id = %slot.record.tunnel_id,
                "Heartbeat for superseded tunnel"
            );
            return false;
        }

        if slot.heartbeat_age(now) > self.config.staleness_window {
            debug!(user_id = %user_id, tunnel_id = %tunnel_id, "Heartbeat for stale tunnel");
            return false;
        }

        slot.last_heartbeat = now;
        slot.record.last_heartbeat_at = chrono::Utc::now();
        debug!(user_id = %user_id, tunnel_id = %tunnel_id, "Heartbeat");
        true
    }

    /// The active, healthy tunnel for `user_id`, if any
    pub fn discover_tunnels(&self, user_id: &str) -> DiscoverResponse {
        let now = Instant::now();
        let Some(slot) = self.tunnels.get(user_id) else {
            debug!(user_id = %user_id, "No tunnel registered");
            return DiscoverResponse::unavailable();
        };

        if !self.is_discoverable(&slot, now) {
            debug!(
                user_id = %user_id,
                tunnel_id = %slot.record.tunnel_id,
                consecutive_failures = slot.health.consecutive_failures,
                "Tunnel registered but not discoverable"
            );
            return DiscoverResponse::unavailable();
        }

        DiscoverResponse::found(slot.record.to_details(&slot.health))
    }

    /// The user's record regardless of health
    pub fn get(&self, user_id: &str) -> Option<TunnelDetails> {
        self.tunnels
            .get(user_id)
            .map(|slot| slot.record.to_details(&slot.health))
    }

    /// Number of records currently held
    pub fn count(&self) -> usize {
        self.tunnels.len()
    }

    fn is_discoverable(&self, slot: &TunnelSlot, now: Instant) -> bool {
        slot.health.is_discoverable(self.config.failure_threshold)
            && slot.heartbeat_age(now) <= self.config.staleness_window
    }

    /// One pass of the health loop
    ///
    /// Stale records are evicted first, regardless of probe outcome. The
    /// remaining ones are checked against heartbeat recency and the probe,
    /// without holding any lock while probing. Results are applied only if
    /// the record that was probed is still the active one.
    pub async fn perform_health_checks(&self) -> HealthCheckSummary {
        let mut summary = HealthCheckSummary::default();
        let now = Instant::now();
        let staleness = self.config.staleness_window;
        let deadline = self.config.heartbeat_deadline();

        let mut stale = Vec::new();
        let mut targets = Vec::new();
        for entry in self.tunnels.iter() {
            let slot = entry.value();
            let age = slot.heartbeat_age(now);
            if age > staleness {
                stale.push((entry.key().clone(), slot.record.tunnel_id.clone()));
            } else {
                targets.push(ProbeTarget {
                    user_id: entry.key().clone(),
                    tunnel_id: slot.record.tunnel_id.clone(),
                    public_url: slot.record.public_url.clone(),
                    heartbeat_overdue: age > deadline,
                });
            }
        }

        for (user_id, tunnel_id) in stale {
            if self.evict_if_stale(&user_id, &tunnel_id) {
                summary.evicted += 1;
            }
        }

        let mut probes = JoinSet::new();
        for target in targets {
            let probe = self.probe.clone();
            let timeout = self.config.probe_timeout;
            probes.spawn(async move {
                let result = if target.heartbeat_overdue {
                    // Heartbeat absence is the primary signal, no need to probe
                    Err(ProbeError::Unreachable("heartbeat overdue".to_string()))
                } else {
                    match tokio::time::timeout(timeout, probe.probe(&target.public_url)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProbeError::Timeout),
                    }
                };
                (target, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (target, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Health probe task failed");
                    continue;
                }
            };

            match self.apply_health_result(&target, result) {
                Some(true) => summary.passed += 1,
                Some(false) => summary.failed += 1,
                None => summary.discarded += 1,
            }
            summary.checked += 1;
        }

        if summary.evicted > 0 || summary.failed > 0 {
            info!(
                checked = summary.checked,
                passed = summary.passed,
                failed = summary.failed,
                evicted = summary.evicted,
                "Health check completed"
            );
        } else {
            debug!(
                checked = summary.checked,
                discarded = summary.discarded,
                "Health check completed"
            );
        }

        summary
    }

    fn evict_if_stale(&self, user_id: &str, tunnel_id: &str) -> bool {
        let now = Instant::now();
        let staleness = self.config.staleness_window;
        let removed = self.tunnels.remove_if(user_id, |_, slot| {
            slot.record.tunnel_id == tunnel_id && slot.heartbeat_age(now) > staleness
        });

        let Some((_, slot)) = removed else {
            return false;
        };

        self.evicted_tunnels.fetch_add(1, Ordering::Relaxed);
        warn!(
            user_id = %user_id,
            tunnel_id = %tunnel_id,
            heartbeat_age = ?slot.heartbeat_age(now),
            "Evicted stale tunnel"
        );
        self.emit(RegistryEvent::Evicted {
            user_id: user_id.to_string(),
            tunnel_id: tunnel_id.to_string(),
        });
        true
    }

    /// Returns whether the check passed, or None when the result was discarded
    fn apply_health_result(
        &self,
        target: &ProbeTarget,
        result: Result<Option<Duration>, ProbeError>,
    ) -> Option<bool> {
        let mut slot = self.tunnels.get_mut(&target.user_id)?;
        if slot.record.tunnel_id != target.tunnel_id {
            debug!(
                user_id = %target.user_id,
                tunnel_id = %target.tunnel_id,
                "Discarding health result for superseded tunnel"
            );
            return None;
        }
        // The overdue verdict came from the pass snapshot
        if target.heartbeat_overdue
            && slot.heartbeat_age(Instant::now()) <= self.config.heartbeat_deadline()
        {
            debug!(
                user_id = %target.user_id,
                tunnel_id = %target.tunnel_id,
                "Discarding overdue verdict, heartbeat arrived during the pass"
            );
            return None;
        }

        let was_healthy = slot.health.is_healthy;
        let passed = result.is_ok();
        match result {
            Ok(response_time) => slot.health.record_success(response_time),
            Err(e) => {
                slot.health.record_failure(self.config.failure_threshold);
                debug!(
                    user_id = %target.user_id,
                    tunnel_id = %target.tunnel_id,
                    consecutive_failures = slot.health.consecutive_failures,
                    error = %e,
                    "Tunnel health check failed"
                );
            }
        }
        let is_healthy = slot.health.is_healthy;
        drop(slot);

        if was_healthy != is_healthy {
            if is_healthy {
                info!(user_id = %target.user_id, tunnel_id = %target.tunnel_id, "Tunnel recovered");
            } else {
                warn!(user_id = %target.user_id, tunnel_id = %target.tunnel_id, "Tunnel marked unhealthy");
            }
            self.emit(RegistryEvent::HealthChanged {
                user_id: target.user_id.clone(),
                tunnel_id: target.tunnel_id.clone(),
                is_healthy,
            });
        }

        Some(passed)
    }

    /// Read-only statistics snapshot
    pub fn get_registry_stats(&self) -> RegistryStats {
        let now = Instant::now();
        let mut active_tunnels = 0;
        let mut healthy_tunnels = 0;
        for entry in self.tunnels.iter() {
            active_tunnels += 1;
            if self.is_discoverable(entry.value(), now) {
                healthy_tunnels += 1;
            }
        }

        RegistryStats {
            total_users: self.known_users.len(),
            active_tunnels,
            healthy_tunnels,
            uptime: now.saturating_duration_since(self.started_at).as_secs(),
            total_registrations: self.total_registrations.load(Ordering::Relaxed),
            evicted_tunnels: self.evicted_tunnels.load(Ordering::Relaxed),
        }
    }
}
