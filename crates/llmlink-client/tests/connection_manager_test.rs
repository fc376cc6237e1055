//! Endpoint selection tests, including end-to-end runs against an
//! in-process registry

mod common;

use common::{found, unavailable, ScriptedRegistryClient, SwitchProbe};
use llmlink_auth::{Identity, StaticTokenValidator};
use llmlink_client::{
    ConfigError, ConnectionError, ConnectionManager, ConnectionManagerConfig, ConnectionMode, ConnectionType,
    DirectStrategy, DiscoveryConfig, DiscoveryService, Endpoint, EndpointStrategy,
    ExecutionContext, InProcessRegistryClient, SelectionContext, TunnelStrategy,
};
use llmlink_proto::TunnelInfo;
use llmlink_registry::{RegistryConfig, TunnelRegistry};
use std::sync::Arc;
use std::time::Duration;

fn registry() -> Arc<TunnelRegistry> {
    let validator = StaticTokenValidator::new()
        .with_token("tok-u1", Identity::new("u1"))
        .with_token("tok-u2", Identity::new("u2"));
    Arc::new(TunnelRegistry::new(
        RegistryConfig::default(),
        Arc::new(validator),
    ))
}

fn discovery_for(registry: &Arc<TunnelRegistry>, user_id: &str) -> Arc<DiscoveryService> {
    Arc::new(DiscoveryService::new(
        DiscoveryConfig::new("in-process"),
        Arc::new(InProcessRegistryClient::new(registry.clone(), user_id)),
    ))
}

fn scripted(
    answers: Vec<Result<llmlink_proto::DiscoverResponse, llmlink_client::DiscoveryError>>,
) -> (Arc<ScriptedRegistryClient>, Arc<DiscoveryService>) {
    let client = Arc::new(ScriptedRegistryClient::new(answers));
    let discovery = Arc::new(DiscoveryService::new(
        DiscoveryConfig::new("https://registry.example"),
        client.clone(),
    ));
    (client, discovery)
}

fn desktop(direct_url: Option<&str>) -> ConnectionManagerConfig {
    ConnectionManagerConfig::new(ExecutionContext::Desktop)
        .with_direct_url(direct_url.map(String::from))
}

#[tokio::test]
async fn test_registered_tunnel_is_selected() {
    let registry = registry();
    registry
        .register_tunnel(
            "u1",
            TunnelInfo::new("https://abc.example", "http://localhost:11434", "share-1"),
            "tok-u1",
        )
        .await
        .unwrap();

    let discovery = discovery_for(&registry, "u1");
    let manager = ConnectionManager::new(desktop(Some("http://localhost:11434")), discovery.clone());

    discovery.discover_tunnels().await;
    let endpoint = manager.get_best_endpoint();

    assert_eq!(endpoint.mode, ConnectionMode::Tunnel);
    assert_eq!(endpoint.url.as_deref(), Some("https://abc.example"));
    assert_eq!(endpoint.share_token.as_deref(), Some("share-1"));
}

#[tokio::test]
async fn test_superseded_tunnel_is_replaced_after_poll() {
    let registry = registry();
    let info = |url: &str| TunnelInfo::new(url, "http://localhost:11434", "share");
    registry
        .register_tunnel("u1", info("https://abc.example"), "tok-u1")
        .await
        .unwrap();

    let discovery = discovery_for(&registry, "u1");
    let manager = ConnectionManager::new(desktop(None), discovery.clone());
    discovery.discover_tunnels().await;
    assert_eq!(
        manager.get_best_endpoint().url.as_deref(),
        Some("https://abc.example")
    );

    registry
        .register_tunnel("u1", info("https://def.example"), "tok-u1")
        .await
        .unwrap();
    discovery.discover_tunnels().await;
    assert_eq!(
        manager.get_best_endpoint().url.as_deref(),
        Some("https://def.example")
    );
}

#[tokio::test]
async fn test_unregistered_user_falls_back_to_direct() {
    let registry = registry();
    let discovery = discovery_for(&registry, "u2");
    discovery.discover_tunnels().await;

    let manager = ConnectionManager::new(desktop(Some("http://localhost:11434")), discovery);
    let endpoint = manager.get_best_endpoint();
    assert_eq!(endpoint.mode, ConnectionMode::Direct);
    assert_eq!(endpoint.url.as_deref(), Some("http://localhost:11434"));
}

#[tokio::test]
async fn test_unregistered_user_without_direct_gets_none() {
    let registry = registry();
    let discovery = discovery_for(&registry, "u2");
    discovery.discover_tunnels().await;

    let manager = ConnectionManager::new(desktop(None), discovery);
    assert_eq!(manager.get_best_endpoint(), Endpoint::unavailable());

    let err = manager.require_endpoint().unwrap_err();
    assert_eq!(err, ConnectionError::NoConnectionAvailable);
    assert_eq!(err.to_string(), "no local LLM connection available");
}

#[tokio::test]
async fn test_selection_is_deterministic() {
    let (_, discovery) = scripted(vec![found("t1", "https://abc.example")]);
    discovery.discover_tunnels().await;
    let manager = ConnectionManager::new(desktop(Some("http://localhost:11434")), discovery);

    let first = manager.get_best_endpoint();
    for _ in 0..20 {
        assert_eq!(manager.get_best_endpoint(), first);
    }
}

#[tokio::test]
async fn test_browser_never_selects_direct() {
    let (client, discovery) = scripted(vec![unavailable()]);
    let config = ConnectionManagerConfig::new(ExecutionContext::Browser);
    assert!(config.direct_url.is_some());
    let manager = ConnectionManager::new(config, discovery.clone());

    discovery.discover_tunnels().await;
    assert_eq!(manager.get_best_endpoint().mode, ConnectionMode::None);
    assert!(!manager.check_direct().await);

    client.push(found("t1", "https://abc.example"));
    discovery.discover_tunnels().await;
    assert_eq!(manager.get_best_endpoint().mode, ConnectionMode::Tunnel);
}

#[tokio::test]
async fn test_browser_vetoes_private_tunnel_url() {
    let (_, discovery) = scripted(vec![found("t1", "http://192.168.1.20:11434")]);
    discovery.discover_tunnels().await;

    let browser = ConnectionManager::new(
        ConnectionManagerConfig::new(ExecutionContext::Browser),
        discovery.clone(),
    );
    assert_eq!(browser.get_best_endpoint(), Endpoint::unavailable());

    // The same tunnel is fine from the desktop
    let desktop = ConnectionManager::new(desktop(None), discovery);
    assert_eq!(desktop.get_best_endpoint().mode, ConnectionMode::Tunnel);
}

#[tokio::test]
async fn test_status_matches_selection() {
    let (client, discovery) = scripted(vec![found("t1", "https://abc.example")]);
    discovery.discover_tunnels().await;
    let manager = ConnectionManager::new(desktop(Some("http://localhost:11434")), discovery.clone());

    let status = manager.get_status();
    assert_eq!(status.connection_mode, manager.get_best_endpoint().mode);
    assert_eq!(status.connection_mode, ConnectionMode::Tunnel);
    assert!(status.tunnel_available);
    assert_eq!(status.discovery_stats.successful_polls, 1);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["connectionMode"], "tunnel");
    assert_eq!(json["zrokAvailable"], true);
    assert_eq!(json["discoveryStats"]["totalPolls"], 1);

    client.push(unavailable());
    discovery.discover_tunnels().await;
    let status = manager.get_status();
    assert_eq!(status.connection_mode, ConnectionMode::Direct);
    assert!(!status.tunnel_available);
    assert_eq!(status.discovery_stats.consecutive_failures, 1);
}

#[tokio::test]
async fn test_mode_changes_are_published() {
    let (client, discovery) = scripted(vec![found("t1", "https://abc.example")]);
    let manager = ConnectionManager::new(desktop(Some("http://localhost:11434")), discovery.clone());
    let mut modes = manager.subscribe();
    assert_eq!(*modes.borrow(), ConnectionMode::None);

    discovery.discover_tunnels().await;
    manager.get_best_endpoint();
    assert!(modes.has_changed().unwrap());
    assert_eq!(*modes.borrow_and_update(), ConnectionMode::Tunnel);

    // Same selection again publishes nothing
    manager.get_best_endpoint();
    assert!(!modes.has_changed().unwrap());

    client.push(unavailable());
    discovery.discover_tunnels().await;
    manager.get_best_endpoint();
    assert_eq!(*modes.borrow_and_update(), ConnectionMode::Direct);
}

#[tokio::test]
async fn test_direct_probe_gates_direct() {
    let (_, discovery) = scripted(vec![unavailable()]);
    discovery.discover_tunnels().await;
    let probe = Arc::new(SwitchProbe::new(false));
    let manager = ConnectionManager::new(desktop(Some("http://localhost:11434")), discovery)
        .with_direct_probe(probe.clone());

    // Unverified until the first check
    assert_eq!(manager.get_best_endpoint().mode, ConnectionMode::None);

    assert!(!manager.check_direct().await);
    assert_eq!(manager.get_best_endpoint().mode, ConnectionMode::None);

    probe.set(true);
    assert!(manager.check_direct().await);
    assert_eq!(manager.get_best_endpoint().mode, ConnectionMode::Direct);
    assert!(manager.get_status().direct_available);
}

#[tokio::test(start_paused = true)]
async fn test_direct_monitor_tracks_reachability() {
    let (_, discovery) = scripted(vec![unavailable()]);
    discovery.discover_tunnels().await;
    let probe = Arc::new(SwitchProbe::new(true));
    let manager = Arc::new(
        ConnectionManager::new(
            desktop(Some("http://localhost:11434")).with_direct_check_interval(Duration::from_secs(10)),
            discovery,
        )
        .with_direct_probe(probe.clone()),
    );
    let mut modes = manager.subscribe();

    let monitor = manager.start_direct_monitor().unwrap();
    modes.changed().await.unwrap();
    assert_eq!(*modes.borrow_and_update(), ConnectionMode::Direct);

    probe.set(false);
    modes.changed().await.unwrap();
    assert_eq!(*modes.borrow_and_update(), ConnectionMode::None);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_zero_direct_check_interval_refuses_to_start() {
    let (_, discovery) = scripted(vec![unavailable()]);
    let manager = Arc::new(
        ConnectionManager::new(
            desktop(Some("http://localhost:11434")).with_direct_check_interval(Duration::ZERO),
            discovery,
        )
        .with_direct_probe(Arc::new(SwitchProbe::new(true))),
    );

    let err = manager.start_direct_monitor().err().unwrap();
    assert_eq!(err, ConfigError::Zero("direct_check_interval"));
}

#[tokio::test]
async fn test_browser_status_never_reports_direct() {
    let (_, discovery) = scripted(vec![unavailable()]);
    discovery.discover_tunnels().await;
    let config = ConnectionManagerConfig::new(ExecutionContext::Browser);
    assert!(config.direct_url.is_some());

    let manager = ConnectionManager::new(config, discovery);
    let status = manager.get_status();
    assert_eq!(status.connection_mode, ConnectionMode::None);
    assert!(!status.direct_available);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["directAvailable"], false);
}

/// Secondary tunnel provider used to show strategy insertion
struct FixedStrategy;

impl EndpointStrategy for FixedStrategy {
    fn name(&self) -> &'static str {
        "secondary-tunnel"
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::CloudTunnel
    }

    fn select(&self, _ctx: &SelectionContext<'_>) -> Option<Endpoint> {
        Some(Endpoint {
            mode: ConnectionMode::Tunnel,
            url: Some("https://backup.example".to_string()),
            share_token: None,
        })
    }
}

#[tokio::test]
async fn test_custom_strategy_order() {
    let (_, discovery) = scripted(vec![unavailable()]);
    discovery.discover_tunnels().await;

    let manager = ConnectionManager::with_strategies(
        desktop(Some("http://localhost:11434")),
        discovery,
        vec![
            Box::new(TunnelStrategy),
            Box::new(FixedStrategy),
            Box::new(DirectStrategy),
        ],
    );

    let endpoint = manager.get_best_endpoint();
    assert_eq!(endpoint.url.as_deref(), Some("https://backup.example"));
}
