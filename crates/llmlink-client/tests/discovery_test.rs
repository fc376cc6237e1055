//! Tests for the per-user discovery cache

mod common;

use common::{found, unavailable, HangingRegistryClient, ScriptedRegistryClient, SwitchProbe};
use llmlink_client::{ConfigError, DiscoveryConfig, DiscoveryError, DiscoveryService};
use std::sync::Arc;
use std::time::Duration;

fn config() -> DiscoveryConfig {
    DiscoveryConfig::new("https://registry.example")
}

#[tokio::test]
async fn test_found_tunnel_is_cached() {
    let client = Arc::new(ScriptedRegistryClient::new(vec![found(
        "t1",
        "https://abc.example",
    )]));
    let service = DiscoveryService::new(config(), client);

    assert!(service.cached().is_none());
    let discovered = service.discover_tunnels().await.unwrap();

    assert_eq!(discovered.public_url(), "https://abc.example");
    assert!(discovered.is_usable());
    assert_eq!(service.cached(), Some(discovered));

    let stats = service.stats();
    assert_eq!(stats.total_polls, 1);
    assert_eq!(stats.successful_polls, 1);
    assert_eq!(stats.consecutive_failures, 0);
    assert!(stats.tunnel_available);
}

#[tokio::test]
async fn test_unavailable_clears_cache() {
    let client = Arc::new(ScriptedRegistryClient::new(vec![
        found("t1", "https://abc.example"),
        unavailable(),
    ]));
    let service = DiscoveryService::new(config(), client);

    assert!(service.discover_tunnels().await.is_some());
    assert!(service.discover_tunnels().await.is_none());
    assert!(service.cached().is_none());

    let stats = service.stats();
    assert_eq!(stats.failed_polls, 1);
    assert_eq!(stats.consecutive_failures, 1);
    assert!(!stats.tunnel_available);
    assert_eq!(stats.last_error.as_deref(), Some("no tunnel available"));
}

#[tokio::test]
async fn test_registry_errors_count_as_unavailable() {
    let client = Arc::new(ScriptedRegistryClient::new(vec![
        found("t1", "https://abc.example"),
        Err(DiscoveryError::Status(502)),
        Err(DiscoveryError::Http("connection refused".to_string())),
    ]));
    let service = DiscoveryService::new(config(), client.clone());

    service.discover_tunnels().await;
    assert!(service.discover_tunnels().await.is_none());
    assert!(service.cached().is_none());
    service.discover_tunnels().await;

    let stats = service.stats();
    assert_eq!(stats.consecutive_failures, 2);
    assert!(stats
        .last_error
        .as_deref()
        .unwrap()
        .contains("connection refused"));

    // Any success resets the streak
    client.push(found("t1", "https://abc.example"));
    service.discover_tunnels().await;
    assert_eq!(service.stats().consecutive_failures, 0);
    assert!(service.stats().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_registry_timeout() {
    let config = config().with_request_timeout(Duration::from_secs(2));
    let service = DiscoveryService::new(config, Arc::new(HangingRegistryClient));

    assert!(service.discover_tunnels().await.is_none());
    let stats = service.stats();
    assert_eq!(stats.failed_polls, 1);
    assert_eq!(
        stats.last_error,
        Some(DiscoveryError::Timeout.to_string())
    );
}

#[tokio::test]
async fn test_same_tunnel_keeps_discovered_at() {
    let client = Arc::new(ScriptedRegistryClient::new(vec![
        found("t1", "https://abc.example"),
        found("t1", "https://abc.example"),
        found("t2", "https://def.example"),
    ]));
    let service = DiscoveryService::new(config(), client);

    let first = service.discover_tunnels().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = service.discover_tunnels().await.unwrap();
    assert_eq!(first.discovered_at, second.discovered_at);

    let third = service.discover_tunnels().await.unwrap();
    assert_eq!(third.tunnel.tunnel_id, "t2");
    assert!(third.discovered_at >= second.discovered_at);
    assert_eq!(third.public_url(), "https://def.example");
}

#[tokio::test]
async fn test_client_side_probe_marks_tunnel_unhealthy() {
    let client = Arc::new(ScriptedRegistryClient::new(vec![found(
        "t1",
        "https://abc.example",
    )]));
    let probe = Arc::new(SwitchProbe::new(false));
    let service = DiscoveryService::new(config().with_tunnel_failure_threshold(2), client)
        .with_probe(probe.clone());

    let entry = service.discover_tunnels().await.unwrap();
    assert_eq!(entry.consecutive_failures, 1);
    assert!(entry.is_healthy);
    assert!(entry.last_health_check.is_some());

    let entry = service.discover_tunnels().await.unwrap();
    assert_eq!(entry.consecutive_failures, 2);
    assert!(!entry.is_healthy);
    assert!(!entry.is_usable());

    // The registry still reports it; only the client disagrees
    assert!(service.stats().tunnel_available);

    probe.set(true);
    let entry = service.discover_tunnels().await.unwrap();
    assert!(entry.is_usable());
    assert_eq!(entry.consecutive_failures, 0);
    assert_eq!(entry.response_time_ms, Some(12));
    assert_eq!(probe.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_staleness_triggers_background_refresh() {
    let client = Arc::new(ScriptedRegistryClient::new(vec![
        found("t1", "https://abc.example"),
        found("t2", "https://def.example"),
    ]));
    let service = Arc::new(DiscoveryService::new(config(), client.clone()));

    assert!(service.is_stale());
    service.discover_tunnels().await;
    assert!(!service.is_stale());
    assert!(!service.refresh_if_stale());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(service.is_stale());

    assert!(service.refresh_if_stale());
    // Already in flight
    assert!(!service.refresh_if_stale());
    // The request path keeps reading the old entry meanwhile
    assert_eq!(service.cached().unwrap().tunnel.tunnel_id, "t1");

    while client.calls() < 2 || service.is_stale() {
        tokio::task::yield_now().await;
    }
    assert_eq!(service.cached().unwrap().tunnel.tunnel_id, "t2");
}

#[tokio::test(start_paused = true)]
async fn test_poller_runs_on_interval() {
    let client = Arc::new(ScriptedRegistryClient::new(vec![found(
        "t1",
        "https://abc.example",
    )]));
    let service = Arc::new(DiscoveryService::new(
        config().with_poll_interval(Duration::from_secs(30)),
        client.clone(),
    ));

    let poller = service.start_polling().unwrap();
    assert!(poller.is_running());

    // Ticks at 0, 30, 60 and 90 seconds
    tokio::time::sleep(Duration::from_secs(95)).await;
    assert_eq!(client.calls(), 4);
    assert!(service.cached().is_some());

    poller.shutdown().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(client.calls(), 4);
}

#[tokio::test]
async fn test_zero_poll_interval_refuses_to_start() {
    let client = Arc::new(ScriptedRegistryClient::new(vec![unavailable()]));
    let service = Arc::new(DiscoveryService::new(
        config().with_poll_interval(Duration::ZERO),
        client.clone(),
    ));

    let err = service.start_polling().err().unwrap();
    assert_eq!(err, ConfigError::Zero("poll_interval"));
    assert_eq!(client.calls(), 0);

    // One-shot discovery is unaffected
    assert!(service.discover_tunnels().await.is_none());
}
