//! Fakes shared by the client integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use llmlink_client::{DiscoveryError, EndpointProbe, ProbeError, RegistryClient};
use llmlink_proto::{DiscoverResponse, TunnelDetails, TunnelHealth};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn details(tunnel_id: &str, public_url: &str) -> TunnelDetails {
    let now = Utc::now();
    TunnelDetails {
        tunnel_id: tunnel_id.to_string(),
        user_id: "u1".to_string(),
        public_url: public_url.to_string(),
        local_url: "http://localhost:11434".to_string(),
        share_token: "share-token".to_string(),
        protocol: Some("https".to_string()),
        user_agent: None,
        client_version: None,
        platform: None,
        registered_at: now,
        last_heartbeat_at: now,
        health: TunnelHealth {
            is_healthy: true,
            consecutive_failures: 0,
            last_check_at: now,
            response_time_ms: None,
        },
    }
}

pub fn found(tunnel_id: &str, public_url: &str) -> Result<DiscoverResponse, DiscoveryError> {
    Ok(DiscoverResponse::found(details(tunnel_id, public_url)))
}

pub fn unavailable() -> Result<DiscoverResponse, DiscoveryError> {
    Ok(DiscoverResponse::unavailable())
}

/// Returns queued answers in order, then repeats the last one
pub struct ScriptedRegistryClient {
    script: Mutex<VecDeque<Result<DiscoverResponse, DiscoveryError>>>,
    last: Mutex<Result<DiscoverResponse, DiscoveryError>>,
    calls: AtomicUsize,
}

impl ScriptedRegistryClient {
    pub fn new(script: Vec<Result<DiscoverResponse, DiscoveryError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(unavailable()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, answer: Result<DiscoverResponse, DiscoveryError>) {
        self.script.lock().unwrap().push_back(answer);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for ScriptedRegistryClient {
    async fn discover(&self) -> Result<DiscoverResponse, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(answer) = next {
            *last = answer;
        }
        last.clone()
    }
}

/// Never answers within any sane timeout
pub struct HangingRegistryClient;

#[async_trait]
impl RegistryClient for HangingRegistryClient {
    async fn discover(&self) -> Result<DiscoverResponse, DiscoveryError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(DiscoverResponse::unavailable())
    }
}

/// Reachability controlled by the test
pub struct SwitchProbe {
    reachable: AtomicBool,
    calls: AtomicUsize,
}

impl SwitchProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointProbe for SwitchProbe {
    async fn check(&self, _base_url: &str) -> Result<Duration, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(Duration::from_millis(12))
        } else {
            Err(ProbeError::Unreachable("switched off".to_string()))
        }
    }
}
