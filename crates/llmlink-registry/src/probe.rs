//! Reachability probes used by the health loop

use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,

    #[error("Tunnel unreachable: {0}")]
    Unreachable(String),

    #[error("Unexpected status {0}")]
    Status(u16),
}

/// Secondary liveness signal for a tunnel
///
/// Returns the measured response time when the probe actually measured one.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, public_url: &str) -> Result<Option<Duration>, ProbeError>;
}

/// Heartbeat recency only, never probes
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProbe;

#[async_trait]
impl HealthProbe for NoopProbe {
    async fn probe(&self, _public_url: &str) -> Result<Option<Duration>, ProbeError> {
        Ok(None)
    }
}

/// GETs the tunnel's public URL and expects a 2xx
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, public_url: &str) -> Result<Option<Duration>, ProbeError> {
        let started = Instant::now();
        let response = self.client.get(public_url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Unreachable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status().as_u16()));
        }

        Ok(Some(started.elapsed()))
    }
}
