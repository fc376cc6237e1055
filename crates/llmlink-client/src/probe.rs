//! Reachability checks for LLM endpoints

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::ProbeError;

/// Version route of the local LLM runtime
pub const VERSION_PATH: &str = "/api/version";

/// Checks whether an LLM endpoint answers
///
/// Returns the measured latency.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    async fn check(&self, base_url: &str) -> Result<Duration, ProbeError>;
}

/// GETs `<base>/api/version` and expects a 2xx
pub struct HttpEndpointProbe {
    client: reqwest::Client,
}

impl HttpEndpointProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        Ok(Self { client })
    }
}

/// Join `VERSION_PATH` onto a base URL, keeping any existing path prefix
pub fn version_url(base_url: &str) -> Result<url::Url, ProbeError> {
    let mut url = url::Url::parse(base_url).map_err(|e| ProbeError::InvalidUrl(e.to_string()))?;
    let path = format!("{}{}", url.path().trim_end_matches('/'), VERSION_PATH);
    url.set_path(&path);
    Ok(url)
}

#[async_trait]
impl EndpointProbe for HttpEndpointProbe {
    async fn check(&self, base_url: &str) -> Result<Duration, ProbeError> {
        let url = version_url(base_url)?;
        let started = Instant::now();

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Unreachable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status().as_u16()));
        }

        let elapsed = started.elapsed();
        debug!(base_url = %base_url, latency_ms = elapsed.as_millis() as u64, "Endpoint reachable");
        Ok(elapsed)
    }
}
