//! Client error types

use thiserror::Error;

/// A failed discovery round trip
///
/// Never surfaced to the request path: the discovery service records it and
/// treats it like "no tunnel available".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Registry request failed: {0}")]
    Http(String),

    #[error("Registry returned status {0}")]
    Status(u16),

    #[error("Invalid response from registry: {0}")]
    Decode(String),

    #[error("Timeout contacting registry")]
    Timeout,
}

/// A failed reachability check of an LLM endpoint
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no local LLM connection available")]
    NoConnectionAvailable,
}
