//! Registry errors
//!
//! Only caller mistakes are errors. Stale ids on unregister and heartbeat
//! and "nothing to discover" are ordinary results.

use llmlink_auth::AuthError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid tunnel info: {0}")]
    InvalidTunnelInfo(String),
}

impl From<AuthError> for RegistryError {
    fn from(err: AuthError) -> Self {
        RegistryError::Unauthorized(err.to_string())
    }
}
