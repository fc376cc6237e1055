//! Identity collaborator seam

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Scope granting access to operator-only endpoints such as registry stats
pub const OPERATOR_SCOPE: &str = "registry:operator";

/// Authentication errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

/// A verified caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable, opaque account identifier
    pub user_id: String,
    pub scopes: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            scopes: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn is_operator(&self) -> bool {
        self.has_scope(OPERATOR_SCOPE)
    }
}

/// Validates bearer tokens and resolves them to an [`Identity`]
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token table
///
/// Useful for local development and for tests that do not care about token
/// encoding.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl IdentityValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("Unknown token".to_string()))
    }
}
