//! Bearer tokens as signed JWTs
//!
//! The registry only needs the subject and the granted scopes; everything
//! else in the claims is carried through as identity metadata.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::{AuthError, Identity, IdentityValidator};

/// Bearer token claims
///
/// Shaped like an OAuth access token: `sub` is the account id and `scope`
/// is a space separated list. `permissions` mirrors the RBAC claim some
/// identity providers emit alongside `scope`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Account id the tunnel records are keyed by
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    /// Space separated scopes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

impl JwtClaims {
    pub fn new(user_id: String, issuer: String, audience: String, validity: Duration) -> Self {
        let issued = Utc::now();

        Self {
            sub: user_id,
            iat: issued.timestamp(),
            exp: (issued + validity).timestamp(),
            iss: issuer,
            aud: audience,
            scope: String::new(),
            permissions: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    /// All scopes granted by this token, `scope` first then `permissions`
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.scope.split_whitespace().map(String::from).collect();
        for permission in &self.permissions {
            if !scopes.contains(permission) {
                scopes.push(permission.clone());
            }
        }
        scopes
    }

    /// Expiry as an RFC 3339 timestamp in UTC
    pub fn exp_formatted(&self) -> String {
        DateTime::<Utc>::from_timestamp(self.exp, 0)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| self.exp.to_string())
    }
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token has no subject")]
    MissingSubject,
}

/// Verifies bearer tokens against one key and turns them into identities
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// HS256 validator sharing `secret` with whoever mints the tokens
    ///
    /// Signature and expiry are always checked; issuer and audience only
    /// when configured.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation: Self::base_validation(Algorithm::HS256),
        }
    }

    /// RS256 validator for tokens issued by an external identity provider
    pub fn from_rsa_pem(public_key_pem: &[u8]) -> Result<Self, JwtError> {
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem)?;
        Ok(Self {
            decoding_key,
            validation: Self::base_validation(Algorithm::RS256),
        })
    }

    fn base_validation(algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        validation
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let claims = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?.claims;

        // Leeway lets barely expired tokens through decode
        if claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }
        if claims.sub.is_empty() {
            return Err(JwtError::MissingSubject);
        }
        Ok(claims)
    }

    /// Sign `claims` with an HS256 shared secret
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        sign(Algorithm::HS256, &EncodingKey::from_secret(secret), claims)
    }

    /// Sign `claims` with an RSA private key in PEM format
    pub fn encode_rsa(private_key_pem: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        sign(
            Algorithm::RS256,
            &EncodingKey::from_rsa_pem(private_key_pem)?,
            claims,
        )
    }
}

fn sign(algorithm: Algorithm, key: &EncodingKey, claims: &JwtClaims) -> Result<String, JwtError> {
    Ok(encode(&Header::new(algorithm), claims, key)?)
}

#[async_trait]
impl IdentityValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let claims = JwtValidator::validate(self, token).map_err(|e| match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::MissingSubject => AuthError::InvalidToken(e.to_string()),
            JwtError::Jwt(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::AuthenticationFailed(e.to_string()),
            },
        })?;

        Ok(Identity::new(claims.sub.clone())
            .with_scopes(claims.scopes())
            .with_metadata("iss".to_string(), claims.iss.clone())
            .with_metadata("aud".to_string(), claims.aud.clone())
            .with_metadata("exp".to_string(), claims.exp.to_string()))
    }
}
