//! Identity verification for the tunnel registry
//!
//! The registry never authenticates users itself. It consumes a bearer
//! token and asks an [`IdentityValidator`] who the caller is.

pub mod jwt;
pub mod validator;

pub use jwt::{JwtClaims, JwtError, JwtValidator};
pub use validator::{AuthError, Identity, IdentityValidator, StaticTokenValidator, OPERATOR_SCOPE};

// Re-export useful types
pub use async_trait::async_trait;
pub use jsonwebtoken::Algorithm;
