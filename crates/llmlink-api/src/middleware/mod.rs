//! API Middleware
//!
//! Bearer authentication for the registry routes.

pub mod auth;

pub use auth::{require_identity, AuthUser};
