//! Bearer Authentication Middleware
//!
//! Extracts the token from the `Authorization: Bearer <token>` header,
//! resolves it through the configured identity collaborator and makes the
//! caller available to handlers via Axum's Extension.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use llmlink_auth::{AuthError, OPERATOR_SCOPE};
use llmlink_proto::ErrorResponse;
use std::sync::Arc;
use tracing::debug;

use crate::AppState;

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub scopes: Vec<String>,
    /// Raw bearer token, forwarded to the registry on registration
    pub token: String,
}

impl AuthUser {
    pub fn is_operator(&self) -> bool {
        self.scopes.iter().any(|s| s == OPERATOR_SCOPE)
    }
}

/// Middleware rejecting requests without a valid bearer token
///
/// # Errors
/// Returns 401 Unauthorized if:
/// - The Authorization header is missing or not a Bearer token
/// - The identity collaborator rejects the token
pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new(
                    "Missing Authorization header",
                    "MISSING_AUTH",
                )),
            )
        })?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new(
                    "Invalid Authorization header format. Expected 'Bearer <token>'",
                    "INVALID_AUTH_FORMAT",
                )),
            )
        })?
        .to_string();

    let identity = state.validator.validate(&token).await.map_err(|e| {
        debug!(error = %e, "Rejected bearer token");
        let code = match e {
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            _ => "INVALID_TOKEN",
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(
                format!("Invalid or expired token: {}", e),
                code,
            )),
        )
    })?;

    request.extensions_mut().insert(AuthUser {
        user_id: identity.user_id,
        scopes: identity.scopes,
        token,
    });

    Ok(next.run(request).await)
}
