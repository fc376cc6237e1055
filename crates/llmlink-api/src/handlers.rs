use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Extension, Json,
};
use llmlink_proto::{
    DiscoverResponse, ErrorResponse, HealthResponse, RegisterTunnelResponse, RegistryStats,
    SuccessResponse, TunnelInfo,
};
use llmlink_registry::RegistryError;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::middleware::AuthUser;
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn registry_error(e: RegistryError) -> ApiError {
    match e {
        RegistryError::Unauthorized(msg) => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(msg, "UNAUTHORIZED")),
        ),
        RegistryError::InvalidTunnelInfo(msg) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(msg, "INVALID_TUNNEL_INFO")),
        ),
    }
}

/// Register the caller's tunnel, superseding any previous one
#[utoipa::path(
    post,
    path = "/tunnels",
    request_body = TunnelInfo,
    responses(
        (status = 200, description = "Tunnel registered", body = RegisterTunnelResponse),
        (status = 400, description = "Malformed tunnel info", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn register_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<TunnelInfo>, JsonRejection>,
) -> Result<Json<RegisterTunnelResponse>, ApiError> {
    let Json(info) = payload.map_err(|e| {
        debug!(user_id = %user.user_id, error = %e, "Rejected registration payload");
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                format!("Invalid tunnel info: {}", e.body_text()),
                "INVALID_TUNNEL_INFO",
            )),
        )
    })?;

    let tunnel_id = state
        .registry
        .register_tunnel(&user.user_id, info, &user.token)
        .await
        .map_err(registry_error)?;

    Ok(Json(RegisterTunnelResponse { tunnel_id }))
}

/// Unregister one of the caller's tunnels
///
/// Unknown or superseded ids report `success: false`.
#[utoipa::path(
    delete,
    path = "/tunnels/{tunnel_id}",
    params(
        ("tunnel_id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Unregister outcome", body = SuccessResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn unregister_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(tunnel_id): Path<String>,
) -> Json<SuccessResponse> {
    let success = state.registry.unregister_tunnel(&user.user_id, &tunnel_id);
    Json(SuccessResponse { success })
}

/// Refresh the heartbeat of the caller's tunnel
#[utoipa::path(
    post,
    path = "/tunnels/{tunnel_id}/heartbeat",
    params(
        ("tunnel_id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Heartbeat outcome", body = SuccessResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(tunnel_id): Path<String>,
) -> Json<SuccessResponse> {
    let success = state.registry.update_heartbeat(&user.user_id, &tunnel_id);
    Json(SuccessResponse { success })
}

/// Discover the caller's active tunnel
#[utoipa::path(
    get,
    path = "/tunnels/me",
    responses(
        (status = 200, description = "Discovery result", body = DiscoverResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn discover_tunnels(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<DiscoverResponse> {
    Json(state.registry.discover_tunnels(&user.user_id))
}

/// Registry statistics (operator scope required)
#[utoipa::path(
    get,
    path = "/tunnels/stats",
    responses(
        (status = 200, description = "Registry statistics", body = RegistryStats),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Operator scope required", body = ErrorResponse)
    ),
    tag = "system"
)]
pub async fn registry_stats(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<RegistryStats>, ApiError> {
    if !user.is_operator() {
        warn!(user_id = %user.user_id, "Stats requested without operator scope");
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("Operator scope required", "FORBIDDEN")),
        ));
    }

    Ok(Json(state.registry.get_registry_stats()))
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_tunnels: state.registry.count(),
    })
}
