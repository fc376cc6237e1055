//! Registry HTTP surface
//!
//! Desktop agents register and heartbeat here, per-user proxies discover.
//! Every `/tunnels` route requires a bearer token resolved by the identity
//! collaborator; `/health` is public.

pub mod handlers;
pub mod middleware;

use axum::{
    http::{header, Method},
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use llmlink_auth::IdentityValidator;
use llmlink_registry::TunnelRegistry;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Registry plus the identity collaborator the middleware resolves tokens with
pub struct AppState {
    pub registry: Arc<TunnelRegistry>,
    pub validator: Arc<dyn IdentityValidator>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "LLMLink Tunnel Registry API",
        version = "0.1.0",
        description = "Registration, heartbeat and discovery of per-user LLM tunnels",
        contact(
            name = "LLMLink Team",
            email = "team@llmlink.dev"
        )
    ),
    paths(
        handlers::register_tunnel,
        handlers::unregister_tunnel,
        handlers::heartbeat,
        handlers::discover_tunnels,
        handlers::registry_stats,
        handlers::health_check,
    ),
    components(
        schemas(
            llmlink_proto::TunnelInfo,
            llmlink_proto::RegisterTunnelResponse,
            llmlink_proto::SuccessResponse,
            llmlink_proto::TunnelHealth,
            llmlink_proto::TunnelDetails,
            llmlink_proto::DiscoverResponse,
            llmlink_proto::RegistryStats,
            llmlink_proto::HealthResponse,
            llmlink_proto::ErrorResponse,
        )
    ),
    tags(
        (name = "tunnels", description = "Tunnel registration and discovery endpoints"),
        (name = "system", description = "System health and statistics endpoints")
    )
)]
struct ApiDoc;

pub struct ApiServerConfig {
    pub bind_addr: SocketAddr,
    /// Enable permissive CORS
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: false,
        }
    }
}

/// Registry HTTP server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        registry: Arc<TunnelRegistry>,
        validator: Arc<dyn IdentityValidator>,
    ) -> Self {
        let state = Arc::new(AppState {
            registry,
            validator,
        });

        Self { config, state }
    }

    /// Router with the public, bearer-protected and documentation routes
    ///
    /// Exposed so tests can drive it with `oneshot` without binding a port.
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        let public_router = Router::new()
            .route(llmlink_proto::HEALTH_PATH, get(handlers::health_check))
            .with_state(self.state.clone());

        let protected_router = Router::new()
            .route(llmlink_proto::TUNNELS_PATH, post(handlers::register_tunnel))
            .route(llmlink_proto::DISCOVER_PATH, get(handlers::discover_tunnels))
            .route(llmlink_proto::STATS_PATH, get(handlers::registry_stats))
            .route("/tunnels/{tunnel_id}", delete(handlers::unregister_tunnel))
            .route("/tunnels/{tunnel_id}/heartbeat", post(handlers::heartbeat))
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::require_identity,
            ));

        let mut router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(public_router)
            .merge(protected_router)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_methods([Method::GET, Method::POST, Method::DELETE])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                    .allow_origin(Any),
            );
        }

        router
    }

    /// Start the API server
    ///
    /// Runs until `shutdown` resolves.
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "Registry API listening");
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Registry API server failed: {}", e))?;

        Ok(())
    }
}
