//! LLMLink CLI - tunnel registry server and discovery tooling
//!
//! Runs the registry that desktop agents register their tunnels with, and
//! lets you check from the command line which endpoint a proxy would pick.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use llmlink_api::{ApiServer, ApiServerConfig};
use llmlink_auth::{IdentityValidator, JwtClaims, JwtValidator, OPERATOR_SCOPE};
use llmlink_client::{
    ConnectionManager, ConnectionManagerConfig, DiscoveryConfig, DiscoveryService,
    ExecutionContext, HttpEndpointProbe, HttpRegistryClient, DEFAULT_DIRECT_URL,
};
use llmlink_registry::{
    HealthMonitor, HealthProbe, HttpHealthProbe, NoopProbe, RegistryConfig, RegistryEvent,
    TunnelRegistry,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// LLMLink - route LLM requests to a user's own machine
#[derive(Parser, Debug)]
#[command(name = "llmlink")]
#[command(about = "LLMLink - tunnel registry and endpoint discovery")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel registry HTTP server
    #[command(long_about = r#"
Run the tunnel registry. Desktop agents register their public tunnel here
and keep it alive with heartbeats; per-user proxies discover it.

EXAMPLES:
  # Development registry with a shared secret
  llmlink serve --jwt-secret dev-secret

  # Timing from a YAML file, probing tunnels in addition to heartbeats
  llmlink serve --config registry.yaml --probe

ENVIRONMENT VARIABLES:
  LLMLINK_BIND                   Address to listen on
  LLMLINK_JWT_SECRET             HS256 secret for bearer tokens
  LLMLINK_JWT_PUBLIC_KEY         RS256 public key (PEM file), overrides the secret
  LLMLINK_CONFIG                 Registry config file (YAML)
  LLMLINK_HEARTBEAT_INTERVAL     Expected heartbeat period in seconds
  LLMLINK_STALENESS_WINDOW       Heartbeat age in seconds before eviction
    "#)]
    Serve {
        /// Address to listen on
        #[arg(long, env = "LLMLINK_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,

        /// HS256 secret used to verify bearer tokens
        #[arg(long, env = "LLMLINK_JWT_SECRET", required_unless_present = "jwt_public_key")]
        jwt_secret: Option<String>,

        /// RS256 public key in PEM format used to verify bearer tokens
        #[arg(long, env = "LLMLINK_JWT_PUBLIC_KEY")]
        jwt_public_key: Option<PathBuf>,

        /// Required token issuer
        #[arg(long, env = "LLMLINK_JWT_ISSUER")]
        jwt_issuer: Option<String>,

        /// Required token audience
        #[arg(long, env = "LLMLINK_JWT_AUDIENCE")]
        jwt_audience: Option<String>,

        /// Registry timing configuration (YAML, durations in seconds)
        #[arg(long, env = "LLMLINK_CONFIG")]
        config: Option<PathBuf>,

        /// Expected heartbeat period in seconds
        #[arg(long, env = "LLMLINK_HEARTBEAT_INTERVAL")]
        heartbeat_interval: Option<u64>,

        /// Heartbeat age in seconds after which a tunnel is evicted
        #[arg(long, env = "LLMLINK_STALENESS_WINDOW")]
        staleness_window: Option<u64>,

        /// Health loop period in seconds
        #[arg(long, env = "LLMLINK_HEALTH_CHECK_INTERVAL")]
        health_check_interval: Option<u64>,

        /// Failed checks before a tunnel is hidden from discovery
        #[arg(long, env = "LLMLINK_FAILURE_THRESHOLD")]
        failure_threshold: Option<u32>,

        /// Probe each tunnel's public URL in addition to heartbeats
        #[arg(long, env = "LLMLINK_PROBE")]
        probe: bool,

        /// Enable permissive CORS
        #[arg(long, env = "LLMLINK_CORS")]
        cors: bool,
    },

    /// Discover a user's tunnel and print the endpoint a proxy would use
    Discover {
        /// Registry base URL
        #[arg(long, env = "LLMLINK_REGISTRY_URL")]
        registry: String,

        /// Bearer token of the user
        #[arg(long, env = "LLMLINK_TOKEN")]
        token: String,

        /// Execution context of the caller (browser or desktop)
        #[arg(long, env = "LLMLINK_CONTEXT", default_value = "desktop")]
        context: ExecutionContext,

        /// Local LLM runtime used for direct connections
        #[arg(long, env = "LLMLINK_DIRECT_URL", default_value = DEFAULT_DIRECT_URL)]
        direct_url: String,

        /// Never consider a direct connection
        #[arg(long)]
        no_direct: bool,

        /// Verify the direct URL and the tunnel answer before selecting them
        #[arg(long)]
        probe: bool,

        /// Registry request timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,

        /// Keep polling and print every connection mode change
        #[arg(long)]
        watch: bool,

        /// Poll interval in seconds when watching
        #[arg(long, default_value = "30")]
        poll_interval: u64,
    },

    /// Mint a development bearer token
    Token {
        /// User the token identifies
        #[arg(long)]
        user: String,

        /// HS256 secret, must match the registry's
        #[arg(long, env = "LLMLINK_JWT_SECRET")]
        secret: String,

        /// Grant the operator scope (registry stats)
        #[arg(long)]
        operator: bool,

        /// Validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,

        #[arg(long, default_value = "llmlink")]
        issuer: String,

        #[arg(long, default_value = "llmlink-registry")]
        audience: String,
    },
}

/// Setup logging with the specified log level
///
/// `RUST_LOG` takes precedence when set.
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let default_filter = format!(
        "llmlink={level},llmlink_registry={level},llmlink_api={level},llmlink_client={level},tower_http={level}",
        level = log_level
    );

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_registry_config(path: &Path) -> Result<RegistryConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Log registry lifecycle events until the registry goes away
async fn log_events(mut events: broadcast::Receiver<RegistryEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(
                user_id = %event.user_id(),
                tunnel_id = %event.tunnel_id(),
                event = ?event,
                "Registry event"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log lagging behind registry");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    bind: SocketAddr,
    jwt_secret: Option<String>,
    jwt_public_key: Option<PathBuf>,
    jwt_issuer: Option<String>,
    jwt_audience: Option<String>,
    mut config: RegistryConfig,
    cors: bool,
) -> Result<()> {
    config
        .validate()
        .context("Invalid registry configuration")?;

    // A probe must finish within one health pass
    if config.probe_timeout > config.health_check_interval {
        warn!(
            probe_timeout = ?config.probe_timeout,
            health_check_interval = ?config.health_check_interval,
            "Probe timeout exceeds health check interval, clamping"
        );
        config.probe_timeout = config.health_check_interval;
    }

    let mut jwt = match (jwt_public_key, jwt_secret) {
        (Some(path), _) => {
            let pem = std::fs::read(&path)
                .with_context(|| format!("Failed to read public key {}", path.display()))?;
            JwtValidator::from_rsa_pem(&pem).context("Invalid RS256 public key")?
        }
        (None, Some(secret)) => JwtValidator::new(secret.as_bytes()),
        (None, None) => anyhow::bail!("Either --jwt-secret or --jwt-public-key is required"),
    };
    if let Some(issuer) = jwt_issuer {
        jwt = jwt.with_issuer(issuer);
    }
    if let Some(audience) = jwt_audience {
        jwt = jwt.with_audience(audience);
    }
    let validator: Arc<dyn IdentityValidator> = Arc::new(jwt);

    let probe: Arc<dyn HealthProbe> = if config.probe_enabled {
        Arc::new(HttpHealthProbe::new(config.probe_timeout).context("Failed to build probe")?)
    } else {
        Arc::new(NoopProbe)
    };

    let registry = Arc::new(TunnelRegistry::with_probe(
        config,
        validator.clone(),
        probe,
    ));
    let event_log = tokio::spawn(log_events(registry.subscribe()));
    let monitor = HealthMonitor::start(registry.clone());

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: bind,
            enable_cors: cors,
        },
        registry,
        validator,
    );

    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutting down registry");
        })
        .await?;

    monitor.shutdown().await;
    event_log.abort();
    info!("Registry stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn discover(
    registry_url: String,
    token: String,
    context: ExecutionContext,
    direct_url: Option<String>,
    probe: bool,
    timeout: Duration,
    watch: bool,
    poll_interval: Duration,
) -> Result<()> {
    let config = DiscoveryConfig::new(registry_url.clone())
        .with_request_timeout(timeout)
        .with_poll_interval(poll_interval);
    config.validate().context("Invalid discovery configuration")?;
    let manager_config = ConnectionManagerConfig::new(context)
        .with_direct_url(direct_url)
        .with_direct_check_interval(poll_interval);
    manager_config
        .validate()
        .context("Invalid connection configuration")?;

    let client = HttpRegistryClient::new(&registry_url, token, timeout)
        .context("Failed to create registry client")?;
    let mut discovery = DiscoveryService::new(config, Arc::new(client));

    let endpoint_probe = if probe {
        let probe = Arc::new(HttpEndpointProbe::new(timeout).context("Failed to build probe")?);
        discovery = discovery.with_probe(probe.clone());
        Some(probe)
    } else {
        None
    };

    let discovery = Arc::new(discovery);
    let mut manager = ConnectionManager::new(manager_config, discovery.clone());
    if let Some(probe) = endpoint_probe {
        manager = manager.with_direct_probe(probe);
    }
    let manager = Arc::new(manager);

    manager.check_direct().await;
    discovery.discover_tunnels().await;
    manager.get_best_endpoint();
    let status = manager.get_status();

    if !watch {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    // Starting point, later lines are changes only
    println!("{}", serde_json::to_string(&status)?);
    let mut modes = manager.subscribe();
    let poller = discovery
        .start_polling()
        .context("Failed to start discovery polling")?;
    let direct_monitor = manager
        .start_direct_monitor()
        .context("Failed to start direct monitor")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = modes.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = manager.get_status();
                println!("{}", serde_json::to_string(&status)?);
            }
        }
    }

    poller.shutdown().await;
    direct_monitor.shutdown().await;
    Ok(())
}

fn mint_token(
    user: String,
    secret: String,
    operator: bool,
    hours: i64,
    issuer: String,
    audience: String,
) -> Result<()> {
    let mut claims = JwtClaims::new(user, issuer, audience, chrono::Duration::hours(hours));
    if operator {
        claims = claims.with_scope(OPERATOR_SCOPE);
    }
    let token = JwtValidator::encode(secret.as_bytes(), &claims).context("Failed to sign token")?;

    eprintln!("Expires: {}", claims.exp_formatted());
    println!("{}", token);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            bind,
            jwt_secret,
            jwt_public_key,
            jwt_issuer,
            jwt_audience,
            config,
            heartbeat_interval,
            staleness_window,
            health_check_interval,
            failure_threshold,
            probe,
            cors,
        } => {
            let mut registry_config = match config {
                Some(path) => load_registry_config(&path)?,
                None => RegistryConfig::default(),
            };

            // Flags override file values
            if let Some(secs) = heartbeat_interval {
                let heartbeat = Duration::from_secs(secs);
                // Keep the staleness ratio unless it was set explicitly
                if staleness_window.is_none() {
                    let ratio = registry_config.staleness_window.as_secs_f64()
                        / registry_config.heartbeat_interval.as_secs_f64().max(1.0);
                    registry_config.staleness_window = heartbeat.mul_f64(ratio);
                }
                registry_config.heartbeat_interval = heartbeat;
            }
            if let Some(secs) = staleness_window {
                registry_config.staleness_window = Duration::from_secs(secs);
            }
            if let Some(secs) = health_check_interval {
                registry_config.health_check_interval = Duration::from_secs(secs);
            }
            if let Some(threshold) = failure_threshold {
                registry_config.failure_threshold = threshold;
            }
            if probe {
                registry_config.probe_enabled = true;
            }

            info!(
                "Starting LLMLink registry {} ({})",
                env!("GIT_TAG"),
                env!("GIT_HASH")
            );

            serve(
                bind,
                jwt_secret,
                jwt_public_key,
                jwt_issuer,
                jwt_audience,
                registry_config,
                cors,
            )
            .await
        }
        Commands::Discover {
            registry,
            token,
            context,
            direct_url,
            no_direct,
            probe,
            timeout,
            watch,
            poll_interval,
        } => {
            let direct_url = if no_direct { None } else { Some(direct_url) };
            discover(
                registry,
                token,
                context,
                direct_url,
                probe,
                Duration::from_secs(timeout),
                watch,
                Duration::from_secs(poll_interval),
            )
            .await
        }
        Commands::Token {
            user,
            secret,
            operator,
            hours,
            issuer,
            audience,
        } => mint_token(user, secret, operator, hours, issuer, audience),
    }
}
