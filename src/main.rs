use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sandbox_server::bridge::{self, ConnectionRegistry};
use sandbox_server::circuit_breaker::CircuitBreaker;
use sandbox_server::config::Config;
use sandbox_server::container::{ContainerOrchestrator, ContainerOrchestratorConfig};
use sandbox_server::coordinator::SessionCoordinator;
use sandbox_server::environment::EnvironmentRegistry;
use sandbox_server::rate_limit::RateLimiter;
use sandbox_server::server::{self, AnonymousByIp, AppState};
use sandbox_server::session::SessionStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Bound on how long shutdown waits for in-flight bridge connections to tear
/// down after they've been sent a close frame.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sandbox_server=info,tower_http=warn")),
        )
        .init();

    info!("starting sandbox execution service");

    let config = Config::from_env()?;

    let orchestrator = Arc::new(
        ContainerOrchestrator::with_config(ContainerOrchestratorConfig::default()).await?,
    );

    let gvisor_runtime = if config.use_gvisor {
        match orchestrator.client().has_runtime(&config.gvisor_runtime).await {
            Ok(true) => Some(config.gvisor_runtime.clone()),
            Ok(false) => {
                warn!(
                    "gVisor runtime {:?} requested but not registered with the container daemon; falling back to the default runtime",
                    config.gvisor_runtime
                );
                None
            }
            Err(e) => {
                warn!("failed to probe container daemon for gVisor support: {}", e);
                None
            }
        }
    } else {
        None
    };

    match orchestrator.cleanup_orphaned().await {
        Ok(removed) if !removed.is_empty() => {
            info!("cleaned up {} orphaned container(s) from a prior run", removed.len());
        }
        Ok(_) => {}
        Err(e) => warn!("orphan container cleanup failed: {}", e),
    }

    let environments = Arc::new(EnvironmentRegistry::builtin());
    let rate_limiter = Arc::new(RateLimiter::new(config.disable_rate_limit || config.dev_mode));
    let circuit_breaker = CircuitBreaker::new(
        config.circuit_max_containers,
        config.circuit_max_memory_percent,
        config.dev_mode,
    );
    let sessions = Arc::new(SessionStore::new());

    let coordinator = Arc::new(SessionCoordinator::new(
        circuit_breaker,
        rate_limiter,
        environments,
        Arc::clone(&orchestrator),
        sessions,
        gvisor_runtime,
    ));
    coordinator.spawn_reaper(config.reaper_interval());

    let docker = Arc::new(orchestrator.client().docker().clone());
    let connections: ConnectionRegistry = Arc::new(DashMap::new());
    let state = AppState {
        coordinator,
        docker,
        verifier: Arc::new(AnonymousByIp),
        allowed_origins: Arc::new(Vec::new()),
        bind_addr: config.bind_addr,
        connections: Arc::clone(&connections),
    };

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(connections))
    .await?;

    info!("sandbox execution service shut down");
    Ok(())
}

/// Waits for Ctrl+C, then actively closes every live terminal connection with
/// a normal-closure frame and waits (bounded) for each bridge task to
/// deregister itself, instead of merely letting the listener stop accepting
/// new connections.
async fn shutdown_signal(connections: ConnectionRegistry) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received, closing active connections"),
        Err(e) => warn!("failed to install Ctrl+C handler: {}", e),
    }

    let outstanding = connections.len();
    if outstanding == 0 {
        return;
    }

    info!("closing {} active terminal connection(s)", outstanding);
    bridge::close_all(&connections).await;

    let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
    while !connections.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let remaining = connections.len();
    if remaining > 0 {
        // Not forcibly aborted here: there's no JoinHandle to a bridge task
        // by this point, only its registry entry. Returning lets
        // `#[tokio::main]` drop the runtime, which drops every still-running
        // task (and its PTY write-half) along with it, so the process still
        // exits promptly even for a client that never acknowledges the close.
        warn!("{} connection(s) did not drain before shutdown timeout", remaining);
    }
}
