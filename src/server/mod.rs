//! HTTP/WebSocket wiring: the axum router, shared application state, and the
//! identity-verification seam the Coordinator sits behind.
//!
//! Laid out the way `OpenAgentsInc-openagents`'s `backend::server` module
//! splits things — `mod.rs` for state + router assembly, `http` for REST
//! handlers, `ws` for the upgrade handshake that hands off to
//! [`crate::bridge`].

pub mod http;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use bollard::Docker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bridge::ConnectionRegistry;
use crate::coordinator::SessionCoordinator;
use crate::rate_limit::Tier;

/// Result of verifying a client-supplied token or api-key.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    /// Tracking identity: user id for authenticated clients.
    pub owner_key: String,
    /// Identity class, determines rate-limit table.
    pub tier: Tier,
}

/// Seam for the excluded OAuth/JWT provider. The core only needs a yes/no
/// plus an identity and tier; how a token is minted and verified is an
/// external collaborator's concern. `async` because a real implementation
/// typically calls out to an identity provider.
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token or api-key. `None` means rejected.
    async fn verify(&self, credential: &str) -> Option<VerifiedIdentity>;
}

/// Default verifier used when no credential is presented: every caller is
/// `Anonymous`, tracked by client IP. Suitable for local development and as
/// the fallback an external auth provider wraps.
pub struct AnonymousByIp;

#[async_trait::async_trait]
impl TokenVerifier for AnonymousByIp {
    async fn verify(&self, _credential: &str) -> Option<VerifiedIdentity> {
        None
    }
}

/// Shared application state, cheap to `Clone` (every field is an `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// The Session Coordinator, the sole entry point into the core.
    pub coordinator: Arc<SessionCoordinator>,
    /// Docker/Podman client, shared with the Terminal Bridge for exec creation.
    pub docker: Arc<Docker>,
    /// Credential verifier; defaults to [`AnonymousByIp`] if none is wired in.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Allowed WebSocket `origin` header values. Empty means "no check" (local dev).
    pub allowed_origins: Arc<Vec<String>>,
    /// Address clients are expected to reach this service at, for building `wsUrl` fields.
    pub bind_addr: SocketAddr,
    /// Live bridge connections, drained with a 1000 close on shutdown.
    pub connections: ConnectionRegistry,
}

/// Build the service router: session admin REST surface, the WebSocket
/// upgrade endpoint, and a liveness probe.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/sessions", post(http::create_session))
        .route("/api/v1/sessions/:id", get(http::get_session))
        .route("/api/v1/sessions/:id", delete(http::destroy_session))
        .route("/api/v1/sessions/:id/ws", get(ws::ws_handler))
        .route("/healthz", get(http::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Format a session's attach URL for the REST response, given the bind
/// address clients are expected to reach the service at.
pub fn ws_url(bind_addr: SocketAddr, session_id: &str) -> String {
    format!("ws://{bind_addr}/api/v1/sessions/{session_id}/ws")
}
