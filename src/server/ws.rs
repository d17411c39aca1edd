//! WebSocket upgrade handshake: validates path, query parameters, origin,
//! and credential, then hands off to the Terminal Bridge.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::net::SocketAddr;
use uuid::Uuid;
use tracing::warn;

use crate::bridge::BridgeContext;
use crate::coordinator::CoordinatorError;
use crate::rate_limit::Tier;
use crate::server::AppState;

const MIN_COLS: u32 = 20;
const MAX_COLS: u32 = 500;
const DEFAULT_COLS: u32 = 80;
const MIN_ROWS: u32 = 5;
const MAX_ROWS: u32 = 200;
const DEFAULT_ROWS: u32 = 24;

/// `?cols=&rows=&token=&api-key=` on the attach URL.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    cols: Option<u32>,
    #[serde(default)]
    rows: Option<u32>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "api-key")]
    api_key: Option<String>,
}

fn clamp(value: Option<u32>, min: u32, max: u32, default: u32) -> u32 {
    value.map(|v| v.clamp(min, max)).unwrap_or(default)
}

fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(|origin| allowed.iter().any(|a| a == origin))
        .unwrap_or(false)
}

/// `GET /api/v1/sessions/:id/ws`
pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(&headers, &state.allowed_origins) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let credential = query.token.as_deref().or(query.api_key.as_deref());
    let verified = match credential {
        Some(c) => state.verifier.verify(c).await,
        None => None,
    };
    let who = match verified {
        Some(identity) => identity,
        None if credential.is_none() => crate::server::VerifiedIdentity {
            owner_key: format!("ip:{}", peer.ip()),
            tier: Tier::Anonymous,
        },
        None => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let cols = clamp(query.cols, MIN_COLS, MAX_COLS, DEFAULT_COLS);
    let rows = clamp(query.rows, MIN_ROWS, MAX_ROWS, DEFAULT_ROWS);

    let (session, connection_id) = match state.coordinator.attach(id).await {
        Ok(pair) => pair,
        Err(CoordinatorError::Session(_)) => return StatusCode::BAD_REQUEST.into_response(),
        Err(CoordinatorError::InvalidState { .. }) => return StatusCode::BAD_REQUEST.into_response(),
        Err(CoordinatorError::RateLimited { .. }) => return StatusCode::TOO_MANY_REQUESTS.into_response(),
        Err(e) => {
            warn!("attach failed for session {}: {}", id, e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let Some(container_id) = session.container_id.clone() else {
        state.coordinator.release_connection(&who.owner_key, &connection_id);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let ctx = BridgeContext {
        docker: state.docker.clone(),
        container_id,
        session_id: session.id,
        owner_key: who.owner_key,
        tier: who.tier,
        connection_id,
        cols,
        rows,
        welcome_banner: None,
    };

    let sessions = state.coordinator.sessions().clone();
    let rate_limiter = state.coordinator.rate_limiter().clone();
    let connections = state.connections.clone();

    ws.on_upgrade(move |socket| async move {
        crate::bridge::run(socket, ctx, sessions, rate_limiter, connections).await;
    })
}
