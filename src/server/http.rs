//! Session admin REST surface: create, inspect, destroy, liveness.

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::coordinator::{CoordinatorError, CreateSessionRequest};
use crate::rate_limit::Tier;
use crate::server::{ws_url, AppState, VerifiedIdentity};
use crate::session::{Session, SessionState};

/// POST /api/v1/sessions body.
#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    /// Environment name, e.g. `"bash"`. Defaults to the registry default if omitted.
    #[serde(default)]
    pub environment: Option<String>,
    /// Opaque content-domain label.
    #[serde(default = "default_tool_pair")]
    pub tool_pair: String,
    /// Overrides the environment's default idle timeout, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_tool_pair() -> String {
    "default".to_string()
}

/// Canonical session response shape, per the external interface contract.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    id: String,
    state: String,
    environment: String,
    tool_pair: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    ws_url: String,
}

impl SessionResponse {
    fn from_session(session: &Session, bind_addr: SocketAddr) -> Self {
        let expires_at = session.last_activity_at
            + chrono::Duration::milliseconds(session.timeout_ms as i64);
        Self {
            id: session.id.to_string(),
            state: state_label(session.state).to_string(),
            environment: session.environment.clone(),
            tool_pair: session.tool_pair.clone(),
            created_at: session.created_at,
            expires_at,
            ws_url: ws_url(bind_addr, &session.id.to_string()),
        }
    }
}

fn state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Creating => "CREATING",
        SessionState::Running => "RUNNING",
        SessionState::Destroying => "DESTROYING",
        SessionState::Destroyed => "DESTROYED",
        SessionState::Expired => "EXPIRED",
    }
}

/// Uniform error body: `{error, message, retryAfter?}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

fn error_response(err: CoordinatorError) -> Response {
    let (status, kind, retry_after) = match &err {
        CoordinatorError::CircuitOpen(_) => (StatusCode::SERVICE_UNAVAILABLE, "CircuitOpen", None),
        CoordinatorError::RateLimited { retry_after_seconds } => {
            (StatusCode::TOO_MANY_REQUESTS, "TooManySessions", *retry_after_seconds)
        }
        CoordinatorError::UnknownEnvironment(_) => (StatusCode::BAD_REQUEST, "UnknownEnvironment", None),
        CoordinatorError::Container(_) => (StatusCode::BAD_GATEWAY, "ProvisionFailed", None),
        CoordinatorError::Session(_) => (StatusCode::NOT_FOUND, "SessionNotFound", None),
        CoordinatorError::InvalidState { .. } => (StatusCode::CONFLICT, "InvalidState", None),
        CoordinatorError::NotAuthorized(_) => (StatusCode::FORBIDDEN, "Forbidden", None),
    };

    let body = ErrorBody {
        error: kind,
        message: err.to_string(),
        retry_after,
    };
    (status, Json(body)).into_response()
}

/// Resolve the caller's tracking identity from an `authorization` bearer
/// token or `x-api-key` header, falling back to anonymous-by-ip.
async fn identity(headers: &HeaderMap, verifier: &dyn crate::server::TokenVerifier, peer: SocketAddr) -> VerifiedIdentity {
    let credential = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));

    let verified = match credential {
        Some(c) => verifier.verify(c).await,
        None => None,
    };

    verified.unwrap_or(VerifiedIdentity {
        owner_key: format!("ip:{}", peer.ip()),
        tier: Tier::Anonymous,
    })
}

/// `POST /api/v1/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    let who = identity(&headers, state.verifier.as_ref(), peer).await;
    let environment = body
        .environment
        .unwrap_or_else(|| state.coordinator.environments().get_default().name.clone());

    let req = CreateSessionRequest {
        environment,
        tool_pair: body.tool_pair,
        owner_key: who.owner_key,
        tier: who.tier,
        timeout_override_ms: body.timeout_ms,
    };

    match state.coordinator.create_session(req).await {
        Ok(session) => {
            (StatusCode::CREATED, Json(SessionResponse::from_session(&session, state.bind_addr))).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /api/v1/sessions/:id`
pub async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.coordinator.sessions().get(id) {
        Ok(session) => Json(SessionResponse::from_session(&session, state.bind_addr)).into_response(),
        Err(e) => error_response(CoordinatorError::Session(e)),
    }
}

/// `DELETE /api/v1/sessions/:id`
pub async fn destroy_session(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let who = identity(&headers, state.verifier.as_ref(), peer).await;
    let is_admin = matches!(who.tier, Tier::Admin);
    match state
        .coordinator
        .destroy_session(id, &who.owner_key, is_admin)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> Response {
    let stats = state.coordinator.sessions().stats();
    Json(serde_json::json!({
        "status": "ok",
        "sessions": stats.total,
    }))
    .into_response()
}
