//! Session Coordinator: the single writer that orchestrates the other six
//! components through a session's lifecycle.
//!
//! Nothing else calls into the Container Provisioner, Rate Limiter, or
//! Session Store directly from the HTTP/WS layer — every cross-component
//! sequence (admission, creation, attach, teardown) is expressed here so
//! there is exactly one place that knows the compensating actions for a
//! failure partway through.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::container::{ContainerConfig, ContainerError, ContainerOrchestrator};
use crate::environment::{EnvironmentError, EnvironmentRegistry};
use crate::rate_limit::{RateLimitError, RateLimiter, Tier};
use crate::session::{Session, SessionId, SessionState, SessionStore, SessionStoreError};

/// Coordinator-level errors. Each variant carries enough context for the
/// server layer to map it to an HTTP status / WS close code.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The circuit breaker is open; retry later.
    #[error("service at capacity: {0}")]
    CircuitOpen(String),
    /// A rate-limit cap was hit. `retry_after_seconds` is `Some` only for
    /// windowed (not concurrency) denials.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds until the window resets, if known.
        retry_after_seconds: Option<u64>,
    },
    /// Requested environment name is not in the catalog.
    #[error(transparent)]
    UnknownEnvironment(#[from] EnvironmentError),
    /// Container provisioning failed.
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// Session id is unknown or already torn down.
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    /// The session is not in a state this operation allows.
    #[error("session {id} is not in a state that allows this operation (state: {state:?})")]
    InvalidState {
        /// Session in question.
        id: SessionId,
        /// Its current state.
        state: SessionState,
    },
    /// Caller does not own this session and is not an admin.
    #[error("not authorized to act on session {0}")]
    NotAuthorized(SessionId),
}

/// Everything needed to admit and create a session.
pub struct CreateSessionRequest {
    /// Environment name, e.g. `"bash"`.
    pub environment: String,
    /// Opaque content-domain label, used for container labels and welcome banner.
    pub tool_pair: String,
    /// Tracking identity: user id or client IP.
    pub owner_key: String,
    /// Identity class.
    pub tier: Tier,
    /// Overrides the environment's default idle timeout, if set.
    pub timeout_override_ms: Option<u64>,
}

/// The Session Coordinator.
pub struct SessionCoordinator {
    circuit_breaker: CircuitBreaker,
    rate_limiter: Arc<RateLimiter>,
    environments: Arc<EnvironmentRegistry>,
    provisioner: Arc<ContainerOrchestrator>,
    sessions: Arc<SessionStore>,
    gvisor_runtime: Option<String>,
}

impl SessionCoordinator {
    /// Assemble a coordinator from its six collaborators.
    pub fn new(
        circuit_breaker: CircuitBreaker,
        rate_limiter: Arc<RateLimiter>,
        environments: Arc<EnvironmentRegistry>,
        provisioner: Arc<ContainerOrchestrator>,
        sessions: Arc<SessionStore>,
        gvisor_runtime: Option<String>,
    ) -> Self {
        Self {
            circuit_breaker,
            rate_limiter,
            environments,
            provisioner,
            sessions,
            gvisor_runtime,
        }
    }

    /// Shared handle to the Session Store, for the server layer's read-only
    /// listing/health endpoints.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Shared handle to the Rate Limiter, for admin endpoints.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Shared handle to the Container Provisioner, for the Terminal Bridge.
    pub fn provisioner(&self) -> &Arc<ContainerOrchestrator> {
        &self.provisioner
    }

    /// Shared handle to the Environment Registry, for the server layer's
    /// default-environment fallback.
    pub fn environments(&self) -> &Arc<EnvironmentRegistry> {
        &self.environments
    }

    /// Admit and create a new session: circuit breaker, then rate limit,
    /// then environment lookup, then container provisioning, then Store
    /// bookkeeping. Any failure after the circuit/rate-limit gates rolls
    /// back what it already did.
    ///
    /// # Errors
    ///
    /// See [`CoordinatorError`] variants.
    pub async fn create_session(&self, req: CreateSessionRequest) -> Result<Session, CoordinatorError> {
        let status = self
            .circuit_breaker
            .status(self.sessions.container_count())
            .await;
        if status.is_open {
            return Err(CoordinatorError::CircuitOpen(
                status.reason.unwrap_or_else(|| "at capacity".to_string()),
            ));
        }

        let admission = self.rate_limiter.check_session_limit(&req.owner_key, req.tier);
        if !admission.allowed {
            return Err(CoordinatorError::RateLimited {
                retry_after_seconds: admission.retry_after_seconds,
            });
        }

        let environment = self.environments.get(&req.environment)?;

        let id: SessionId = Uuid::new_v4();
        let now = Utc::now();
        let timeout_ms = req
            .timeout_override_ms
            .unwrap_or_else(|| environment.default_timeout.as_millis() as u64);

        let creating = Session {
            id,
            tool_pair: req.tool_pair.clone(),
            environment: req.environment.clone(),
            container_id: None,
            owner_key: req.owner_key.clone(),
            tier: req.tier,
            state: SessionState::Creating,
            created_at: now,
            last_activity_at: now,
            timeout_ms,
        };
        self.sessions.create(creating);

        let mut builder = ContainerConfig::builder()
            .image(environment.container_image.clone())
            .hardened(1000, 1000);
        if let Some(runtime) = &self.gvisor_runtime {
            builder = builder.runtime(runtime.clone());
        }
        let config = match builder.build() {
            Ok(c) => c,
            Err(e) => {
                self.sessions.remove(id);
                return Err(CoordinatorError::Container(e));
            }
        };

        let mut labels = HashMap::new();
        labels.insert("sandbox.session_id".to_string(), id.to_string());
        labels.insert("sandbox.tool_pair".to_string(), req.tool_pair.clone());

        let container_id = match self
            .provisioner
            .create_container(&config, None, labels)
            .await
        {
            Ok(cid) => cid,
            Err(e) => {
                self.sessions.remove(id);
                return Err(CoordinatorError::Container(e));
            }
        };

        if let Err(e) = self.sessions.transition_state(id, SessionState::Creating, SessionState::Running) {
            warn!("session {} failed post-provision transition: {}", id, e);
            self.provisioner.destroy(&container_id).await.ok();
            self.sessions.remove(id);
            return Err(CoordinatorError::Session(e));
        }

        // `container_id` is only known after provisioning; update the
        // record directly rather than widening `transition_state`'s contract.
        if let Ok(mut session) = self.sessions.get(id) {
            session.container_id = Some(container_id.clone());
            self.sessions.create(session);
        }

        self.rate_limiter.record_session(&req.owner_key, &id.to_string(), req.tier);

        info!("created session {} (container {})", id, container_id);
        self.sessions.get(id).map_err(CoordinatorError::Session)
    }

    /// Validate that a connection may attach to `id`: session must be
    /// `Running`, and the connection concurrency cap must have room. Returns
    /// the session snapshot and a connection id the caller must later
    /// release with [`Self::release_connection`].
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::Session`] if unknown, [`CoordinatorError::InvalidState`]
    /// if not `Running`, [`CoordinatorError::RateLimited`] if connections are capped.
    pub async fn attach(&self, id: SessionId) -> Result<(Session, String), CoordinatorError> {
        let session = self.sessions.get(id)?;
        if session.state != SessionState::Running {
            return Err(CoordinatorError::InvalidState {
                id,
                state: session.state,
            });
        }

        let admission = self
            .rate_limiter
            .check_connection_limit(&session.owner_key, session.tier);
        if !admission.allowed {
            return Err(CoordinatorError::RateLimited {
                retry_after_seconds: None,
            });
        }

        let connection_id = Uuid::new_v4().to_string();
        self.rate_limiter
            .register_connection(&session.owner_key, &connection_id, session.tier);
        self.sessions.update_activity(id, Utc::now()).ok();

        Ok((session, connection_id))
    }

    /// Release a connection slot claimed by [`Self::attach`]. Idempotent.
    pub fn release_connection(&self, owner_key: &str, connection_id: &str) {
        self.rate_limiter.unregister_connection(owner_key, connection_id);
    }

    /// Explicitly destroy a session. `requester_key` must match the
    /// session's `owner_key`, unless `is_admin` is set.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::Session`] if unknown, [`CoordinatorError::NotAuthorized`]
    /// if the requester doesn't own it, [`CoordinatorError::InvalidState`] if
    /// already terminal or mid-teardown.
    pub async fn destroy_session(
        &self,
        id: SessionId,
        requester_key: &str,
        is_admin: bool,
    ) -> Result<(), CoordinatorError> {
        let session = self.sessions.get(id)?;
        if !is_admin && session.owner_key != requester_key {
            return Err(CoordinatorError::NotAuthorized(id));
        }
        if session.state != SessionState::Running {
            return Err(CoordinatorError::InvalidState {
                id,
                state: session.state,
            });
        }

        self.teardown(session).await
    }

    /// Internal teardown shared by explicit destroy and the idle reaper.
    /// Assumes the session has already left `Running` (either transitioned
    /// to `Destroying` by the caller, or already `Expired` by the Store's
    /// own sweep).
    async fn teardown(&self, mut session: Session) -> Result<(), CoordinatorError> {
        let was_running = session.state == SessionState::Running;
        if was_running {
            self.sessions
                .transition_state(session.id, SessionState::Running, SessionState::Destroying)?;
            session.state = SessionState::Destroying;
        }

        if let Some(container_id) = &session.container_id {
            if let Err(e) = self.provisioner.destroy(container_id).await {
                warn!("failed to destroy container {} for session {}: {}", container_id, session.id, e);
            }
        }

        self.rate_limiter.remove_session(&session.owner_key, &session.id.to_string());

        if was_running {
            // The pre-transition snapshot already moved the Store's copy to
            // `Destroying`; finish the graph edge and let the Store prune it.
            self.sessions
                .transition_state(session.id, SessionState::Destroying, SessionState::Destroyed)
                .ok();
        } else {
            self.sessions.remove(session.id);
        }

        info!("tore down session {}", session.id);
        Ok(())
    }

    /// Reap a session the Store's `sweep_expired` has already flagged:
    /// release its container and rate-limit slot. The Store has already
    /// transitioned it to `Expired` and removed it from the map by the time
    /// this runs, so there is no further state transition here.
    pub async fn reap(&self, session: Session) {
        if let Some(container_id) = &session.container_id {
            if let Err(e) = self.provisioner.destroy(container_id).await {
                warn!("failed to destroy container {} for expired session {}: {}", container_id, session.id, e);
            }
        }
        self.rate_limiter.remove_session(&session.owner_key, &session.id.to_string());
        info!("reaped idle session {}", session.id);
    }

    /// Spawn the idle-session reaper: wakes on `interval`, sweeps the Store,
    /// and tears down every session it reaped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: std::time::Duration) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reaped = coordinator.sessions.sweep_expired(Utc::now());
                for session in reaped {
                    coordinator.reap(session).await;
                }
            }
        });
    }

    /// Admin: force-remove a rate-limit key's record (e.g. after abuse).
    ///
    /// # Errors
    ///
    /// Never returns an error today; kept `Result`-shaped for symmetry with
    /// [`crate::rate_limit::RateLimiter::reset_limit`], which can fail.
    pub fn reset_rate_limit(&self, key: &str) -> Result<(), RateLimitError> {
        self.rate_limiter.reset_limit(key)
    }
}
