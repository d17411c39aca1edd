//! # Sandbox Execution Service
//!
//! A multi-tenant server that grants browser clients an interactive shell
//! running inside a hardened, ephemeral container. A client opens a session
//! (choosing an environment such as bash, node, or python), attaches a
//! full-duplex terminal over a WebSocket, types commands, sees output, and
//! eventually disconnects; the container is then destroyed.
//!
//! ## Architecture
//!
//! Seven components, composed leaves-first by the [`coordinator`]:
//!
//! - [`environment`]: read-only catalog mapping environment name to container image.
//! - [`rate_limit`]: per-identity counters and windows; authoritative admission decisions.
//! - [`circuit_breaker`]: global resource probe; open/closed admission gate.
//! - [`container`]: hardened container creation/destruction via Docker/Podman.
//! - [`session`]: indexed set of live sessions, lifecycle states, idle-timeout reaper.
//! - [`bridge`]: per-connection fan-out between a client socket and a container exec stream.
//! - [`coordinator`]: public entry point composing the above to serve create/attach/destroy.
//!
//! The [`server`] module wires these into an `axum` HTTP/WebSocket surface; [`config`]
//! centralizes the environment-variable-driven configuration described in the external
//! interface contract.

/// Environment-variable-driven service configuration.
pub mod config;

/// Environment Registry: the read-only catalog of available sandbox environments.
pub mod environment;

/// Rate Limiter: per-identity admission windows and concurrency caps.
pub mod rate_limit;

/// Circuit Breaker: host-resource admission gate.
pub mod circuit_breaker;

/// Container orchestration and hardening profile.
///
/// Provides the Container Provisioner described in the component design:
/// hardened container creation, destruction, inspection, and orphan cleanup,
/// on top of a Docker/Podman API client via the bollard crate.
pub mod container;

/// Session Store: live session records, state machine, and idle reaper.
pub mod session;

/// Terminal Bridge: per-connection fan-out between a client socket and a
/// container's interactive exec stream.
pub mod bridge;

/// Session Coordinator: the public entry point composing every other component.
pub mod coordinator;

/// HTTP/WebSocket server wiring (admin surface + terminal attach endpoint).
pub mod server;

pub use config::Config;
pub use coordinator::{CoordinatorError, SessionCoordinator};
pub use environment::{Environment, EnvironmentRegistry};
pub use session::{Session, SessionId, SessionState};
