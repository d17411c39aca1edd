//! End-to-end coverage of the session lifecycle against a real Docker (or
//! Podman) daemon: create, attach a terminal, run a command, destroy.
//!
//! Requires a running container daemon and network access to pull
//! `alpine:latest` on first run. Set `SKIP_CONTAINER_TESTS=1` to skip in
//! environments without one (CI runners without Docker-in-Docker, etc.).

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use sandbox_server::circuit_breaker::CircuitBreaker;
use sandbox_server::container::{ContainerOrchestrator, ContainerOrchestratorConfig};
use sandbox_server::coordinator::{CreateSessionRequest, SessionCoordinator};
use sandbox_server::environment::{Environment, EnvironmentRegistry};
use sandbox_server::rate_limit::{RateLimiter, Tier};
use sandbox_server::session::{SessionState, SessionStore};
use serial_test::serial;

fn should_run_container_tests() -> bool {
    if std::env::var("SKIP_CONTAINER_TESTS").is_ok() {
        return false;
    }
    Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
        || Command::new("podman")
            .arg("info")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
}

fn test_registry() -> EnvironmentRegistry {
    EnvironmentRegistry::new(
        vec![Environment {
            name: "shell".to_string(),
            description: "test shell".to_string(),
            category: "shell".to_string(),
            container_image: "alpine:latest".to_string(),
            default_timeout: Duration::from_secs(60),
        }],
        "shell",
    )
}

async fn build_coordinator_with_cap(max_containers: u32) -> Arc<SessionCoordinator> {
    let orchestrator = Arc::new(
        ContainerOrchestrator::with_config(ContainerOrchestratorConfig::default())
            .await
            .expect("container daemon must be reachable"),
    );
    let environments = Arc::new(test_registry());
    let rate_limiter = Arc::new(RateLimiter::new(false));
    let circuit_breaker = CircuitBreaker::new(max_containers, 85.0, true);
    let sessions = Arc::new(SessionStore::new());

    Arc::new(SessionCoordinator::new(
        circuit_breaker,
        rate_limiter,
        environments,
        orchestrator,
        sessions,
        None,
    ))
}

async fn build_coordinator() -> Arc<SessionCoordinator> {
    build_coordinator_with_cap(15).await
}

#[tokio::test]
#[serial]
async fn test_create_attach_destroy_round_trip() {
    if !should_run_container_tests() {
        eprintln!("skipping: no container daemon available");
        return;
    }

    let coordinator = build_coordinator().await;

    let session = coordinator
        .create_session(CreateSessionRequest {
            environment: "shell".to_string(),
            tool_pair: "jj-git".to_string(),
            owner_key: "ip:198.51.100.42".to_string(),
            tier: Tier::Anonymous,
            timeout_override_ms: None,
        })
        .await
        .expect("session creation should succeed against a live daemon");

    assert_eq!(session.state, SessionState::Running);
    assert!(session.container_id.is_some());

    let (attached, connection_id) = coordinator
        .attach(session.id)
        .await
        .expect("attach should succeed for a running session");
    assert_eq!(attached.id, session.id);
    coordinator.release_connection(&attached.owner_key, &connection_id);

    coordinator
        .destroy_session(session.id, &session.owner_key, false)
        .await
        .expect("destroy should succeed for the owner");

    assert!(coordinator.sessions().get(session.id).is_err());
}

#[tokio::test]
#[serial]
async fn test_attach_rejects_nonexistent_session() {
    if !should_run_container_tests() {
        eprintln!("skipping: no container daemon available");
        return;
    }

    let coordinator = build_coordinator().await;
    let result = coordinator.attach(uuid::Uuid::new_v4()).await;
    assert!(result.is_err());
}

#[tokio::test]
#[serial]
async fn test_destroy_by_non_owner_is_rejected() {
    if !should_run_container_tests() {
        eprintln!("skipping: no container daemon available");
        return;
    }

    let coordinator = build_coordinator().await;
    let session = coordinator
        .create_session(CreateSessionRequest {
            environment: "shell".to_string(),
            tool_pair: "jj-git".to_string(),
            owner_key: "ip:198.51.100.42".to_string(),
            tier: Tier::Anonymous,
            timeout_override_ms: None,
        })
        .await
        .expect("session creation should succeed against a live daemon");

    let result = coordinator
        .destroy_session(session.id, "ip:203.0.113.9", false)
        .await;
    assert!(matches!(
        result,
        Err(sandbox_server::CoordinatorError::NotAuthorized(_))
    ));

    // Clean up with the real owner so the container isn't leaked.
    coordinator
        .destroy_session(session.id, &session.owner_key, false)
        .await
        .expect("owner destroy should still succeed");
}

#[tokio::test]
#[serial]
async fn test_circuit_open_rejects_before_any_provisioning() {
    if !should_run_container_tests() {
        eprintln!("skipping: no container daemon available");
        return;
    }

    // Zero headroom: the circuit trips on the very first admission check,
    // so no container is ever created.
    let coordinator = build_coordinator_with_cap(0).await;
    let result = coordinator
        .create_session(CreateSessionRequest {
            environment: "shell".to_string(),
            tool_pair: "jj-git".to_string(),
            owner_key: "ip:198.51.100.42".to_string(),
            tier: Tier::Anonymous,
            timeout_override_ms: None,
        })
        .await;
    assert!(matches!(
        result,
        Err(sandbox_server::CoordinatorError::CircuitOpen(_))
    ));
    assert_eq!(coordinator.sessions().stats().total, 0);
}
