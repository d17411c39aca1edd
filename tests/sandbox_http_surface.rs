//! Exercises the REST admin surface (`server::router`) end to end against a
//! real Docker (or Podman) daemon: session creation, lookup, double-destroy
//! rejection, and the health endpoint.
//!
//! Requires a running container daemon and network access to pull
//! `alpine:latest` on first run. Set `SKIP_CONTAINER_TESTS=1` to skip.

use std::net::SocketAddr;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use dashmap::DashMap;
use sandbox_server::circuit_breaker::CircuitBreaker;
use sandbox_server::container::{ContainerOrchestrator, ContainerOrchestratorConfig};
use sandbox_server::coordinator::SessionCoordinator;
use sandbox_server::environment::{Environment, EnvironmentRegistry};
use sandbox_server::rate_limit::RateLimiter;
use sandbox_server::server::{self, AnonymousByIp, AppState};
use sandbox_server::session::SessionStore;
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

async fn build_test_server() -> TestServer {
    let orchestrator = Arc::new(
        ContainerOrchestrator::with_config(ContainerOrchestratorConfig::default())
            .await
            .expect("container daemon must be reachable"),
    );
    let environments = Arc::new(EnvironmentRegistry::new(
        vec![Environment {
            name: "shell".to_string(),
            description: "test shell".to_string(),
            category: "shell".to_string(),
            container_image: "alpine:latest".to_string(),
            default_timeout: Duration::from_secs(60),
        }],
        "shell",
    ));
    let rate_limiter = Arc::new(RateLimiter::new(false));
    let circuit_breaker = CircuitBreaker::new(15, 85.0, true);
    let sessions = Arc::new(SessionStore::new());

    let coordinator = Arc::new(SessionCoordinator::new(
        circuit_breaker,
        rate_limiter,
        environments,
        orchestrator,
        sessions,
        None,
    ));

    let docker = Arc::new(coordinator.provisioner().client().docker().clone());
    let state = AppState {
        coordinator,
        docker,
        verifier: Arc::new(AnonymousByIp),
        allowed_origins: Arc::new(Vec::new()),
        bind_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        connections: Arc::new(DashMap::new()),
    };

    TestServer::new(server::router(state)).expect("test server should build")
}

#[tokio::test]
#[serial]
async fn test_create_get_destroy_session_over_http() {
    if !should_run_container_tests() {
        eprintln!("skipping: no container daemon available");
        return;
    }

    let server = build_test_server().await;

    let created = server
        .post("/api/v1/sessions")
        .json(&serde_json::json!({ "environment": "shell" }))
        .await;
    created.assert_status(axum::http::StatusCode::CREATED);
    let body: serde_json::Value = created.json();
    let id = body["id"].as_str().expect("response carries an id").to_string();
    assert_eq!(body["state"], "RUNNING");

    let fetched = server.get(&format!("/api/v1/sessions/{id}")).await;
    fetched.assert_status_ok();

    let destroyed = server.delete(&format!("/api/v1/sessions/{id}")).await;
    destroyed.assert_status(axum::http::StatusCode::NO_CONTENT);

    // Already torn down: a second destroy finds nothing to act on.
    let second_destroy = server.delete(&format!("/api/v1/sessions/{id}")).await;
    second_destroy.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
#[serial]
async fn test_create_session_unknown_environment_is_bad_request() {
    if !should_run_container_tests() {
        eprintln!("skipping: no container daemon available");
        return;
    }

    let server = build_test_server().await;
    let response = server
        .post("/api/v1/sessions")
        .json(&serde_json::json!({ "environment": "does-not-exist" }))
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[serial]
async fn test_healthz_reports_session_count() {
    if !should_run_container_tests() {
        eprintln!("skipping: no container daemon available");
        return;
    }

    let server = build_test_server().await;
    let response = server.get("/healthz").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
}
