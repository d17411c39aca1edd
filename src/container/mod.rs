//! Container orchestration and isolation layer.
//!
//! Provides hardened, ephemeral container execution for sandbox sessions
//! using Docker/Podman via the bollard API: connection handling, the
//! security-hardened configuration profile, and lifecycle orchestration
//! (create/destroy/inspect/cleanup orphans).
//!
//! ## Architecture
//!
//! - [`client`]: Docker/Podman API client wrapper with connection management.
//! - [`config`]: hardened container configuration builder.
//! - [`orchestrator`]: container lifecycle orchestration (the Container Provisioner).

mod client;
mod config;
mod orchestrator;

pub use client::{ContainerClient, ContainerClientConfig, ContainerState, RuntimeType};
pub use config::{ContainerConfig, ContainerConfigBuilder, HardeningProfile};
pub use orchestrator::{ContainerOrchestrator, ContainerOrchestratorConfig, ContainerSummary};

/// Container provisioning errors.
///
/// These map onto the provisioning error taxonomy every caller needs to
/// distinguish: a missing image is a client-facing 4xx, an API hiccup while
/// destroying a container is retryable, a runtime that never answers a ping
/// is a boot-time fatal error.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Docker/Podman API error
    #[error("container API error: {0}")]
    ApiError(#[from] bollard::errors::Error),

    /// Container not found
    #[error("container not found: {0}")]
    NotFound(String),

    /// Container configuration error
    #[error("container configuration error: {0}")]
    ConfigError(String),

    /// Referenced image is not present and cannot be resolved
    #[error("image not available: {0}")]
    ImageMissing(String),

    /// Container creation failed after the image was confirmed present
    #[error("failed to provision container: {0}")]
    ProvisionFailed(String),

    /// Container destruction did not complete within its deadline
    #[error("failed to destroy container {container_id}: {reason}")]
    DestroyFailed {
        /// Container that failed to be destroyed
        container_id: String,
        /// Underlying reason
        reason: String,
    },

    /// Container execution error
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// The container runtime (Docker/Podman daemon) is unreachable
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// General error
    #[error("container error: {0}")]
    Other(String),
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;
