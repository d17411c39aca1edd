//! Container lifecycle orchestration — the Container Provisioner.
//!
//! Provides high-level container management: image presence checks,
//! hardened container creation, bounded-time destruction, and periodic
//! cleanup of containers orphaned by a crash or ungraceful restart.

use crate::container::{ContainerClient, ContainerConfig, ContainerError, Result};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Label applied to every container this service creates, used to find
/// orphans on startup and to scope `cleanupOrphaned` sweeps.
pub const MANAGED_LABEL: &str = "sandbox.managed";

/// Per-step timeout applied to the stop/kill and remove calls during destroy.
const DESTROY_STEP_TIMEOUT: Duration = Duration::from_secs(10);
/// Overall deadline for a full destroy (stop + remove), matched against the
/// external contract's 10-second destroy budget.
const DESTROY_DEADLINE: Duration = Duration::from_secs(10);

/// Container orchestrator configuration.
#[derive(Debug, Clone)]
pub struct ContainerOrchestratorConfig {
    /// Automatically pull images if not present
    pub auto_pull: bool,
    /// Container name prefix
    pub name_prefix: String,
    /// Default stop timeout in seconds
    pub stop_timeout: i64,
}

impl Default for ContainerOrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_pull: false,
            name_prefix: "sandbox".to_string(),
            stop_timeout: 5,
        }
    }
}

/// High-level container orchestrator.
///
/// Manages container lifecycle including image pulling, hardened container
/// creation, destruction, and orphan cleanup.
pub struct ContainerOrchestrator {
    client: ContainerClient,
    config: ContainerOrchestratorConfig,
}

impl ContainerOrchestrator {
    /// Create a new orchestrator with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if connection to container runtime fails.
    pub async fn new() -> Result<Self> {
        Self::with_config(ContainerOrchestratorConfig::default()).await
    }

    /// Create a new orchestrator with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns error if connection to container runtime fails.
    pub async fn with_config(config: ContainerOrchestratorConfig) -> Result<Self> {
        let client = ContainerClient::new().await?;
        Ok(Self { client, config })
    }

    /// Create an orchestrator with an existing client.
    pub fn with_client(client: ContainerClient, config: ContainerOrchestratorConfig) -> Self {
        Self { client, config }
    }

    /// Confirm a container image is present locally.
    ///
    /// The provisioner never builds or pulls images implicitly by default
    /// (`auto_pull` is off): sandbox images are expected to be pre-seeded on
    /// the host, and a missing image should surface as an actionable error
    /// rather than trigger a slow, unplanned registry pull mid-request.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::ImageMissing`] if the image is absent and
    /// `auto_pull` is disabled, or if a requested pull fails.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.client.image_exists(image).await? {
            debug!("image {} already present locally", image);
            return Ok(());
        }

        if !self.config.auto_pull {
            return Err(ContainerError::ImageMissing(image.to_string()));
        }

        info!("pulling image: {}", image);
        self.pull_image(image).await
    }

    /// Pull a container image from registry.
    ///
    /// # Errors
    ///
    /// Returns error if image pull fails.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        let mut stream = self.client.docker().create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(ContainerError::ImageMissing(format!(
                        "{image}: pull failed: {e}"
                    )));
                }
            }
        }

        info!("successfully pulled image: {}", image);
        Ok(())
    }

    /// Create and start a hardened container from configuration.
    ///
    /// # Returns
    ///
    /// The new container's ID.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::ImageMissing`] if the image is unavailable,
    /// or [`ContainerError::ProvisionFailed`] if creation or start fails
    /// after the image check passed.
    pub async fn create_container(
        &self,
        config: &ContainerConfig,
        name: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<String> {
        self.ensure_image(&config.image).await?;

        let container_name = name
            .map(String::from)
            .unwrap_or_else(|| format!("{}-{}", self.config.name_prefix, uuid::Uuid::new_v4()));

        let options = bollard::container::CreateContainerOptions {
            name: container_name.as_str(),
            ..Default::default()
        };

        debug!("creating container: {}", container_name);

        use bollard::container::Config as BollardConfig;

        let mut all_labels = config.labels.clone().unwrap_or_default();
        all_labels.extend(labels);
        all_labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let bollard_config = BollardConfig {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            entrypoint: config.entrypoint.clone(),
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            labels: Some(all_labels),
            user: config.user.clone(),
            host_config: Some(config.host_config.clone()),
            ..Default::default()
        };

        let response = self
            .client
            .docker()
            .create_container(Some(options), bollard_config)
            .await
            .map_err(|e| ContainerError::ProvisionFailed(e.to_string()))?;

        self.start_container(&response.id).await.map_err(|e| {
            ContainerError::ProvisionFailed(format!("created but failed to start: {e}"))
        })?;

        info!("provisioned container: {} ({})", container_name, response.id);

        Ok(response.id)
    }

    /// Start a container.
    ///
    /// # Errors
    ///
    /// Returns error if container start fails.
    pub async fn start_container(&self, container_id: &str) -> Result<()> {
        debug!("starting container: {}", container_id);

        self.client
            .docker()
            .start_container(
                container_id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await?;

        Ok(())
    }

    /// Destroy a container: stop (or kill, on timeout) then remove, within a
    /// fixed overall deadline.
    ///
    /// A container that no longer exists is treated as a successful destroy
    /// rather than an error — destroy is idempotent from the caller's
    /// perspective.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::DestroyFailed`] if the container still
    /// exists after the deadline.
    pub async fn destroy(&self, container_id: &str) -> Result<()> {
        let result = timeout(DESTROY_DEADLINE, self.stop_and_remove(container_id)).await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ContainerError::NotFound(_))) => {
                debug!("container {} already gone", container_id);
                Ok(())
            }
            Ok(Err(e)) => Err(ContainerError::DestroyFailed {
                container_id: container_id.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ContainerError::DestroyFailed {
                container_id: container_id.to_string(),
                reason: format!("did not complete within {:?}", DESTROY_DEADLINE),
            }),
        }
    }

    /// Stop a container, tolerating "already stopped".
    ///
    /// # Errors
    ///
    /// Returns error if the stop call fails for a reason other than the
    /// container already being stopped.
    pub async fn stop_container(&self, container_id: &str) -> Result<()> {
        debug!("stopping container: {}", container_id);

        let stop = timeout(
            DESTROY_STEP_TIMEOUT,
            self.client.docker().stop_container(
                container_id,
                Some(bollard::container::StopContainerOptions {
                    t: self.config.stop_timeout,
                }),
            ),
        )
        .await;

        match stop {
            Ok(Ok(())) => Ok(()),
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => Err(ContainerError::NotFound(container_id.to_string())),
            Ok(Err(e)) => Err(ContainerError::ApiError(e)),
            Err(_) => Err(ContainerError::Other(format!(
                "stop of {container_id} timed out after {DESTROY_STEP_TIMEOUT:?}"
            ))),
        }
    }

    /// Remove a container (and its anonymous volumes).
    ///
    /// # Errors
    ///
    /// Returns error if container removal fails.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        debug!("removing container: {}", container_id);

        let remove = timeout(
            DESTROY_STEP_TIMEOUT,
            self.client.docker().remove_container(
                container_id,
                Some(bollard::container::RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            ),
        )
        .await;

        match remove {
            Ok(Ok(())) => Ok(()),
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => Err(ContainerError::NotFound(container_id.to_string())),
            Ok(Err(e)) => Err(ContainerError::ApiError(e)),
            Err(_) => Err(ContainerError::Other(format!(
                "remove of {container_id} timed out after {DESTROY_STEP_TIMEOUT:?}"
            ))),
        }
    }

    /// Stop and remove a container.
    ///
    /// # Errors
    ///
    /// Returns error if stop or removal fails for a reason other than the
    /// container already being gone.
    pub async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        match self.stop_container(container_id).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => warn!("failed to stop container {}: {}", container_id, e),
        }

        self.remove_container(container_id, true).await
    }

    /// Sweep every container carrying [`MANAGED_LABEL`] that is exited or
    /// dead and force-remove it.
    ///
    /// Run at startup (to clean up after a crash) and periodically by the
    /// session reaper. Per-container failures are logged and skipped rather
    /// than aborting the whole sweep — one stuck container should never
    /// block cleanup of the rest.
    ///
    /// # Returns
    ///
    /// The IDs of containers that were removed.
    ///
    /// # Errors
    ///
    /// Returns error only if listing containers itself fails.
    pub async fn cleanup_orphaned(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![MANAGED_LABEL.to_string()]);
        filters.insert(
            "status".to_string(),
            vec!["exited".to_string(), "dead".to_string()],
        );

        let containers = self
            .client
            .docker()
            .list_containers(Some(bollard::container::ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut removed = Vec::new();
        for container in containers {
            let Some(id) = container.id else { continue };
            match self.remove_container(&id, true).await {
                Ok(()) => {
                    info!("removed orphaned container: {}", id);
                    removed.push(id);
                }
                Err(ContainerError::NotFound(_)) => {}
                Err(e) => warn!("failed to remove orphaned container {}: {}", id, e),
            }
        }

        Ok(removed)
    }

    /// Get container logs.
    ///
    /// # Errors
    ///
    /// Returns error if log retrieval fails.
    pub async fn logs(&self, container_id: &str, tail: Option<&str>) -> Result<String> {
        let mut stream = self.client.docker().logs(
            container_id,
            Some(bollard::container::LogsOptions {
                stdout: true,
                stderr: true,
                tail: tail.unwrap_or("all").to_string(),
                ..Default::default()
            }),
        );
        let mut output = String::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(log) => output.push_str(&log.to_string()),
                Err(e) => return Err(ContainerError::ApiError(e)),
            }
        }

        Ok(output)
    }

    /// List managed containers with optional filters.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![MANAGED_LABEL.to_string()]);
        if !all {
            filters.insert("status".to_string(), vec!["running".to_string()]);
        }

        let containers = self
            .client
            .docker()
            .list_containers(Some(bollard::container::ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                status: c.status.unwrap_or_default(),
            })
            .collect())
    }

    /// Get the underlying client.
    pub fn client(&self) -> &ContainerClient {
        &self.client
    }
}

/// Container summary information.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Container ID
    pub id: String,
    /// Container names
    pub names: Vec<String>,
    /// Image name
    pub image: String,
    /// Container state
    pub state: String,
    /// Container status
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerConfig;

    #[tokio::test]
    #[ignore] // Requires Docker/Podman
    async fn test_orchestrator_creation() {
        let orchestrator = ContainerOrchestrator::new().await.unwrap();
        assert!(orchestrator.client.ping().await.is_ok());
    }

    #[tokio::test]
    #[ignore]
    async fn test_container_lifecycle() {
        let orchestrator = ContainerOrchestrator::new().await.unwrap();

        let config = ContainerConfig::builder()
            .image("alpine:latest")
            .cmd(vec!["sleep", "infinity"])
            .hardened(1000, 1000)
            .build()
            .unwrap();

        let container_id = orchestrator
            .create_container(&config, None, HashMap::new())
            .await
            .unwrap();

        orchestrator.destroy(&container_id).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_destroy_missing_container_is_ok() {
        let orchestrator = ContainerOrchestrator::new().await.unwrap();
        orchestrator.destroy("does-not-exist").await.unwrap();
    }
}
