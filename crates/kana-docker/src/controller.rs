use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::images::ImageCheckLog;
use crate::types::{
    ContainerFilter, ContainerSpec, ContainerSummary, Ensured, ExecOutput, LabelFilter,
    NetworkInfo, Publish, ResourceId, RunOutput, SITE_LABEL, VolumeInfo,
};
use crate::{ContainerEngine, Error, LogProgress, ProgressSink, ResourceKind, Result};

const NETWORK_DRIVER: &str = "bridge";

struct ImageState {
    log: ImageCheckLog,
    /// References already handled by this process.
    checked: HashSet<String>,
}

/// Idempotent reconciliation of engine resources.
///
/// Holds no handles between calls: every operation re-resolves networks,
/// volumes, images and containers by name or label.
pub struct Controller {
    engine: Arc<dyn ContainerEngine>,
    images: Mutex<ImageState>,
    progress: Arc<dyn ProgressSink>,
}

impl Controller {
    pub fn new(engine: Arc<dyn ContainerEngine>, log: ImageCheckLog) -> Self {
        Self {
            engine,
            images: Mutex::new(ImageState {
                log,
                checked: HashSet::new(),
            }),
            progress: Arc::new(LogProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    // ── Networks ────────────────────────────────────────────────────

    pub async fn find_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        let networks = self.engine.list_networks().await?;
        Ok(networks.into_iter().find(|n| n.name == name))
    }

    /// Create the bridge network `name` unless it already exists.
    pub async fn ensure_network(&self, name: &str) -> Result<Ensured<NetworkInfo>> {
        if let Some(network) = self.find_network(name).await? {
            return Ok(Ensured {
                created: false,
                resource: network,
            });
        }

        self.engine.create_network(name, NETWORK_DRIVER).await?;
        let network = self.find_network(name).await?.ok_or_else(|| Error::NotFound {
            kind: ResourceKind::Network,
            name: name.to_string(),
        })?;
        info!(network = name, id = %network.id, "docker: network created");

        Ok(Ensured {
            created: true,
            resource: network,
        })
    }

    /// Returns `false` when no such network exists.
    pub async fn remove_network(&self, name: &str) -> Result<bool> {
        let Some(network) = self.find_network(name).await? else {
            return Ok(false);
        };
        match self.engine.remove_network(&network.id).await {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(network = name, "docker: network removed");
        Ok(true)
    }

    // ── Volumes ─────────────────────────────────────────────────────

    async fn find_volume(&self, name: &str) -> Result<Option<VolumeInfo>> {
        let volumes = self.engine.list_volumes().await?;
        Ok(volumes.into_iter().find(|v| v.name == name))
    }

    pub async fn ensure_volume(&self, name: &str) -> Result<Ensured<VolumeInfo>> {
        if let Some(volume) = self.find_volume(name).await? {
            return Ok(Ensured {
                created: false,
                resource: volume,
            });
        }

        let volume = self.engine.create_volume(name).await?;
        info!(volume = name, "docker: volume created");
        Ok(Ensured {
            created: true,
            resource: volume,
        })
    }

    pub async fn remove_volume(&self, name: &str) -> Result<bool> {
        if self.find_volume(name).await?.is_none() {
            return Ok(false);
        }
        self.engine.remove_volume(name).await?;
        info!(volume = name, "docker: volume removed");
        Ok(true)
    }

    // ── Images ──────────────────────────────────────────────────────

    async fn image_present(&self, reference: &str) -> Result<bool> {
        let images = self.engine.list_images().await?;
        Ok(images
            .iter()
            .any(|i| i.repo_tags.iter().any(|t| t == reference)))
    }

    /// Make sure `reference` is available locally.
    ///
    /// Pulls when the image is missing, or when it is present but was last
    /// checked more than `max_staleness_days` ago (`0` disables update checks).
    /// Returns whether a pull happened.
    pub async fn ensure_image(&self, reference: &str, max_staleness_days: u32) -> Result<bool> {
        let reference = normalize_reference(reference);
        let mut images = self.images.lock().await;
        if images.checked.contains(&reference) {
            return Ok(false);
        }

        let now = Utc::now();
        if self.image_present(&reference).await?
            && !images.log.is_stale(&reference, max_staleness_days, now)
        {
            debug!(image = %reference, "docker: image up to date");
            images.checked.insert(reference);
            return Ok(false);
        }

        info!(image = %reference, "docker: pulling image");
        self.progress.pull_started(&reference);
        self.engine
            .pull_image(&reference, self.progress.as_ref())
            .await
            .map_err(|e| match e {
                Error::EngineUnavailable(_) | Error::ImagePullFailed { .. } => e,
                other => Error::ImagePullFailed {
                    reference: reference.clone(),
                    reason: other.to_string(),
                },
            })?;

        images.log.record(&reference, now)?;
        images.checked.insert(reference);
        Ok(true)
    }

    /// Returns `false` when the image was not present.
    pub async fn remove_image(&self, reference: &str) -> Result<bool> {
        let reference = normalize_reference(reference);
        let removed = self.engine.remove_image(&reference).await?;
        if removed {
            self.images.lock().await.checked.remove(&reference);
            info!(image = %reference, "docker: image removed");
        }
        Ok(removed)
    }

    // ── Containers ──────────────────────────────────────────────────

    /// Look up a container by exact name, running or not.
    pub async fn find_container(&self, name: &str) -> Result<Option<ContainerSummary>> {
        let containers = self
            .engine
            .list_containers(&ContainerFilter::all().named(name))
            .await?;
        Ok(containers.into_iter().find(|c| c.name == name))
    }

    /// Containers carrying `kana.site=<site>`. An empty `site` matches every
    /// site-labeled container.
    pub async fn list_by_site(&self, site: &str) -> Result<Vec<ContainerSummary>> {
        let label = if site.is_empty() {
            LabelFilter::Present(SITE_LABEL.to_string())
        } else {
            LabelFilter::Equals(SITE_LABEL.to_string(), site.to_string())
        };
        self.engine
            .list_containers(&ContainerFilter::all().label(label))
            .await
    }

    /// Start a long-running container from `spec`.
    ///
    /// An already-running container with the same name is reused as is; a
    /// stopped one is replaced.
    pub async fn run_container(&self, spec: &ContainerSpec, publish: Publish) -> Result<ResourceId> {
        match self.find_container(spec.name()).await? {
            Some(existing) if existing.state.is_running() => {
                debug!(container = spec.name(), "docker: container already running");
                return Ok(existing.id);
            }
            Some(stale) => {
                debug!(container = spec.name(), "docker: removing stopped container");
                self.engine.remove_container(&stale.id).await?;
            }
            None => {}
        }

        let id = self.engine.create_container(spec, publish).await?;
        self.engine.start_container(&id).await?;
        info!(container = spec.name(), image = spec.image(), id = %id, "docker: container started");
        Ok(id)
    }

    /// Run `spec` to completion and return its exit code and combined output.
    ///
    /// The container is always removed afterwards; a failed removal is only
    /// logged.
    pub async fn run_and_remove(&self, spec: &ContainerSpec) -> Result<RunOutput> {
        if let Some(leftover) = self.find_container(spec.name()).await? {
            self.engine.remove_container(&leftover.id).await?;
        }

        let id = self.engine.create_container(spec, Publish::Declared).await?;
        let outcome = self.run_to_completion(&id).await;

        if let Err(e) = self.engine.remove_container(&id).await {
            warn!(container = spec.name(), error = %e, "docker: failed to remove finished container");
        }

        let output = outcome?;
        debug!(container = spec.name(), exit_code = output.exit_code, "docker: container finished");
        Ok(output)
    }

    async fn run_to_completion(&self, id: &ResourceId) -> Result<RunOutput> {
        self.engine.start_container(id).await?;
        let exit_code = self.engine.wait_container(id).await?;
        let log = self.engine.container_logs(id).await?;
        Ok(RunOutput { exit_code, log })
    }

    /// Stop and remove the container `name`. Returns `false` when it did not
    /// exist.
    pub async fn stop_container(&self, name: &str) -> Result<bool> {
        let Some(container) = self.find_container(name).await? else {
            return Ok(false);
        };

        if container.state.is_running() {
            self.engine.stop_container(&container.id).await?;
        }
        match self.engine.remove_container(&container.id).await {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        info!(container = name, "docker: container stopped");
        Ok(true)
    }

    /// Stop then start `name`. Returns `false` when it did not exist.
    pub async fn restart_container(&self, name: &str) -> Result<bool> {
        let Some(container) = self.find_container(name).await? else {
            return Ok(false);
        };

        if container.state.is_running() {
            self.engine.stop_container(&container.id).await?;
        }
        self.engine.start_container(&container.id).await?;
        info!(container = name, "docker: container restarted");
        Ok(true)
    }

    /// Run `command` inside the running container `name`.
    pub async fn exec(&self, name: &str, command: &[String], as_root: bool) -> Result<ExecOutput> {
        let container = self
            .find_container(name)
            .await?
            .filter(|c| c.state.is_running())
            .ok_or_else(|| Error::NotFound {
                kind: ResourceKind::Container,
                name: name.to_string(),
            })?;

        let user = as_root.then_some("root");
        let output = self.engine.exec(&container.id, command, user).await?;
        debug!(container = name, exit_code = output.exit_code, "docker: exec finished");
        Ok(output)
    }
}

/// Append `:latest` to references that carry neither a tag nor a digest.
pub fn normalize_reference(reference: &str) -> String {
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    if reference.contains('@') || last_segment.contains(':') {
        reference.to_string()
    } else {
        format!("{reference}:latest")
    }
}
