//! Container engine access for Kana.
//!
//! The engine is reached only through the narrow capability traits below
//! ([`NetworkOps`], [`VolumeOps`], [`ImageOps`], [`ContainerOps`]). The
//! [`Controller`] layers idempotent "ensure" semantics on top of them and is
//! the only thing the site orchestrator talks to.

pub mod controller;
pub mod docker;
pub mod images;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod types;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;

pub use controller::Controller;
pub use types::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("{kind} {name} was created concurrently by another process")]
    CreateConflict { kind: ResourceKind, name: String },

    #[error("pulling image {reference} failed: {reason}")]
    ImagePullFailed { reference: String, reason: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("container engine {operation} failed: {message}")]
    Engine {
        operation: &'static str,
        message: String,
    },

    #[error("image check log {path}: {source}")]
    ImageLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image check log is not valid JSON: {0}")]
    ImageLogFormat(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Kinds of engine resources, used for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Network,
    Volume,
    Image,
    Container,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Volume => "volume",
            Self::Image => "image",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network operations of a container engine.
#[async_trait]
pub trait NetworkOps: Send + Sync {
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>>;

    /// Create a network. Must fail with [`Error::CreateConflict`] when a
    /// network with the same name already exists.
    async fn create_network(&self, name: &str, driver: &str) -> Result<()>;

    async fn remove_network(&self, id: &ResourceId) -> Result<()>;
}

/// Named volume operations of a container engine.
#[async_trait]
pub trait VolumeOps: Send + Sync {
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo>;

    async fn remove_volume(&self, name: &str) -> Result<()>;
}

/// Image operations of a container engine.
#[async_trait]
pub trait ImageOps: Send + Sync {
    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Pull `reference`, forwarding every progress event to `progress`.
    async fn pull_image(&self, reference: &str, progress: &dyn ProgressSink) -> Result<()>;

    /// Returns `false` when the image was not present.
    async fn remove_image(&self, reference: &str) -> Result<bool>;
}

/// Container operations of a container engine.
#[async_trait]
pub trait ContainerOps: Send + Sync {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>>;

    /// Create (but do not start) a container from `spec`.
    async fn create_container(&self, spec: &ContainerSpec, publish: Publish) -> Result<ResourceId>;

    async fn start_container(&self, id: &ResourceId) -> Result<()>;

    async fn stop_container(&self, id: &ResourceId) -> Result<()>;

    /// Force-remove a container, running or not.
    async fn remove_container(&self, id: &ResourceId) -> Result<()>;

    /// Block until the container exits and return its exit code.
    async fn wait_container(&self, id: &ResourceId) -> Result<i64>;

    /// Combined stdout and stderr of the container so far.
    async fn container_logs(&self, id: &ResourceId) -> Result<String>;

    /// Run `command` inside a running container.
    async fn exec(&self, id: &ResourceId, command: &[String], user: Option<&str>)
    -> Result<ExecOutput>;
}

/// Everything the [`Controller`] needs from an engine.
pub trait ContainerEngine: NetworkOps + VolumeOps + ImageOps + ContainerOps + 'static {}

impl<T> ContainerEngine for T where T: NetworkOps + VolumeOps + ImageOps + ContainerOps + 'static {}

/// Receives image pull progress.
pub trait ProgressSink: Send + Sync {
    fn pull_started(&self, _reference: &str) {}

    fn pull_progress(&self, reference: &str, event: &PullProgress);
}

/// Progress sink that only emits debug logs.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn pull_progress(&self, reference: &str, event: &PullProgress) {
        tracing::debug!(
            image = reference,
            layer = event.id.as_deref().unwrap_or("-"),
            status = %event.status,
            progress = event.progress.as_deref().unwrap_or(""),
            "docker: pull progress"
        );
    }
}
