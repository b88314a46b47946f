use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{
    EndpointSettings, HostConfig, Mount as DockerMount, MountTypeEnum, PortBinding, PortTypeEnum,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions};
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::types::{
    ContainerFilter, ContainerSpec, ContainerState, ContainerSummary, ExecOutput, ImageInfo,
    MountKind, NetworkInfo, Protocol, Publish, PublishedPort, PullProgress, ResourceId, VolumeInfo,
};
use crate::{
    ContainerOps, Error, ImageOps, NetworkOps, ProgressSink, ResourceKind, Result, VolumeOps,
};

const STOP_TIMEOUT_SECS: i64 = 10;

/// Docker engine reached over the local socket.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect with the platform defaults (`DOCKER_HOST` or the local socket)
    /// and make sure the daemon answers.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::EngineUnavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| Error::EngineUnavailable(e.to_string()))?;
        info!("docker: connected");
        Ok(Self { docker })
    }
}

/// Translate a bollard error for `operation` on the resource `name`.
fn map_err(operation: &'static str, kind: ResourceKind, name: &str) -> impl FnOnce(BollardError) -> Error {
    move |e| match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => Error::NotFound {
            kind,
            name: name.to_string(),
        },
        BollardError::DockerResponseServerError {
            status_code: 409, ..
        } => Error::CreateConflict {
            kind,
            name: name.to_string(),
        },
        BollardError::IOError { err } => Error::EngineUnavailable(err.to_string()),
        BollardError::RequestTimeoutError => Error::EngineUnavailable("request timed out".into()),
        other => Error::Engine {
            operation,
            message: other.to_string(),
        },
    }
}

fn parse_protocol(typ: Option<PortTypeEnum>) -> Protocol {
    match typ {
        Some(PortTypeEnum::UDP) => Protocol::Udp,
        _ => Protocol::Tcp,
    }
}

#[async_trait]
impl NetworkOps for DockerEngine {
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(map_err("list_networks", ResourceKind::Network, "*"))?;

        Ok(networks
            .into_iter()
            .filter_map(|n| {
                Some(NetworkInfo {
                    id: ResourceId(n.id?),
                    name: n.name?,
                    driver: n.driver.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn create_network(&self, name: &str, driver: &str) -> Result<()> {
        self.docker
            .create_network(CreateNetworkOptions {
                name,
                driver,
                check_duplicate: true,
                ..Default::default()
            })
            .await
            .map_err(map_err("create_network", ResourceKind::Network, name))?;
        Ok(())
    }

    async fn remove_network(&self, id: &ResourceId) -> Result<()> {
        self.docker
            .remove_network(&id.0)
            .await
            .map_err(map_err("remove_network", ResourceKind::Network, &id.0))
    }
}

#[async_trait]
impl VolumeOps for DockerEngine {
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await
            .map_err(map_err("list_volumes", ResourceKind::Volume, "*"))?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeInfo {
                name: v.name,
                driver: v.driver,
            })
            .collect())
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo> {
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions {
                name,
                ..Default::default()
            })
            .await
            .map_err(map_err("create_volume", ResourceKind::Volume, name))?;
        Ok(VolumeInfo {
            name: volume.name,
            driver: volume.driver,
        })
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, None)
            .await
            .map_err(map_err("remove_volume", ResourceKind::Volume, name))
    }
}

#[async_trait]
impl ImageOps for DockerEngine {
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await
            .map_err(map_err("list_images", ResourceKind::Image, "*"))?;

        Ok(images
            .into_iter()
            .map(|i| ImageInfo {
                id: ResourceId(i.id),
                repo_tags: i.repo_tags,
            })
            .collect())
    }

    async fn pull_image(&self, reference: &str, progress: &dyn ProgressSink) -> Result<()> {
        let options = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(event) = stream.next().await {
            let info = event.map_err(|e| match e {
                BollardError::IOError { err } => Error::EngineUnavailable(err.to_string()),
                other => Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason: other.to_string(),
                },
            })?;
            if let Some(reason) = info.error {
                return Err(Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason,
                });
            }
            progress.pull_progress(
                reference,
                &PullProgress {
                    id: info.id,
                    status: info.status.unwrap_or_default(),
                    progress: info.progress,
                },
            );
        }

        info!(image = reference, "docker: image pulled");
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<bool> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(reference, Some(options), None).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_err("remove_image", ResourceKind::Image, reference)(e)),
        }
    }
}

#[async_trait]
impl ContainerOps for DockerEngine {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(name) = &filter.name {
            filters.insert("name".into(), vec![name.clone()]);
        }
        if !filter.labels.is_empty() {
            filters.insert(
                "label".into(),
                filter.labels.iter().map(ToString::to_string).collect(),
            );
        }

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: filter.all,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_err("list_containers", ResourceKind::Container, "*"))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(ContainerSummary {
                    id: ResourceId(c.id?),
                    name,
                    image: c.image.unwrap_or_default(),
                    state: ContainerState::parse(c.state.as_deref().unwrap_or("")),
                    labels: c.labels.unwrap_or_default().into_iter().collect(),
                    ports: c
                        .ports
                        .unwrap_or_default()
                        .into_iter()
                        .map(|p| PublishedPort {
                            private_port: p.private_port,
                            public_port: p.public_port,
                            protocol: parse_protocol(p.typ),
                        })
                        .collect(),
                })
            })
            // The engine's name filter is a substring match.
            .filter(|c| filter.name.as_deref().is_none_or(|n| n == c.name))
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec, publish: Publish) -> Result<ResourceId> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports()
            .iter()
            .map(|p| (p.key(), HashMap::new()))
            .collect();
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports()
            .iter()
            .map(|p| {
                let binding = PortBinding {
                    host_ip: None,
                    host_port: Some(publish.host_port(p)),
                };
                (p.key(), Some(vec![binding]))
            })
            .collect();
        let mounts: Vec<DockerMount> = spec
            .mounts()
            .iter()
            .map(|m| DockerMount {
                source: Some(m.source.clone()),
                target: Some(m.target.clone()),
                typ: Some(match m.kind {
                    MountKind::Bind => MountTypeEnum::BIND,
                    MountKind::Volume => MountTypeEnum::VOLUME,
                }),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            network_mode: spec.network().map(str::to_string),
            ..Default::default()
        };
        let networking_config = spec.network().map(|network| bollard::container::NetworkingConfig {
            endpoints_config: HashMap::from([(network.to_string(), EndpointSettings::default())]),
        });

        let config = Config {
            image: Some(spec.image().to_string()),
            hostname: spec.hostname().map(str::to_string),
            user: spec.user().map(str::to_string),
            tty: Some(true),
            env: Some(spec.env_strings()),
            cmd: spec.command().map(<[String]>::to_vec),
            labels: Some(
                spec.labels()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name().to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(map_err("create_container", ResourceKind::Container, spec.name()))?;

        debug!(container = spec.name(), id = %response.id, "docker: container created");
        Ok(ResourceId(response.id))
    }

    async fn start_container(&self, id: &ResourceId) -> Result<()> {
        self.docker
            .start_container::<String>(&id.0, None)
            .await
            .map_err(map_err("start_container", ResourceKind::Container, &id.0))
    }

    async fn stop_container(&self, id: &ResourceId) -> Result<()> {
        self.docker
            .stop_container(&id.0, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
            .map_err(map_err("stop_container", ResourceKind::Container, &id.0))
    }

    async fn remove_container(&self, id: &ResourceId) -> Result<()> {
        self.docker
            .remove_container(
                &id.0,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_err("remove_container", ResourceKind::Container, &id.0))
    }

    async fn wait_container(&self, id: &ResourceId) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&id.0, Some(options));
        let mut exit_code = 0;

        while let Some(event) = stream.next().await {
            match event {
                Ok(response) => exit_code = response.status_code,
                // Non-zero exits arrive as errors.
                Err(BollardError::DockerContainerWaitError { code, .. }) => exit_code = code,
                Err(e) => return Err(map_err("wait_container", ResourceKind::Container, &id.0)(e)),
            }
        }
        Ok(exit_code)
    }

    async fn container_logs(&self, id: &ResourceId) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(&id.0, Some(options));
        let mut log = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err("container_logs", ResourceKind::Container, &id.0))?;
            log.push_str(&chunk.to_string());
        }
        Ok(log)
    }

    async fn exec(&self, id: &ResourceId, command: &[String], user: Option<&str>) -> Result<ExecOutput> {
        let created = self
            .docker
            .create_exec(
                &id.0,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    user: user.map(str::to_string),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_err("create_exec", ResourceKind::Container, &id.0))?;

        let mut output = ExecOutput::default();
        let started = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(map_err("start_exec", ResourceKind::Container, &id.0))?;

        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(map_err("start_exec", ResourceKind::Container, &id.0))?;
                match chunk {
                    bollard::container::LogOutput::StdErr { message } => {
                        output.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    other => output.stdout.push_str(&other.to_string()),
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(map_err("inspect_exec", ResourceKind::Container, &id.0))?;
        output.exit_code = inspected.exit_code.unwrap_or_default();

        Ok(output)
    }
}
