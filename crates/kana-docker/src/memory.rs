//! In-memory container engine for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::types::{
    ContainerFilter, ContainerSpec, ContainerState, ContainerSummary, ExecOutput, ImageInfo,
    NetworkInfo, PublishedPort, Publish, PullProgress, ResourceId, RunOutput, VolumeInfo,
};
use crate::{
    ContainerOps, Error, ImageOps, NetworkOps, ProgressSink, ResourceKind, Result, VolumeOps,
};

type RunHandler = Arc<dyn Fn(&ContainerSpec) -> RunOutput + Send + Sync>;
type ExecHandler = Arc<dyn Fn(&str, &[String]) -> ExecOutput + Send + Sync>;

const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// One recorded `exec` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub container: String,
    pub command: Vec<String>,
    pub user: Option<String>,
}

struct MemContainer {
    id: ResourceId,
    spec: ContainerSpec,
    state: ContainerState,
    ports: Vec<PublishedPort>,
    log: String,
    exit_code: Option<i64>,
}

impl MemContainer {
    fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            name: self.spec.name().to_string(),
            image: self.spec.image().to_string(),
            state: self.state,
            labels: self.spec.labels().clone(),
            ports: self.ports.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    unreachable: bool,
    next_id: u64,
    next_port: u16,
    networks: Vec<NetworkInfo>,
    network_races: HashSet<String>,
    volumes: Vec<VolumeInfo>,
    images: Vec<ImageInfo>,
    pulls: HashMap<String, usize>,
    failing_pulls: HashSet<String>,
    containers: Vec<MemContainer>,
    failing_starts: HashSet<String>,
    created: Vec<ContainerSpec>,
    execs: Vec<ExecCall>,
    starts: HashMap<String, usize>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> ResourceId {
        self.next_id += 1;
        ResourceId(format!("{prefix}{:012x}", self.next_id))
    }

    fn container(&mut self, id: &ResourceId) -> Result<&mut MemContainer> {
        self.containers
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| Error::NotFound {
                kind: ResourceKind::Container,
                name: id.0.clone(),
            })
    }
}

/// A container engine that keeps everything in process memory.
///
/// Long-running containers simply sit in the `Running` state. One-shot
/// containers produce their output when waited on, from the handler set with
/// [`MemoryEngine::on_run`] (exit code 0 and an empty log by default).
pub struct MemoryEngine {
    state: Mutex<State>,
    run_handler: Mutex<Option<RunHandler>>,
    exec_handler: Mutex<Option<ExecHandler>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_port: FIRST_EPHEMERAL_PORT,
                ..State::default()
            }),
            run_handler: Mutex::new(None),
            exec_handler: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reachable(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.lock();
        if state.unreachable {
            return Err(Error::EngineUnavailable("memory engine switched off".into()));
        }
        Ok(state)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// The next `create_network(name)` behaves as if another process created
    /// the network first.
    pub fn inject_network_race(&self, name: &str) {
        self.lock().network_races.insert(name.to_string());
    }

    pub fn preload_image(&self, reference: &str) {
        let mut state = self.lock();
        let id = state.next_id("sha256:");
        state.images.push(ImageInfo {
            id,
            repo_tags: vec![reference.to_string()],
        });
    }

    pub fn fail_pulls(&self, reference: &str) {
        self.lock().failing_pulls.insert(reference.to_string());
    }

    pub fn pull_count(&self, reference: &str) -> usize {
        self.lock().pulls.get(reference).copied().unwrap_or(0)
    }

    /// Starting the container `name` fails with an engine error.
    pub fn fail_starts(&self, name: &str) {
        self.lock().failing_starts.insert(name.to_string());
    }

    pub fn on_run<F>(&self, handler: F)
    where
        F: Fn(&ContainerSpec) -> RunOutput + Send + Sync + 'static,
    {
        *self.run_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    pub fn on_exec<F>(&self, handler: F)
    where
        F: Fn(&str, &[String]) -> ExecOutput + Send + Sync + 'static,
    {
        *self.exec_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// Every spec ever passed to `create_container`, in order.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.lock().execs.clone()
    }

    /// How often a container named `name` was started.
    pub fn start_count(&self, name: &str) -> usize {
        self.lock().starts.get(name).copied().unwrap_or(0)
    }

    pub fn network_names(&self) -> Vec<String> {
        self.lock().networks.iter().map(|n| n.name.clone()).collect()
    }
}

#[async_trait]
impl NetworkOps for MemoryEngine {
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        Ok(self.reachable()?.networks.clone())
    }

    async fn create_network(&self, name: &str, driver: &str) -> Result<()> {
        let mut state = self.reachable()?;
        let raced = state.network_races.remove(name);
        if raced || state.networks.iter().any(|n| n.name == name) {
            if raced {
                let id = state.next_id("net");
                state.networks.push(NetworkInfo {
                    id,
                    name: name.to_string(),
                    driver: driver.to_string(),
                });
            }
            return Err(Error::CreateConflict {
                kind: ResourceKind::Network,
                name: name.to_string(),
            });
        }

        let id = state.next_id("net");
        state.networks.push(NetworkInfo {
            id,
            name: name.to_string(),
            driver: driver.to_string(),
        });
        Ok(())
    }

    async fn remove_network(&self, id: &ResourceId) -> Result<()> {
        let mut state = self.reachable()?;
        let before = state.networks.len();
        state.networks.retain(|n| &n.id != id);
        if state.networks.len() == before {
            return Err(Error::NotFound {
                kind: ResourceKind::Network,
                name: id.0.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeOps for MemoryEngine {
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        Ok(self.reachable()?.volumes.clone())
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo> {
        let mut state = self.reachable()?;
        if state.volumes.iter().any(|v| v.name == name) {
            return Err(Error::CreateConflict {
                kind: ResourceKind::Volume,
                name: name.to_string(),
            });
        }
        let volume = VolumeInfo {
            name: name.to_string(),
            driver: "local".to_string(),
        };
        state.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.reachable()?;
        let before = state.volumes.len();
        state.volumes.retain(|v| v.name != name);
        if state.volumes.len() == before {
            return Err(Error::NotFound {
                kind: ResourceKind::Volume,
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImageOps for MemoryEngine {
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(self.reachable()?.images.clone())
    }

    async fn pull_image(&self, reference: &str, progress: &dyn ProgressSink) -> Result<()> {
        {
            let mut state = self.reachable()?;
            *state.pulls.entry(reference.to_string()).or_default() += 1;
            if state.failing_pulls.contains(reference) {
                return Err(Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason: "manifest unknown".to_string(),
                });
            }
            if !state
                .images
                .iter()
                .any(|i| i.repo_tags.iter().any(|t| t == reference))
            {
                let id = state.next_id("sha256:");
                state.images.push(ImageInfo {
                    id,
                    repo_tags: vec![reference.to_string()],
                });
            }
        }

        progress.pull_progress(
            reference,
            &PullProgress {
                id: None,
                status: format!("Downloaded newer image for {reference}"),
                progress: None,
            },
        );
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<bool> {
        let mut state = self.reachable()?;
        let before = state.images.len();
        state
            .images
            .retain(|i| !i.repo_tags.iter().any(|t| t == reference));
        Ok(state.images.len() != before)
    }
}

#[async_trait]
impl ContainerOps for MemoryEngine {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let state = self.reachable()?;
        Ok(state
            .containers
            .iter()
            .filter(|c| filter.matches(c.spec.name(), c.state, c.spec.labels()))
            .map(MemContainer::summary)
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec, publish: Publish) -> Result<ResourceId> {
        let mut state = self.reachable()?;
        if state.containers.iter().any(|c| c.spec.name() == spec.name()) {
            return Err(Error::CreateConflict {
                kind: ResourceKind::Container,
                name: spec.name().to_string(),
            });
        }
        if let Some(network) = spec.network()
            && !state.networks.iter().any(|n| n.name == network)
        {
            return Err(Error::NotFound {
                kind: ResourceKind::Network,
                name: network.to_string(),
            });
        }

        let mut ports = Vec::with_capacity(spec.ports().len());
        for port in spec.ports() {
            let public_port = match publish {
                Publish::Declared => port.port,
                Publish::Ephemeral => {
                    let p = state.next_port;
                    state.next_port = state.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
                    p
                }
            };
            ports.push(PublishedPort {
                private_port: port.port,
                public_port: Some(public_port),
                protocol: port.protocol,
            });
        }

        let id = state.next_id("");
        state.created.push(spec.clone());
        state.containers.push(MemContainer {
            id: id.clone(),
            spec: spec.clone(),
            state: ContainerState::Created,
            ports,
            log: String::new(),
            exit_code: None,
        });
        Ok(id)
    }

    async fn start_container(&self, id: &ResourceId) -> Result<()> {
        let mut state = self.reachable()?;
        let name = state.container(id)?.spec.name().to_string();
        if state.failing_starts.contains(&name) {
            return Err(Error::Engine {
                operation: "start_container",
                message: format!("cannot start {name}"),
            });
        }
        state.container(id)?.state = ContainerState::Running;
        *state.starts.entry(name).or_default() += 1;
        Ok(())
    }

    async fn stop_container(&self, id: &ResourceId) -> Result<()> {
        let mut state = self.reachable()?;
        state.container(id)?.state = ContainerState::Exited;
        Ok(())
    }

    async fn remove_container(&self, id: &ResourceId) -> Result<()> {
        let mut state = self.reachable()?;
        let before = state.containers.len();
        state.containers.retain(|c| &c.id != id);
        if state.containers.len() == before {
            return Err(Error::NotFound {
                kind: ResourceKind::Container,
                name: id.0.clone(),
            });
        }
        Ok(())
    }

    async fn wait_container(&self, id: &ResourceId) -> Result<i64> {
        let spec = {
            let mut state = self.reachable()?;
            let container = state.container(id)?;
            if let Some(code) = container.exit_code {
                return Ok(code);
            }
            container.spec.clone()
        };

        let handler = self
            .run_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let output = match handler {
            Some(handler) => handler(&spec),
            None => RunOutput {
                exit_code: 0,
                log: String::new(),
            },
        };

        let mut state = self.reachable()?;
        let container = state.container(id)?;
        container.state = ContainerState::Exited;
        container.exit_code = Some(output.exit_code);
        container.log = output.log;
        Ok(output.exit_code)
    }

    async fn container_logs(&self, id: &ResourceId) -> Result<String> {
        let mut state = self.reachable()?;
        Ok(state.container(id)?.log.clone())
    }

    async fn exec(&self, id: &ResourceId, command: &[String], user: Option<&str>) -> Result<ExecOutput> {
        let name = {
            let mut state = self.reachable()?;
            let container = state.container(id)?;
            if !container.state.is_running() {
                return Err(Error::Engine {
                    operation: "exec",
                    message: format!("container {} is not running", container.spec.name()),
                });
            }
            let name = container.spec.name().to_string();
            state.execs.push(ExecCall {
                container: name.clone(),
                command: command.to_vec(),
                user: user.map(str::to_string),
            });
            name
        };

        let handler = self
            .exec_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(match handler {
            Some(handler) => handler(&name, command),
            None => ExecOutput::default(),
        })
    }
}
