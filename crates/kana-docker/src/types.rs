use std::collections::BTreeMap;
use std::fmt;

/// Label carrying the owning site's name on every site-scoped resource.
pub const SITE_LABEL: &str = "kana.site";

/// Label marking resources shared by all sites (the reverse proxy).
pub const GLOBAL_LABEL: &str = "kana.global";

/// Opaque engine-side identifier of a network, volume, image or container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of an ensure-operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured<T> {
    /// Whether this call created the resource.
    pub created: bool,
    pub resource: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: ResourceId,
    pub name: String,
    pub driver: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: ResourceId,
    pub repo_tags: Vec<String>,
}

/// One event of a streaming image pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullProgress {
    pub id: Option<String>,
    pub status: String,
    pub progress: Option<String>,
}

// ── Containers ──────────────────────────────────────────────────────

/// Engine-reported container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" | "removing" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedPort {
    pub private_port: u16,
    pub public_port: Option<u16>,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: ResourceId,
    /// Container name without the engine's leading `/`.
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PublishedPort>,
}

impl ContainerSummary {
    /// The site this container belongs to, if it is site-scoped.
    pub fn site(&self) -> Option<&str> {
        self.labels.get(SITE_LABEL).map(String::as_str)
    }

    /// Host port published for `private_port`, if any.
    pub fn public_port(&self, private_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.private_port == private_port)
            .and_then(|p| p.public_port)
    }
}

/// A label condition for container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFilter {
    /// The label is set, whatever its value.
    Present(String),
    Equals(String, String),
}

impl LabelFilter {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Present(key) => labels.contains_key(key),
            Self::Equals(key, value) => labels.get(key) == Some(value),
        }
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present(key) => f.write_str(key),
            Self::Equals(key, value) => write!(f, "{key}={value}"),
        }
    }
}

/// Which containers to list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Include stopped containers.
    pub all: bool,
    /// Exact container name.
    pub name: Option<String>,
    pub labels: Vec<LabelFilter>,
}

impl ContainerFilter {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn label(mut self, filter: LabelFilter) -> Self {
        self.labels.push(filter);
        self
    }

    pub fn matches(&self, name: &str, state: ContainerState, labels: &BTreeMap<String, String>) -> bool {
        (self.all || state.is_running())
            && self.name.as_deref().is_none_or(|n| n == name)
            && self.labels.iter().all(|f| f.matches(labels))
    }
}

/// How a container's declared ports are bound on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// Host port equals the container port.
    Declared,
    /// The engine picks a free ephemeral host port.
    Ephemeral,
}

impl Publish {
    pub fn host_port(&self, port: &PortSpec) -> String {
        match self {
            Self::Declared => port.port.to_string(),
            Self::Ephemeral => "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    /// Engine key, e.g. `80/tcp`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.port, self.protocol.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
}

/// Who a container belongs to. Decides the discovery label it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Site(String),
    Global,
}

/// Declarative description of one container.
///
/// Only [`ContainerSpecBuilder`] constructs it and the builder always writes
/// the scope label, so every spec is discoverable by [`SITE_LABEL`] or
/// [`GLOBAL_LABEL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    name: String,
    image: String,
    hostname: Option<String>,
    network: Option<String>,
    ports: Vec<PortSpec>,
    env: Vec<(String, String)>,
    labels: BTreeMap<String, String>,
    mounts: Vec<Mount>,
    command: Option<Vec<String>>,
    user: Option<String>,
}

impl ContainerSpec {
    pub fn builder(name: impl Into<String>, image: impl Into<String>, scope: Scope) -> ContainerSpecBuilder {
        ContainerSpecBuilder {
            spec: ContainerSpec {
                name: name.into(),
                image: image.into(),
                hostname: None,
                network: None,
                ports: Vec::new(),
                env: Vec::new(),
                labels: BTreeMap::new(),
                mounts: Vec::new(),
                command: None,
                user: None,
            },
            scope,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn ports(&self) -> &[PortSpec] {
        &self.ports
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Environment in engine form (`KEY=value`), in declaration order.
    pub fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn command(&self) -> Option<&[String]> {
        self.command.as_deref()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

pub struct ContainerSpecBuilder {
    spec: ContainerSpec,
    scope: Scope,
}

impl ContainerSpecBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.spec.hostname = Some(hostname.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.spec.network = Some(network.into());
        self
    }

    pub fn port(mut self, port: PortSpec) -> Self {
        self.spec.ports.push(port);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.push((key.into(), value.into()));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.labels.insert(key.into(), value.into());
        self
    }

    pub fn labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.spec
            .labels
            .extend(labels.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn bind(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.spec.mounts.push(Mount {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn volume(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.spec.mounts.push(Mount {
            kind: MountKind::Volume,
            source: name.into(),
            target: target.into(),
        });
        self
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.spec.user = Some(user.into());
        self
    }

    pub fn build(self) -> ContainerSpec {
        let mut spec = self.spec;
        match self.scope {
            Scope::Site(site) => spec.labels.insert(SITE_LABEL.to_string(), site),
            Scope::Global => spec.labels.insert(GLOBAL_LABEL.to_string(), "true".to_string()),
        };
        spec
    }
}

/// Outcome of a run-to-completion container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub log: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of a command run inside a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_always_writes_scope_label() {
        let spec = ContainerSpec::builder("kana-demo-wordpress", "wordpress:php8.2", Scope::Site("demo".into()))
            .label(SITE_LABEL, "someone-else")
            .build();
        assert_eq!(spec.labels().get(SITE_LABEL).map(String::as_str), Some("demo"));

        let proxy = ContainerSpec::builder("kana_traefik", "traefik", Scope::Global).build();
        assert_eq!(proxy.labels().get(GLOBAL_LABEL).map(String::as_str), Some("true"));
        assert!(!proxy.labels().contains_key(SITE_LABEL));
    }

    #[test]
    fn env_keeps_declaration_order() {
        let spec = ContainerSpec::builder("c", "i", Scope::Global)
            .env("B", "2")
            .env("A", "1")
            .build();
        assert_eq!(spec.env_strings(), vec!["B=2", "A=1"]);
        assert_eq!(spec.env_var("A"), Some("1"));
    }

    #[test]
    fn filter_matches_labels_and_state() {
        let mut labels = BTreeMap::new();
        labels.insert(SITE_LABEL.to_string(), "foo".to_string());

        let any_site = ContainerFilter::running().label(LabelFilter::Present(SITE_LABEL.into()));
        assert!(any_site.matches("x", ContainerState::Running, &labels));
        assert!(!any_site.matches("x", ContainerState::Exited, &labels));

        let bar = ContainerFilter::all().label(LabelFilter::Equals(SITE_LABEL.into(), "bar".into()));
        assert!(!bar.matches("x", ContainerState::Running, &labels));
    }

    #[test]
    fn ephemeral_publish_uses_port_zero() {
        let port = PortSpec::tcp(3306);
        assert_eq!(Publish::Declared.host_port(&port), "3306");
        assert_eq!(Publish::Ephemeral.host_port(&port), "0");
        assert_eq!(port.key(), "3306/tcp");
    }
}
