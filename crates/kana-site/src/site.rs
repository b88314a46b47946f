use std::fmt;
use std::path::Path;

use kana_certs::{RootCa, load_or_create_root};
use kana_docker::{ContainerSpec, ContainerSummary, Controller, Publish, RunOutput};
use tracing::{debug, info, warn};

use crate::containers::{self, NETWORK, Role};
use crate::health::{HttpsProbe, Probe, RetryPolicy, verify_reachable};
use crate::proxy::{self, PROXY_CONTAINER};
use crate::settings::SiteSettings;
use crate::{Error, Result, io_error, tasks};

/// Where a site is in its lifecycle.
///
/// Derived from the engine on every call; nothing is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Unprovisioned,
    NetworkReady,
    ProxyReady,
    ContainersStarting,
    ContainersRunning,
    Verifying,
    VerifiedHealthy,
    VerifiedFailed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::NetworkReady => "network ready",
            Self::ProxyReady => "proxy ready",
            Self::ContainersStarting => "containers starting",
            Self::ContainersRunning => "containers running",
            Self::Verifying => "verifying",
            Self::VerifiedHealthy => "healthy",
            Self::VerifiedFailed => "unhealthy",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One site, bound to a controller and its settings for the length of a
/// command.
pub struct Site<'a> {
    controller: &'a Controller,
    settings: &'a SiteSettings,
    policy: RetryPolicy,
    probe: Option<Box<dyn Probe>>,
}

impl<'a> Site<'a> {
    pub fn new(controller: &'a Controller, settings: &'a SiteSettings) -> Self {
        Self {
            controller,
            settings,
            policy: RetryPolicy::default(),
            probe: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Probe used for verification instead of HTTPS against the Kana root.
    pub fn with_probe(mut self, probe: Box<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn settings(&self) -> &SiteSettings {
        self.settings
    }

    pub fn controller(&self) -> &Controller {
        self.controller
    }

    fn transition(&self, state: RunState) {
        debug!(site = %self.settings.name, state = %state, "site: state changed");
    }

    // ── Start ───────────────────────────────────────────────────────

    /// Bring the site up and, once it answers, finish the WordPress setup.
    ///
    /// On [`Error::VerificationTimeout`] the containers are left running.
    pub async fn start(&self) -> Result<()> {
        let settings = self.settings;
        info!(site = %settings.name, url = %settings.url(), "site: starting");

        if !settings.working_dir.is_dir() {
            return Err(Error::ResourceNotFound(settings.working_dir.clone()));
        }

        let root = self.ensure_certificates()?;
        self.ensure_network().await?;
        self.transition(RunState::NetworkReady);

        proxy::ensure_running(self.controller, settings).await?;
        self.transition(RunState::ProxyReady);

        self.prepare_directories()?;
        let user = local_user(&settings.working_dir);
        self.transition(RunState::ContainersStarting);

        let app = containers::database(settings, user.as_deref())
            .into_iter()
            .chain([containers::wordpress(settings, user.as_deref())]);
        for spec in app {
            self.run(&spec, Publish::Ephemeral).await?;
        }

        tasks::write_mu_plugin(settings)?;

        if settings.mailpit {
            self.run(&containers::mailpit(settings), Publish::Ephemeral).await?;
        }
        if settings.phpmyadmin {
            match containers::phpmyadmin(settings) {
                Some(spec) => self.run(&spec, Publish::Ephemeral).await?,
                None => debug!(site = %settings.name, "site: no database server, skipping phpMyAdmin"),
            }
        }
        self.transition(RunState::ContainersRunning);

        self.transition(RunState::Verifying);
        let verified = match &self.probe {
            Some(probe) => verify_reachable(probe.as_ref(), &settings.url(), self.policy).await,
            None => {
                let probe = HttpsProbe::new(root.cert_pem())?;
                verify_reachable(&probe, &settings.url(), self.policy).await
            }
        };
        if let Err(e) = verified {
            self.transition(RunState::VerifiedFailed);
            warn!(site = %settings.name, "site: verification failed, containers left running");
            return Err(e);
        }
        self.transition(RunState::VerifiedHealthy);

        tasks::run_post_start(self).await?;
        info!(site = %settings.name, url = %settings.url(), "site: started");
        Ok(())
    }

    /// Load the root CA and make sure a leaf for the app domain exists.
    ///
    /// A leaf that does not verify against the root is kept but reported.
    fn ensure_certificates(&self) -> Result<RootCa> {
        let files = self.settings.root_files();
        let root = load_or_create_root(&files)?;

        let names = &self.settings.certs;
        let cert_path = files.dir.join(&names.site_cert);
        let key_path = files.dir.join(&names.site_key);

        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let pem = std::fs::read_to_string(&cert_path).map_err(io_error(&cert_path))?;
                if let Err(e) = root.verify_leaf(&pem) {
                    warn!(cert = %cert_path.display(), error = %e, "site: site certificate was not issued by the current root");
                }
                return Ok(root);
            }
            (true, false) => std::fs::remove_file(&cert_path).map_err(io_error(&cert_path))?,
            (false, true) => std::fs::remove_file(&key_path).map_err(io_error(&key_path))?,
            (false, false) => {}
        }

        root.issue_leaf(&self.settings.app_domain, &files.dir, &names.site_cert, &names.site_key)?;
        Ok(root)
    }

    /// Re-query once when another process created the network first.
    async fn ensure_network(&self) -> Result<()> {
        match self.controller.ensure_network(NETWORK).await {
            Ok(_) => Ok(()),
            Err(kana_docker::Error::CreateConflict { .. }) => {
                debug!(network = NETWORK, "site: network created concurrently, re-checking");
                self.controller.ensure_network(NETWORK).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn prepare_directories(&self) -> Result<()> {
        let settings = self.settings;
        let wordpress_dir = settings.wordpress_dir();

        let mut dirs = vec![settings.site_dir(), wordpress_dir.clone()];
        if !settings.database.is_sqlite() {
            dirs.push(settings.database_dir());
        }
        if let Some(content) = settings.site_type.content_dir() {
            dirs.push(wordpress_dir.join("wp-content").join(content).join(&settings.name));
        }
        for dir in &dirs {
            std::fs::create_dir_all(dir).map_err(io_error(dir))?;
        }

        // The image writes its own from the container environment.
        let wp_config = wordpress_dir.join("wp-config.php");
        if wp_config.exists() {
            std::fs::remove_file(&wp_config).map_err(io_error(&wp_config))?;
        }
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec, publish: Publish) -> Result<()> {
        ensure_image(self.controller, spec.image(), self.settings.image_update_days).await?;
        self.controller.run_container(spec, publish).await?;
        Ok(())
    }

    // ── Stop ────────────────────────────────────────────────────────

    /// Stop every container of the site, then the proxy and network if no
    /// other site is left. Returns `false` when nothing was running.
    pub async fn stop(&self) -> Result<bool> {
        let mut stopped = false;
        for container in self.controller.list_by_site(&self.settings.name).await? {
            stopped |= self.controller.stop_container(&container.name).await?;
        }
        if stopped {
            info!(site = %self.settings.name, "site: stopped");
        }

        proxy::maybe_stop(self.controller).await?;
        Ok(stopped)
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub async fn containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self.controller.list_by_site(&self.settings.name).await?)
    }

    /// Current state as seen by the engine, probing the site once when all
    /// of its containers are up.
    pub async fn run_state(&self, probe: &dyn Probe) -> Result<RunState> {
        if self.controller.find_network(NETWORK).await?.is_none() {
            return Ok(RunState::Unprovisioned);
        }

        let proxy_running = self
            .controller
            .find_container(PROXY_CONTAINER)
            .await?
            .is_some_and(|c| c.state.is_running());
        if !proxy_running {
            return Ok(RunState::NetworkReady);
        }

        let running: Vec<String> = self
            .containers()
            .await?
            .into_iter()
            .filter(|c| c.state.is_running())
            .map(|c| c.name)
            .collect();
        if running.is_empty() {
            return Ok(RunState::ProxyReady);
        }

        let mut required = vec![Role::WordPress];
        if !self.settings.database.is_sqlite() {
            required.push(Role::Database);
        }
        let all_up = required
            .iter()
            .all(|role| running.contains(&role.container_name(&self.settings.name)));
        if !all_up {
            return Ok(RunState::ContainersStarting);
        }

        Ok(match probe.check(&self.settings.url()).await {
            Ok(()) => RunState::VerifiedHealthy,
            Err(failure) => {
                debug!(site = %self.settings.name, failure = %failure, "site: probe failed");
                RunState::VerifiedFailed
            }
        })
    }

    // ── wp-cli ──────────────────────────────────────────────────────

    /// Run `wp <args>` in a one-shot container against the site.
    pub async fn wp_cli(&self, args: &[String]) -> Result<RunOutput> {
        let user = local_user(&self.settings.working_dir);
        let spec = containers::wp_cli(self.settings, args, user.as_deref());
        ensure_image(self.controller, spec.image(), self.settings.image_update_days).await?;
        Ok(self.controller.run_and_remove(&spec).await?)
    }
}

/// Pull `reference` if needed. An unknown manifest means the requested
/// PHP or database version does not exist.
pub(crate) async fn ensure_image(controller: &Controller, reference: &str, update_days: u32) -> Result<()> {
    match controller.ensure_image(reference, update_days).await {
        Ok(_) => Ok(()),
        Err(kana_docker::Error::ImagePullFailed { reference, reason }) if reason.contains("manifest unknown") => {
            Err(Error::InvalidVersion { image: reference })
        }
        Err(e) => Err(e.into()),
    }
}

/// `uid:gid` owning the working directory, so files written by the
/// containers stay editable on the host.
#[cfg(target_os = "linux")]
fn local_user(dir: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata(dir)
        .ok()
        .map(|meta| format!("{}:{}", meta.uid(), meta.gid()))
}

#[cfg(not(target_os = "linux"))]
fn local_user(_dir: &Path) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kana_docker::images::ImageCheckLog;
    use kana_docker::memory::MemoryEngine;

    use super::*;

    #[tokio::test]
    async fn unknown_manifest_is_invalid_version() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_pulls("wordpress:php9.9");
        let controller = Controller::new(engine, ImageCheckLog::in_memory());

        let err = ensure_image(&controller, "wordpress:php9.9", 7).await.unwrap_err();
        assert!(matches!(err, Error::InvalidVersion { ref image } if image == "wordpress:php9.9"));
    }

    #[tokio::test]
    async fn missing_working_dir_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SiteSettings::new("gone", dir.path(), dir.path().join("gone"));
        let controller = Controller::new(Arc::new(MemoryEngine::new()), ImageCheckLog::in_memory());

        let err = Site::new(&controller, &settings).start().await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(ref p) if p.ends_with("gone")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn local_user_reads_owner() {
        let dir = tempfile::tempdir().unwrap();
        let user = local_user(dir.path()).unwrap();
        let (uid, gid) = user.split_once(':').unwrap();
        assert!(uid.parse::<u32>().is_ok());
        assert!(gid.parse::<u32>().is_ok());
    }
}
