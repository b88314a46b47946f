use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use kana_docker::images::ImageCheckLog;
use kana_docker::memory::MemoryEngine;
use kana_docker::{Controller, ExecOutput, RunOutput};
use kana_site::containers::NETWORK;
use kana_site::proxy::PROXY_CONTAINER;
use kana_site::{
    Database, Error, Probe, ProbeFailure, RetryPolicy, RunState, Site, SiteSettings, SiteType,
};
use tempfile::TempDir;

/// Fails the first `failures` checks, then answers 200.
struct ScriptedProbe {
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl ScriptedProbe {
    fn boxed(failures: u32) -> (Box<dyn Probe>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let probe = Self {
            failures,
            calls: calls.clone(),
        };
        (Box::new(probe), calls)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn check(&self, _url: &str) -> Result<(), ProbeFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > self.failures {
            Ok(())
        } else {
            Err(ProbeFailure::Status(502))
        }
    }
}

struct Fixture {
    dir: TempDir,
    engine: Arc<MemoryEngine>,
    controller: Controller,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let controller = Controller::new(engine.clone(), ImageCheckLog::in_memory());
        Self {
            dir,
            engine,
            controller,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Settings for `name` with the proxy config already on disk.
    fn settings(&self, name: &str) -> SiteSettings {
        let working = self.root().join("work").join(name);
        std::fs::create_dir_all(&working).unwrap();

        let mut settings = SiteSettings::new(name, self.root().join("app"), working);
        settings.ssl = true;

        std::fs::create_dir_all(settings.traefik_dir()).unwrap();
        std::fs::write(settings.traefik_static_config(), "").unwrap();
        std::fs::write(settings.traefik_dynamic_config(), "").unwrap();
        settings
    }

    /// wp-cli answers as an installed site at `siteurl`.
    fn installed_at(&self, siteurl: &'static str) {
        self.engine.on_run(move |spec| {
            let command = spec.command().unwrap_or_default().join(" ");
            let log = if command.contains("option get siteurl") {
                format!("{siteurl}\n")
            } else if command.contains("plugin list") {
                "[]".to_string()
            } else {
                String::new()
            };
            RunOutput { exit_code: 0, log }
        });
    }

    async fn site_names(&self, site: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .controller
            .list_by_site(site)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        names
    }

    fn wp_cli_commands(&self) -> Vec<String> {
        self.engine
            .created_specs()
            .iter()
            .filter(|s| s.name().ends_with("-wordpress_cli"))
            .filter_map(|s| s.command().map(|c| c.join(" ")))
            .collect()
    }
}

#[tokio::test]
async fn start_then_stop_leaves_nothing_behind() {
    let fx = Fixture::new();
    fx.installed_at("https://demo.sites.kana.sh");
    let settings = fx.settings("demo");
    let (probe, calls) = ScriptedProbe::boxed(2);
    let site = Site::new(&fx.controller, &settings)
        .with_policy(RetryPolicy::immediate(5))
        .with_probe(probe);

    site.start().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(fx.site_names("demo").await, ["kana-demo-database", "kana-demo-wordpress"]);
    assert!(fx.controller.find_container(PROXY_CONTAINER).await.unwrap().is_some());
    assert!(settings.cert_dir().join("kana.site.pem").exists());
    assert!(
        settings
            .wordpress_dir()
            .join("wp-content/mu-plugins/kana-local-development.php")
            .exists()
    );

    // App containers publish on engine-chosen ports.
    let wordpress = fx
        .controller
        .find_container("kana-demo-wordpress")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(wordpress.public_port(80), Some(80));

    assert!(site.stop().await.unwrap());
    assert!(fx.site_names("").await.is_empty());
    assert!(fx.controller.find_container(PROXY_CONTAINER).await.unwrap().is_none());
    assert!(!fx.engine.network_names().contains(&NETWORK.to_string()));

    // Stopping again is not an error.
    assert!(!site.stop().await.unwrap());
}

#[tokio::test]
async fn second_site_keeps_proxy_alive() {
    let fx = Fixture::new();
    fx.installed_at("https://one.sites.kana.sh");
    let one = fx.settings("one");
    let two = fx.settings("two");

    for settings in [&one, &two] {
        let (probe, _) = ScriptedProbe::boxed(0);
        Site::new(&fx.controller, settings)
            .with_probe(probe)
            .start()
            .await
            .unwrap();
    }

    let site_one = Site::new(&fx.controller, &one);
    site_one.stop().await.unwrap();

    assert!(fx.site_names("one").await.is_empty());
    assert_eq!(fx.site_names("two").await, ["kana-two-database", "kana-two-wordpress"]);
    assert!(fx.controller.find_container(PROXY_CONTAINER).await.unwrap().is_some());
}

#[tokio::test]
async fn auxiliary_services_of_two_sites_coexist() {
    let fx = Fixture::new();
    fx.installed_at("https://one.sites.kana.sh");
    let mut sites = Vec::new();
    for name in ["one", "two"] {
        let mut settings = fx.settings(name);
        settings.mailpit = true;
        settings.phpmyadmin = true;
        sites.push(settings);
    }

    for settings in &sites {
        let (probe, _) = ScriptedProbe::boxed(0);
        Site::new(&fx.controller, settings)
            .with_probe(probe)
            .start()
            .await
            .unwrap();
    }

    assert!(fx.site_names("two").await.contains(&"kana-two-phpmyadmin".to_string()));

    let mut host_ports = Vec::new();
    for name in ["kana-one-mailpit", "kana-two-mailpit"] {
        let container = fx.controller.find_container(name).await.unwrap().unwrap();
        for port in &container.ports {
            let public = port.public_port.unwrap();
            assert_ne!(public, port.private_port, "{name}");
            host_ports.push(public);
        }
    }
    let count = host_ports.len();
    assert_eq!(count, 4);
    host_ports.sort_unstable();
    host_ports.dedup();
    assert_eq!(host_ports.len(), count);
}

#[tokio::test]
async fn sqlite_site_skips_database_and_admin() {
    let fx = Fixture::new();
    fx.installed_at("https://lite.sites.kana.sh");
    let mut settings = fx.settings("lite");
    settings.database = Database::Sqlite;
    settings.phpmyadmin = true;
    settings.mailpit = true;
    let (probe, _) = ScriptedProbe::boxed(0);

    Site::new(&fx.controller, &settings)
        .with_probe(probe)
        .start()
        .await
        .unwrap();

    assert_eq!(fx.site_names("lite").await, ["kana-lite-mailpit", "kana-lite-wordpress"]);
    assert!(!settings.database_dir().exists());
}

#[tokio::test]
async fn unreachable_site_times_out_and_keeps_running() {
    let fx = Fixture::new();
    let settings = fx.settings("slow");
    let (probe, calls) = ScriptedProbe::boxed(u32::MAX);

    let err = Site::new(&fx.controller, &settings)
        .with_policy(RetryPolicy::immediate(3))
        .with_probe(probe)
        .start()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::VerificationTimeout { attempts: 4, .. }), "{err}");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(fx.site_names("slow").await, ["kana-slow-database", "kana-slow-wordpress"]);
    assert!(fx.wp_cli_commands().is_empty());
}

#[tokio::test]
async fn fresh_site_is_installed() {
    let fx = Fixture::new();
    fx.engine.on_run(|spec| {
        let command = spec.command().unwrap_or_default().join(" ");
        let exit_code = if command.contains("option get siteurl") { 1 } else { 0 };
        RunOutput {
            exit_code,
            log: String::new(),
        }
    });
    let mut settings = fx.settings("fresh");
    settings.site_type = SiteType::Plugin;
    let (probe, _) = ScriptedProbe::boxed(0);

    Site::new(&fx.controller, &settings)
        .with_probe(probe)
        .start()
        .await
        .unwrap();

    let commands = fx.wp_cli_commands();
    assert!(commands.iter().any(|c| c.contains("core install")
        && c.contains("--url=https://fresh.sites.kana.sh")
        && c.contains("--title=Kana Development plugin: fresh")));
    assert!(commands.iter().any(|c| c.ends_with("plugin activate fresh")));
    assert!(settings.wordpress_dir().join("wp-content/plugins/fresh").is_dir());
}

#[tokio::test]
async fn failed_install_is_an_error() {
    let fx = Fixture::new();
    fx.engine.on_run(|_| RunOutput {
        exit_code: 1,
        log: "Error: Error establishing a database connection.".into(),
    });
    let settings = fx.settings("broken");
    let (probe, _) = ScriptedProbe::boxed(0);

    let err = Site::new(&fx.controller, &settings)
        .with_probe(probe)
        .start()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WordPressInstall(ref log) if log.contains("database connection")));
}

#[tokio::test]
async fn toggled_ssl_updates_site_url() {
    let fx = Fixture::new();
    fx.installed_at("http://demo.sites.kana.sh");
    let settings = fx.settings("demo");
    let (probe, _) = ScriptedProbe::boxed(0);

    Site::new(&fx.controller, &settings)
        .with_probe(probe)
        .start()
        .await
        .unwrap();

    let commands = fx.wp_cli_commands();
    for option in ["siteurl", "home"] {
        let expected = format!("option update {option} https://demo.sites.kana.sh");
        assert!(commands.iter().any(|c| c.ends_with(&expected)), "{expected}");
    }
    assert!(!commands.iter().any(|c| c.contains("core install")));
}

#[tokio::test]
async fn plugins_already_installed_are_skipped() {
    let fx = Fixture::new();
    fx.engine.on_run(|spec| {
        let command = spec.command().unwrap_or_default().join(" ");
        let log = if command.contains("option get siteurl") {
            "https://demo.sites.kana.sh".to_string()
        } else if command.contains("plugin list") {
            r#"[{"name":"query-monitor","status":"active"}]"#.to_string()
        } else {
            String::new()
        };
        RunOutput { exit_code: 0, log }
    });
    let mut settings = fx.settings("demo");
    settings.plugins = vec!["query-monitor".into(), "debug-bar".into()];
    let (probe, _) = ScriptedProbe::boxed(0);

    Site::new(&fx.controller, &settings)
        .with_probe(probe)
        .start()
        .await
        .unwrap();

    let installs: Vec<String> = fx
        .wp_cli_commands()
        .into_iter()
        .filter(|c| c.contains("plugin install"))
        .collect();
    assert_eq!(installs.len(), 1);
    assert!(installs[0].ends_with("plugin install --activate debug-bar"));
}

#[tokio::test]
async fn xdebug_is_installed_once_and_container_restarted() {
    let fx = Fixture::new();
    fx.installed_at("https://demo.sites.kana.sh");
    fx.engine.on_exec(|_, _| ExecOutput::default());
    let mut settings = fx.settings("demo");
    settings.xdebug = true;
    let (probe, _) = ScriptedProbe::boxed(0);

    Site::new(&fx.controller, &settings)
        .with_probe(probe)
        .start()
        .await
        .unwrap();

    let calls = fx.engine.exec_calls();
    assert!(calls.iter().all(|c| c.container == "kana-demo-wordpress"));
    assert!(calls.iter().all(|c| c.user.as_deref() == Some("root")));
    assert!(calls.iter().any(|c| c.command.last().map(String::as_str) == Some("pecl install xdebug")));
    assert_eq!(fx.engine.start_count("kana-demo-wordpress"), 2);
}

#[tokio::test]
async fn network_race_is_retried_once() {
    let fx = Fixture::new();
    fx.installed_at("https://demo.sites.kana.sh");
    fx.engine.inject_network_race(NETWORK);
    let settings = fx.settings("demo");
    let (probe, _) = ScriptedProbe::boxed(0);

    Site::new(&fx.controller, &settings)
        .with_probe(probe)
        .start()
        .await
        .unwrap();
    assert_eq!(fx.engine.network_names(), [NETWORK]);
}

#[tokio::test]
async fn missing_proxy_config_is_not_found() {
    let fx = Fixture::new();
    let settings = fx.settings("demo");
    std::fs::remove_file(settings.traefik_dynamic_config()).unwrap();

    let err = Site::new(&fx.controller, &settings).start().await.unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound(ref p) if p.ends_with("dynamic.toml")));
}

#[tokio::test]
async fn run_state_follows_lifecycle() {
    let fx = Fixture::new();
    fx.installed_at("https://demo.sites.kana.sh");
    let settings = fx.settings("demo");
    let site = Site::new(&fx.controller, &settings);
    let (healthy, _) = ScriptedProbe::boxed(0);
    let (failing, _) = ScriptedProbe::boxed(u32::MAX);

    assert_eq!(site.run_state(healthy.as_ref()).await.unwrap(), RunState::Unprovisioned);

    let (probe, _) = ScriptedProbe::boxed(0);
    Site::new(&fx.controller, &settings)
        .with_probe(probe)
        .start()
        .await
        .unwrap();

    assert_eq!(site.run_state(healthy.as_ref()).await.unwrap(), RunState::VerifiedHealthy);
    assert_eq!(site.run_state(failing.as_ref()).await.unwrap(), RunState::VerifiedFailed);

    fx.controller.stop_container("kana-demo-database").await.unwrap();
    assert_eq!(site.run_state(healthy.as_ref()).await.unwrap(), RunState::ContainersStarting);
}

#[tokio::test]
async fn unknown_php_version_is_reported() {
    let fx = Fixture::new();
    fx.engine.fail_pulls("wordpress:php5.2");
    let mut settings = fx.settings("old");
    settings.php = "5.2".into();

    let err = Site::new(&fx.controller, &settings).start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidVersion { ref image } if image == "wordpress:php5.2"));
}
