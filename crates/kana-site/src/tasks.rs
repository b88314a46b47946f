//! WordPress setup that runs once the site answers.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::containers::Role;
use crate::settings::{Multisite, SiteSettings, SiteType};
use crate::site::Site;
use crate::{Error, Result, io_error};

const DEFAULT_PLUGINS: [&str; 2] = ["hello.php", "akismet"];
const HIDDEN_PLUGINS: [&str; 2] = ["hello", "akismet"];

const MU_PLUGIN_FILE: &str = "kana-local-development.php";

const XDEBUG_INI: [&str; 6] = [
    "xdebug.start_with_request=yes",
    "xdebug.mode=debug,develop,trace",
    "xdebug.client_host=host.docker.internal",
    "xdebug.discover_client_host=on",
    "xdebug.start_with_request=trigger",
    "xdebug.show_local_vars=1",
];

const MULTISITE_HTACCESS: &str = r#"# BEGIN WordPress Multisite
RewriteEngine On
RewriteRule .* - [E=HTTP_AUTHORIZATION:%{HTTP:Authorization}]
RewriteBase /
RewriteRule ^index\.php$ - [L]

# add a trailing slash to /wp-admin
RewriteRule ^([_0-9a-zA-Z-]+/)?wp-admin$ $1wp-admin/ [R=301,L]

RewriteCond %{REQUEST_FILENAME} -f [OR]
RewriteCond %{REQUEST_FILENAME} -d
RewriteRule ^ - [L]
RewriteRule ^([_0-9a-zA-Z-]+/)?(wp-(content|admin|includes).*) $2 [L]
RewriteRule ^([_0-9a-zA-Z-]+/)?(.*\.php)$ $2 [L]
RewriteRule . index.php [L]
# END WordPress Multisite
"#;

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Everything after a healthy verification, in order.
pub(crate) async fn run_post_start(site: &Site<'_>) -> Result<()> {
    let settings = site.settings();

    install_wordpress(site).await?;
    if settings.remove_default_plugins {
        remove_default_plugins(settings)?;
    }
    install_plugins(site).await?;
    activate_theme(site).await?;
    activate_project(site).await?;
    if settings.xdebug {
        enable_xdebug(site).await?;
    }
    Ok(())
}

// ── WordPress core ──────────────────────────────────────────────────

/// Install WordPress when `siteurl` cannot be read, otherwise bring
/// `siteurl` and `home` in line with the configured scheme.
pub async fn install_wordpress(site: &Site<'_>) -> Result<()> {
    let settings = site.settings();
    let url = settings.url();

    let current = site.wp_cli(&args(["option", "get", "siteurl"])).await;
    match current {
        Ok(output) if output.success() => {
            let current = output.log.trim();
            if current == url {
                return Ok(());
            }
            info!(site = %settings.name, from = current, to = %url, "wordpress: updating site URL");
            for option in ["siteurl", "home"] {
                let output = site.wp_cli(&args(["option", "update", option, url.as_str()])).await?;
                if !output.success() {
                    return Err(Error::WordPressInstall(output.log));
                }
            }
            Ok(())
        }
        _ => {
            info!(site = %settings.name, "wordpress: finishing installation");
            let output = site.wp_cli(&install_command(settings)).await?;
            if !output.success() {
                return Err(Error::WordPressInstall(output.log));
            }
            if settings.multisite != Multisite::None {
                write_htaccess(settings)?;
            }
            Ok(())
        }
    }
}

fn install_command(settings: &SiteSettings) -> Vec<String> {
    let subcommand = match settings.multisite {
        Multisite::None => "install",
        Multisite::Subdomain | Multisite::Subdirectory => "multisite-install",
    };
    let mut command = vec![
        "core".to_string(),
        subcommand.to_string(),
        format!("--url={}", settings.url()),
        format!("--title=Kana Development {}: {}", settings.site_type, settings.name),
        format!("--admin_user={}", settings.admin.username),
        format!("--admin_password={}", settings.admin.password),
        format!("--admin_email={}", settings.admin.email),
    ];
    if settings.multisite == Multisite::Subdomain {
        command.push("--subdomains".to_string());
    }
    command
}

pub fn write_htaccess(settings: &SiteSettings) -> Result<()> {
    let path = settings.wordpress_dir().join(".htaccess");
    std::fs::write(&path, MULTISITE_HTACCESS).map_err(io_error(&path))
}

/// Must-use plugin that keeps the local install quiet and routes mail to
/// Mailpit.
pub fn write_mu_plugin(settings: &SiteSettings) -> Result<()> {
    let dir = settings.wordpress_dir().join("wp-content").join("mu-plugins");
    std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;

    let path = dir.join(MU_PLUGIN_FILE);
    std::fs::write(&path, mu_plugin(&settings.name)).map_err(io_error(&path))?;
    debug!(path = %path.display(), "wordpress: development plugin written");
    Ok(())
}

fn mu_plugin(site: &str) -> String {
    let mailpit = Role::Mailpit.container_name(site);
    format!(
        r#"<?php
/**
 * Plugin Name: Kana Local Development
 * Description: Settings for local development with Kana.
 * Version: 1.0.0
 */

add_filter( 'automatic_updater_disabled', '__return_true' );
add_filter( 'auto_update_core', '__return_false' );
add_filter( 'auto_update_plugin', '__return_false' );
add_filter( 'auto_update_theme', '__return_false' );

add_action(
	'phpmailer_init',
	function ( $phpmailer ) {{
		$phpmailer->isSMTP();
		$phpmailer->Host     = '{mailpit}';
		$phpmailer->Port     = 1025;
		$phpmailer->SMTPAuth = false;
	}}
);
"#
    )
}

// ── Plugins and themes ──────────────────────────────────────────────

pub fn remove_default_plugins(settings: &SiteSettings) -> Result<()> {
    let plugins = settings.wordpress_dir().join("wp-content").join("plugins");
    for plugin in DEFAULT_PLUGINS {
        remove_path(&plugins.join(plugin))?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let removed = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match removed {
        Ok(()) => {
            debug!(path = %path.display(), "wordpress: default plugin removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path)(e)),
    }
}

#[derive(Debug, Deserialize)]
struct PluginEntry {
    name: String,
    status: String,
}

/// Names from `wp plugin list --format=json`, without drop-ins, must-use
/// plugins, the bundled defaults and the project itself.
fn parse_plugin_list(json: &str, site: &str) -> Result<Vec<String>> {
    let entries: Vec<PluginEntry> = serde_json::from_str(json.trim())?;
    Ok(entries
        .into_iter()
        .filter(|p| p.status != "dropin" && p.status != "must-use")
        .filter(|p| p.name != site && !HIDDEN_PLUGINS.contains(&p.name.as_str()))
        .map(|p| p.name)
        .collect())
}

pub async fn installed_plugins(site: &Site<'_>) -> Result<Vec<String>> {
    let output = site
        .wp_cli(&args(["plugin", "list", "--format=json"]))
        .await?;
    if !output.success() {
        warn!(site = %site.settings().name, "wordpress: cannot list plugins");
        return Ok(Vec::new());
    }
    parse_plugin_list(&output.log, &site.settings().name)
}

pub async fn install_plugins(site: &Site<'_>) -> Result<()> {
    let settings = site.settings();
    if settings.plugins.is_empty() {
        return Ok(());
    }

    let installed = installed_plugins(site).await?;
    for plugin in settings.plugins.iter().filter(|p| !installed.contains(p)) {
        info!(plugin = %plugin, "wordpress: installing plugin");
        let output = site
            .wp_cli(&args(["plugin", "install", "--activate", plugin.as_str()]))
            .await?;
        if !output.success() {
            warn!(plugin = %plugin, output = %output.log.trim(), "wordpress: plugin install failed");
        }
    }
    Ok(())
}

pub async fn activate_theme(site: &Site<'_>) -> Result<()> {
    let Some(theme) = &site.settings().theme else {
        return Ok(());
    };

    info!(theme = %theme, "wordpress: activating theme");
    let output = site
        .wp_cli(&args(["theme", "install", "--activate", theme.as_str()]))
        .await?;
    if !output.success() {
        warn!(theme = %theme, output = %output.log.trim(), "wordpress: theme activation failed");
    }
    Ok(())
}

/// Activate the plugin or theme being developed.
pub async fn activate_project(site: &Site<'_>) -> Result<()> {
    let settings = site.settings();
    if !settings.activate || settings.site_type == SiteType::Site {
        return Ok(());
    }

    let kind = settings.site_type.as_str();
    info!(kind, name = %settings.name, "wordpress: activating project");
    let output = site.wp_cli(&args([kind, "activate", settings.name.as_str()])).await?;
    if !output.success() {
        warn!(kind, name = %settings.name, output = %output.log.trim(), "wordpress: project activation failed");
    }
    Ok(())
}

// ── Xdebug ──────────────────────────────────────────────────────────

fn shell(command: &str) -> Vec<String> {
    args(["sh", "-c", command])
}

fn xdebug_commands() -> Vec<String> {
    let mut commands = vec![
        "pecl install xdebug".to_string(),
        "docker-php-ext-enable xdebug".to_string(),
    ];
    commands.extend(
        XDEBUG_INI
            .iter()
            .map(|line| format!("echo '{line}' >> /usr/local/etc/php/php.ini")),
    );
    commands.push("echo 'html_errors = On' >> /usr/local/etc/php/conf.d/z-custom.ini".to_string());
    commands
}

/// Install and enable Xdebug in the running WordPress container, then
/// restart it. Skipped when the extension is already there.
pub async fn enable_xdebug(site: &Site<'_>) -> Result<()> {
    let controller = site.controller();
    let container = Role::WordPress.container_name(&site.settings().name);

    let check = controller
        .exec(&container, &shell("pecl list | grep xdebug"), true)
        .await?;
    if check.stdout.contains("xdebug") {
        debug!(container = %container, "xdebug: already installed");
        return Ok(());
    }

    info!(container = %container, "xdebug: installing");
    for command in xdebug_commands() {
        let output = controller.exec(&container, &shell(&command), true).await?;
        if output.exit_code != 0 {
            warn!(container = %container, command = %command, stderr = %output.stderr.trim(), "xdebug: command failed");
            return Ok(());
        }
    }

    controller.restart_container(&container).await?;
    info!(container = %container, "xdebug: enabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_list_skips_defaults_and_project() {
        let json = r#"[
            {"name":"akismet","status":"inactive","update":"none","version":"5.3"},
            {"name":"hello","status":"inactive","update":"none","version":"1.7.2"},
            {"name":"query-monitor","status":"active","update":"none","version":"3.15.0"},
            {"name":"demo","status":"active","update":"none","version":"0.1.0"},
            {"name":"kana-local-development","status":"must-use","update":"none","version":"1.0.0"},
            {"name":"object-cache.php","status":"dropin","update":"none","version":""}
        ]"#;
        assert_eq!(parse_plugin_list(json, "demo").unwrap(), vec!["query-monitor"]);
    }

    #[test]
    fn garbage_plugin_list_is_an_error() {
        assert!(matches!(
            parse_plugin_list("Error: not installed", "demo"),
            Err(Error::WpCliOutput(_))
        ));
    }

    #[test]
    fn install_command_for_subdomain_multisite() {
        let mut settings = SiteSettings::new("demo", "/app", "/work");
        settings.multisite = Multisite::Subdomain;
        settings.ssl = true;

        let command = install_command(&settings);
        assert_eq!(command[..2], ["core", "multisite-install"]);
        assert!(command.contains(&"--url=https://demo.sites.kana.sh".to_string()));
        assert!(command.contains(&"--title=Kana Development site: demo".to_string()));
        assert_eq!(command.last().map(String::as_str), Some("--subdomains"));
    }

    #[test]
    fn default_plugins_are_removed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SiteSettings::new("demo", dir.path(), dir.path());
        let plugins = dir.path().join("wp-content/plugins");
        std::fs::create_dir_all(plugins.join("akismet")).unwrap();
        std::fs::write(plugins.join("akismet/akismet.php"), "<?php").unwrap();
        std::fs::write(plugins.join("hello.php"), "<?php").unwrap();
        std::fs::create_dir_all(plugins.join("keep")).unwrap();

        remove_default_plugins(&settings).unwrap();
        remove_default_plugins(&settings).unwrap();

        assert!(!plugins.join("akismet").exists());
        assert!(!plugins.join("hello.php").exists());
        assert!(plugins.join("keep").exists());
    }

    #[test]
    fn mu_plugin_points_at_mailpit() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SiteSettings::new("demo", dir.path(), dir.path());
        write_mu_plugin(&settings).unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("wp-content/mu-plugins").join(MU_PLUGIN_FILE)).unwrap();
        assert!(contents.contains("'kana-demo-mailpit'"));
        assert!(contents.contains("automatic_updater_disabled"));
    }

    #[test]
    fn xdebug_appends_ini_lines() {
        let commands = xdebug_commands();
        assert_eq!(commands[0], "pecl install xdebug");
        assert!(commands.contains(&"echo 'xdebug.mode=debug,develop,trace' >> /usr/local/etc/php/php.ini".to_string()));
    }
}
