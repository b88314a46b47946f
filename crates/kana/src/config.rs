use std::env;
use std::path::{Path, PathBuf};

use kana_site::settings::{
    AdminCredentials, DEFAULT_APP_DOMAIN, DEFAULT_IMAGE_UPDATE_DAYS, DEFAULT_MARIADB_VERSION,
    DEFAULT_MYSQL_VERSION, DEFAULT_PHP,
};
use kana_site::{Database, Multisite, SiteSettings, SiteType, detect_site_type};

use crate::error::{CliError, Result, io_error};

/// Options read from `KANA_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub app_dir: PathBuf,
    pub domain: String,
    pub php: String,
    pub database: Database,
    pub site_type: Option<SiteType>,
    pub multisite: Multisite,
    pub ssl: bool,
    pub mailpit: bool,
    pub phpmyadmin: bool,
    pub xdebug: bool,
    pub wp_debug: bool,
    pub script_debug: bool,
    pub activate: bool,
    pub remove_default_plugins: bool,
    pub environment: String,
    pub update_interval: u32,
    pub admin: AdminCredentials,
    pub plugins: Vec<String>,
    pub theme: Option<String>,
}

fn parse_bool(key: &'static str, value: Option<String>, default: bool) -> Result<bool> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CliError::InvalidSetting { key, value }),
    }
}

fn parse_database(kind: Option<String>, version: Option<String>) -> Result<Database> {
    let kind = kind.unwrap_or_else(|| "mariadb".into());
    match kind.trim().to_ascii_lowercase().as_str() {
        "mariadb" => Ok(Database::MariaDb {
            version: version.unwrap_or_else(|| DEFAULT_MARIADB_VERSION.into()),
        }),
        "mysql" => Ok(Database::MySql {
            version: version.unwrap_or_else(|| DEFAULT_MYSQL_VERSION.into()),
        }),
        "sqlite" => Ok(Database::Sqlite),
        _ => Err(CliError::InvalidSetting {
            key: "KANA_DATABASE",
            value: kind,
        }),
    }
}

fn parse_site_type(value: String) -> Result<SiteType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "site" => Ok(SiteType::Site),
        "plugin" => Ok(SiteType::Plugin),
        "theme" => Ok(SiteType::Theme),
        _ => Err(CliError::InvalidSetting {
            key: "KANA_TYPE",
            value,
        }),
    }
}

fn parse_multisite(value: Option<String>) -> Result<Multisite> {
    let Some(value) = value else {
        return Ok(Multisite::None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "none" => Ok(Multisite::None),
        "subdomain" => Ok(Multisite::Subdomain),
        "subdirectory" => Ok(Multisite::Subdirectory),
        _ => Err(CliError::InvalidSetting {
            key: "KANA_MULTISITE",
            value,
        }),
    }
}

/// Comma separated, blanks dropped.
fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let app_dir = match lookup("KANA_APP_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => lookup("HOME")
                .map(|home| PathBuf::from(home).join(".config").join("kana"))
                .ok_or(CliError::NoAppDir)?,
        };
        let domain = lookup("KANA_DOMAIN").unwrap_or_else(|| DEFAULT_APP_DOMAIN.into());

        let update_interval = match lookup("KANA_UPDATE_INTERVAL") {
            Some(value) => value.trim().parse().map_err(|_| CliError::InvalidSetting {
                key: "KANA_UPDATE_INTERVAL",
                value,
            })?,
            None => DEFAULT_IMAGE_UPDATE_DAYS,
        };

        let defaults = AdminCredentials::default();
        let admin = AdminCredentials {
            username: lookup("KANA_ADMIN_USERNAME").unwrap_or(defaults.username),
            password: lookup("KANA_ADMIN_PASSWORD").unwrap_or(defaults.password),
            email: lookup("KANA_ADMIN_EMAIL").unwrap_or_else(|| format!("admin@{domain}")),
        };

        Ok(Self {
            php: lookup("KANA_PHP").unwrap_or_else(|| DEFAULT_PHP.into()),
            database: parse_database(lookup("KANA_DATABASE"), lookup("KANA_DATABASE_VERSION"))?,
            site_type: lookup("KANA_TYPE").map(parse_site_type).transpose()?,
            multisite: parse_multisite(lookup("KANA_MULTISITE"))?,
            ssl: parse_bool("KANA_SSL", lookup("KANA_SSL"), false)?,
            mailpit: parse_bool("KANA_MAILPIT", lookup("KANA_MAILPIT"), false)?,
            phpmyadmin: parse_bool("KANA_PHPMYADMIN", lookup("KANA_PHPMYADMIN"), false)?,
            xdebug: parse_bool("KANA_XDEBUG", lookup("KANA_XDEBUG"), false)?,
            wp_debug: parse_bool("KANA_WP_DEBUG", lookup("KANA_WP_DEBUG"), false)?,
            script_debug: parse_bool("KANA_SCRIPT_DEBUG", lookup("KANA_SCRIPT_DEBUG"), false)?,
            activate: parse_bool("KANA_ACTIVATE", lookup("KANA_ACTIVATE"), true)?,
            remove_default_plugins: parse_bool(
                "KANA_REMOVE_DEFAULT_PLUGINS",
                lookup("KANA_REMOVE_DEFAULT_PLUGINS"),
                false,
            )?,
            environment: lookup("KANA_ENVIRONMENT").unwrap_or_else(|| "local".into()),
            update_interval,
            admin,
            plugins: parse_list(lookup("KANA_PLUGINS")),
            theme: lookup("KANA_THEME").filter(|t| !t.trim().is_empty()),
            app_dir,
            domain,
        })
    }

    /// Settings for one site.
    ///
    /// With `name` the site is a named site living under the Kana directory;
    /// otherwise it is the project in `working_dir`, named after it.
    pub fn site_settings(&self, name: Option<&str>, working_dir: &Path) -> Result<SiteSettings> {
        let (name, working_dir, named_site) = match name {
            Some(name) => {
                let dir = self
                    .app_dir
                    .join("sites")
                    .join(kana_site::settings::sanitize_site_name(name));
                std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
                (name.to_string(), dir, true)
            }
            None => {
                let name = working_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| CliError::InvalidSetting {
                        key: "working directory",
                        value: working_dir.display().to_string(),
                    })?;
                (name, working_dir.to_path_buf(), false)
            }
        };

        let site_type = match self.site_type {
            Some(site_type) => site_type,
            None if named_site => SiteType::Site,
            None => detect_site_type(&working_dir),
        };

        let mut settings = SiteSettings::new(&name, &self.app_dir, working_dir);
        settings.app_domain = self.domain.clone();
        settings.php = self.php.clone();
        settings.database = self.database.clone();
        settings.site_type = site_type;
        settings.multisite = self.multisite;
        settings.ssl = self.ssl;
        settings.mailpit = self.mailpit;
        settings.phpmyadmin = self.phpmyadmin;
        settings.xdebug = self.xdebug;
        settings.wp_debug = self.wp_debug;
        settings.script_debug = self.script_debug;
        settings.activate = self.activate;
        settings.remove_default_plugins = self.remove_default_plugins;
        settings.environment = self.environment.clone();
        settings.image_update_days = self.update_interval;
        settings.admin = self.admin.clone();
        settings.plugins = self.plugins.clone();
        settings.theme = self.theme.clone();
        settings.named_site = named_site;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_follow_home() {
        let config = config(&[("HOME", "/home/dev")]).unwrap();

        assert_eq!(config.app_dir, PathBuf::from("/home/dev/.config/kana"));
        assert_eq!(config.domain, "sites.kana.sh");
        assert_eq!(config.php, "8.2");
        assert_eq!(config.database, Database::default());
        assert_eq!(config.update_interval, 7);
        assert!(config.activate);
        assert!(!config.ssl);
        assert_eq!(config.admin.email, "admin@sites.kana.sh");
    }

    #[test]
    fn no_home_and_no_app_dir_fails() {
        assert!(matches!(config(&[]), Err(CliError::NoAppDir)));
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("KANA_APP_DIR", "/srv/kana"),
            ("KANA_DATABASE", "mysql"),
            ("KANA_SSL", "yes"),
            ("KANA_MULTISITE", "subdomain"),
            ("KANA_PLUGINS", "query-monitor, debug-bar,,"),
            ("KANA_UPDATE_INTERVAL", "0"),
        ])
        .unwrap();

        assert_eq!(config.app_dir, PathBuf::from("/srv/kana"));
        assert_eq!(config.database, Database::MySql { version: "8".into() });
        assert!(config.ssl);
        assert_eq!(config.multisite, Multisite::Subdomain);
        assert_eq!(config.plugins, ["query-monitor", "debug-bar"]);
        assert_eq!(config.update_interval, 0);
    }

    #[test]
    fn rejects_bad_values() {
        let err = config(&[("HOME", "/h"), ("KANA_SSL", "maybe")]).unwrap_err();
        assert!(matches!(err, CliError::InvalidSetting { key: "KANA_SSL", .. }));

        let err = config(&[("HOME", "/h"), ("KANA_DATABASE", "postgres")]).unwrap_err();
        assert!(matches!(err, CliError::InvalidSetting { key: "KANA_DATABASE", .. }));
    }

    #[test]
    fn local_site_is_named_after_directory() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join("My Plugin");
        std::fs::create_dir_all(&working).unwrap();
        std::fs::write(working.join("plugin.php"), "<?php\n// Plugin Name: Mine\n").unwrap();

        let config = config(&[("KANA_APP_DIR", dir.path().join("app").to_str().unwrap())]).unwrap();
        let settings = config.site_settings(None, &working).unwrap();

        assert_eq!(settings.name, "my-plugin");
        assert_eq!(settings.site_type, SiteType::Plugin);
        assert!(!settings.named_site);
    }

    #[test]
    fn named_site_lives_under_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&[("KANA_APP_DIR", dir.path().to_str().unwrap())]).unwrap();
        let settings = config.site_settings(Some("Demo"), Path::new("/nowhere")).unwrap();

        assert!(settings.named_site);
        assert_eq!(settings.working_dir, dir.path().join("sites/demo"));
        assert!(settings.working_dir.is_dir());
        assert_eq!(settings.wordpress_dir(), dir.path().join("sites/demo/wordpress"));
    }
}
