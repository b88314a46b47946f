use std::fmt;
use std::path::{Path, PathBuf};

use kana_certs::RootFiles;

pub const DEFAULT_APP_DOMAIN: &str = "sites.kana.sh";
pub const DEFAULT_PHP: &str = "8.2";
pub const DEFAULT_MARIADB_VERSION: &str = "11";
pub const DEFAULT_MYSQL_VERSION: &str = "8";
pub const DEFAULT_IMAGE_UPDATE_DAYS: u32 = 7;

/// Database server backing a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Database {
    MariaDb { version: String },
    MySql { version: String },
    /// No database container; WordPress keeps its data in a file.
    Sqlite,
}

impl Database {
    /// Image for the database container, if the site has one.
    pub fn image(&self) -> Option<String> {
        match self {
            Self::MariaDb { version } => Some(format!("mariadb:{version}")),
            Self::MySql { version } => Some(format!("mysql:{version}")),
            Self::Sqlite => None,
        }
    }

    pub fn is_sqlite(&self) -> bool {
        matches!(self, Self::Sqlite)
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::MariaDb {
            version: DEFAULT_MARIADB_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiteType {
    #[default]
    Site,
    Plugin,
    Theme,
}

impl SiteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Plugin => "plugin",
            Self::Theme => "theme",
        }
    }

    /// The `wp-content` subdirectory the working directory is mounted into.
    pub fn content_dir(&self) -> Option<&'static str> {
        match self {
            Self::Site => None,
            Self::Plugin => Some("plugins"),
            Self::Theme => Some("themes"),
        }
    }
}

impl fmt::Display for SiteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Multisite {
    #[default]
    None,
    Subdomain,
    Subdirectory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
    pub email: String,
}

impl Default for AdminCredentials {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: "password".into(),
            email: format!("admin@{DEFAULT_APP_DOMAIN}"),
        }
    }
}

/// File names of the root and site certificates inside the cert directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateNames {
    pub root_cert: String,
    pub root_key: String,
    pub site_cert: String,
    pub site_key: String,
}

impl Default for CertificateNames {
    fn default() -> Self {
        Self {
            root_cert: "kana.root.pem".into(),
            root_key: "kana.root.key".into(),
            site_cert: "kana.site.pem".into(),
            site_key: "kana.site.key".into(),
        }
    }
}

/// Everything a site needs to know about itself. Built once at startup and
/// only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSettings {
    pub name: String,
    pub app_domain: String,
    pub php: String,
    pub database: Database,
    pub site_type: SiteType,
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
    /// `0` disables image update checks.
    pub image_update_days: u32,
    pub admin: AdminCredentials,
    pub plugins: Vec<String>,
    pub theme: Option<String>,
    pub app_dir: PathBuf,
    pub working_dir: PathBuf,
    /// The site was started by name rather than from its own directory.
    pub named_site: bool,
    pub certs: CertificateNames,
}

impl SiteSettings {
    /// Settings with every option at its default.
    pub fn new(name: &str, app_dir: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: sanitize_site_name(name),
            app_domain: DEFAULT_APP_DOMAIN.into(),
            php: DEFAULT_PHP.into(),
            database: Database::default(),
            site_type: SiteType::default(),
            multisite: Multisite::default(),
            ssl: false,
            mailpit: false,
            phpmyadmin: false,
            xdebug: false,
            wp_debug: false,
            script_debug: false,
            activate: true,
            remove_default_plugins: false,
            environment: "local".into(),
            image_update_days: DEFAULT_IMAGE_UPDATE_DAYS,
            admin: AdminCredentials::default(),
            plugins: Vec::new(),
            theme: None,
            app_dir: app_dir.into(),
            working_dir: working_dir.into(),
            named_site: false,
            certs: CertificateNames::default(),
        }
    }

    /// `<name>.<app domain>`
    pub fn site_domain(&self) -> String {
        format!("{}.{}", self.name, self.app_domain)
    }

    pub fn url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}", self.site_domain())
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.app_dir.join("certs")
    }

    pub fn root_files(&self) -> RootFiles {
        RootFiles::new(self.cert_dir(), &self.certs.root_cert, &self.certs.root_key)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.app_dir.join("config")
    }

    pub fn traefik_dir(&self) -> PathBuf {
        self.config_dir().join("traefik")
    }

    pub fn traefik_static_config(&self) -> PathBuf {
        self.traefik_dir().join("traefik.toml")
    }

    pub fn traefik_dynamic_config(&self) -> PathBuf {
        self.traefik_dir().join("dynamic.toml")
    }

    pub fn image_log_path(&self) -> PathBuf {
        self.config_dir().join("images.json")
    }

    pub fn sites_dir(&self) -> PathBuf {
        self.app_dir.join("sites")
    }

    /// Kana's own per-site directory, mounted at `/Site`.
    pub fn site_dir(&self) -> PathBuf {
        self.sites_dir().join(&self.name)
    }

    /// Host directory mounted as the WordPress document root.
    pub fn wordpress_dir(&self) -> PathBuf {
        if self.named_site {
            self.site_dir().join("wordpress")
        } else if self.site_type == SiteType::Site {
            self.working_dir.clone()
        } else {
            self.working_dir.join("wordpress")
        }
    }

    pub fn database_dir(&self) -> PathBuf {
        self.site_dir().join("database")
    }
}

/// Guess what the working directory holds.
///
/// A WordPress core checkout is a site. Otherwise the first top-level
/// `style.css` or `*.php` carrying a `Theme Name:` or `Plugin Name:` header
/// decides. Anything else, including an empty or unreadable directory, is a
/// site.
pub fn detect_site_type(dir: &Path) -> SiteType {
    if dir.join("wp-includes").join("version.php").is_file() {
        return SiteType::Site;
    }

    let Ok(entries) = std::fs::read_dir(dir) else {
        return SiteType::Site;
    };
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name().is_some_and(|n| n == "style.css")
                || p.extension().is_some_and(|ext| ext == "php")
        })
        .collect();
    candidates.sort();

    for path in candidates {
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in contents.lines() {
            if line.contains("Theme Name:") {
                return SiteType::Theme;
            }
            if line.contains("Plugin Name:") {
                return SiteType::Plugin;
            }
        }
    }
    SiteType::Site
}

/// Lower-case and trimmed, with spaces and underscores turned into dashes so
/// the name is a valid host label.
pub fn sanitize_site_name(raw: &str) -> String {
    raw.trim().to_lowercase().replace([' ', '_'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_site_name("  My Site "), "my-site");
        assert_eq!(sanitize_site_name("my_site"), "my-site");
        assert_eq!(SiteSettings::new("my_site", "/a", "/w").url(), "http://my-site.sites.kana.sh");
        assert_eq!(SiteSettings::new("Demo", "/a", "/w").name, "demo");
    }

    #[test]
    fn url_follows_ssl() {
        let mut settings = SiteSettings::new("demo", "/a", "/w");
        assert_eq!(settings.url(), "http://demo.sites.kana.sh");
        settings.ssl = true;
        assert_eq!(settings.url(), "https://demo.sites.kana.sh");
    }

    #[test]
    fn wordpress_dir_depends_on_site_kind() {
        let mut settings = SiteSettings::new("demo", "/app", "/work/demo");
        assert_eq!(settings.wordpress_dir(), PathBuf::from("/work/demo"));

        settings.site_type = SiteType::Plugin;
        assert_eq!(settings.wordpress_dir(), PathBuf::from("/work/demo/wordpress"));

        settings.named_site = true;
        assert_eq!(settings.wordpress_dir(), PathBuf::from("/app/sites/demo/wordpress"));
        assert_eq!(settings.database_dir(), PathBuf::from("/app/sites/demo/database"));
    }

    #[test]
    fn detects_project_kind() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_site_type(dir.path()), SiteType::Site);

        std::fs::write(dir.path().join("my-plugin.php"), "<?php\n/**\n * Plugin Name: My Plugin\n */\n").unwrap();
        assert_eq!(detect_site_type(dir.path()), SiteType::Plugin);

        let theme = tempfile::tempdir().unwrap();
        std::fs::write(theme.path().join("style.css"), "/*\nTheme Name: Demo\n*/\n").unwrap();
        assert_eq!(detect_site_type(theme.path()), SiteType::Theme);

        std::fs::create_dir_all(dir.path().join("wp-includes")).unwrap();
        std::fs::write(dir.path().join("wp-includes/version.php"), "<?php").unwrap();
        assert_eq!(detect_site_type(dir.path()), SiteType::Site);
    }

    #[test]
    fn database_images() {
        assert_eq!(Database::default().image().as_deref(), Some("mariadb:11"));
        let mysql = Database::MySql {
            version: DEFAULT_MYSQL_VERSION.into(),
        };
        assert_eq!(mysql.image().as_deref(), Some("mysql:8"));
        assert_eq!(Database::Sqlite.image(), None);
    }
}
