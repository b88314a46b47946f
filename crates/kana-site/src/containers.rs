//! Container specs for every role a site runs.

use std::path::Path;

use kana_docker::{ContainerSpec, ContainerSpecBuilder, PortSpec, Scope};

use crate::settings::{Database, SiteSettings};

/// The bridge network shared by every site and the proxy.
pub const NETWORK: &str = "kana";

/// Role label carried by every site container.
pub const TYPE_LABEL: &str = "kana.type";

const DOCUMENT_ROOT: &str = "/var/www/html";
const DB_NAME: &str = "wordpress";
const DB_USER: &str = "wordpress";
const DB_PASSWORD: &str = "wordpress";
const DB_ROOT_PASSWORD: &str = "password";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    WordPress,
    Database,
    Mailpit,
    PhpMyAdmin,
    WpCli,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WordPress => "wordpress",
            Self::Database => "database",
            Self::Mailpit => "mailpit",
            Self::PhpMyAdmin => "phpmyadmin",
            Self::WpCli => "wordpress_cli",
        }
    }

    pub fn container_name(&self, site: &str) -> String {
        format!("kana-{site}-{}", self.as_str())
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn site_container(settings: &SiteSettings, role: Role, image: impl Into<String>) -> ContainerSpecBuilder {
    let name = role.container_name(&settings.name);
    ContainerSpec::builder(name.clone(), image, Scope::Site(settings.name.clone()))
        .hostname(name)
        .network(NETWORK)
        .label(TYPE_LABEL, role.as_str())
}

/// Add Traefik routers `<router>-http` (plain) and `<router>` (TLS).
fn routed(builder: ContainerSpecBuilder, router: &str, rule: &str) -> ContainerSpecBuilder {
    builder
        .label("traefik.enable", "true")
        .label(format!("traefik.http.routers.{router}-http.entrypoints"), "web")
        .label(format!("traefik.http.routers.{router}-http.rule"), rule)
        .label(format!("traefik.http.routers.{router}.entrypoints"), "websecure")
        .label(format!("traefik.http.routers.{router}.rule"), rule)
        .label(format!("traefik.http.routers.{router}.tls"), "true")
}

fn with_db_env(builder: ContainerSpecBuilder, settings: &SiteSettings) -> ContainerSpecBuilder {
    if settings.database.is_sqlite() {
        return builder.env("KANA_SQLITE", "true");
    }
    builder
        .env("WORDPRESS_DB_HOST", Role::Database.container_name(&settings.name))
        .env("WORDPRESS_DB_USER", DB_USER)
        .env("WORDPRESS_DB_PASSWORD", DB_PASSWORD)
        .env("WORDPRESS_DB_NAME", DB_NAME)
}

/// The document root, Kana's site directory, and the project itself for
/// plugins and themes.
fn with_wordpress_mounts(builder: ContainerSpecBuilder, settings: &SiteSettings) -> ContainerSpecBuilder {
    let builder = builder
        .bind(path_string(&settings.wordpress_dir()), DOCUMENT_ROOT)
        .bind(path_string(&settings.site_dir()), "/Site");

    match settings.site_type.content_dir() {
        Some(dir) => builder.bind(
            path_string(&settings.working_dir),
            format!("{DOCUMENT_ROOT}/wp-content/{dir}/{}", settings.name),
        ),
        None => builder,
    }
}

fn with_user(builder: ContainerSpecBuilder, user: Option<&str>) -> ContainerSpecBuilder {
    match user {
        Some(user) => builder.user(user),
        None => builder,
    }
}

/// The database server, or `None` for SQLite sites.
pub fn database(settings: &SiteSettings, user: Option<&str>) -> Option<ContainerSpec> {
    let image = settings.database.image()?;
    let prefix = match settings.database {
        Database::MySql { .. } => "MYSQL",
        _ => "MARIADB",
    };

    let builder = site_container(settings, Role::Database, image)
        .port(PortSpec::tcp(3306))
        .env(format!("{prefix}_ROOT_PASSWORD"), DB_ROOT_PASSWORD)
        .env(format!("{prefix}_DATABASE"), DB_NAME)
        .env(format!("{prefix}_USER"), DB_USER)
        .env(format!("{prefix}_PASSWORD"), DB_PASSWORD)
        .bind(path_string(&settings.database_dir()), "/var/lib/mysql");

    Some(with_user(builder, user).build())
}

pub fn wordpress(settings: &SiteSettings, user: Option<&str>) -> ContainerSpec {
    let domain = settings.site_domain();
    let rule = format!("HostRegexp(`{domain}`, `{{subdomain:.*}}.{domain}`)");

    let mut builder = site_container(settings, Role::WordPress, format!("wordpress:php{}", settings.php))
        .port(PortSpec::tcp(80));
    builder = with_db_env(builder, settings);
    if settings.wp_debug {
        builder = builder.env("WORDPRESS_DEBUG", "1");
    }

    let mut extra = format!("define( 'WP_ENVIRONMENT_TYPE', '{}' );", settings.environment);
    if settings.script_debug {
        extra.push_str("define( 'SCRIPT_DEBUG', true );");
    }
    builder = builder.env("WORDPRESS_CONFIG_EXTRA", extra);

    builder = routed(builder, &format!("wordpress-{}", settings.name), &rule);
    builder = with_wordpress_mounts(builder, settings);
    with_user(builder, user).build()
}

pub fn mailpit(settings: &SiteSettings) -> ContainerSpec {
    let rule = format!("Host(`mailpit-{}`)", settings.site_domain());
    let builder = site_container(settings, Role::Mailpit, "axllent/mailpit")
        .port(PortSpec::tcp(8025))
        .port(PortSpec::tcp(1025))
        .label(
            format!("traefik.http.services.mailpit-{}.loadbalancer.server.port", settings.name),
            "8025",
        );
    routed(builder, &format!("wordpress-{}-mailpit", settings.name), &rule).build()
}

/// The database admin UI, or `None` when there is no database server.
pub fn phpmyadmin(settings: &SiteSettings) -> Option<ContainerSpec> {
    if settings.database.is_sqlite() {
        return None;
    }
    let rule = format!("Host(`phpmyadmin-{}`)", settings.site_domain());
    let builder = site_container(settings, Role::PhpMyAdmin, "phpmyadmin")
        .env("MYSQL_ROOT_PASSWORD", DB_ROOT_PASSWORD)
        .env("PMA_HOST", Role::Database.container_name(&settings.name))
        .env("PMA_USER", DB_USER)
        .env("PMA_PASSWORD", DB_PASSWORD);
    Some(routed(builder, &format!("wordpress-{}-phpmyadmin", settings.name), &rule).build())
}

/// One-shot wp-cli run of `wp --path=/var/www/html <args>`.
pub fn wp_cli(settings: &SiteSettings, args: &[String], user: Option<&str>) -> ContainerSpec {
    let command = ["wp".to_string(), format!("--path={DOCUMENT_ROOT}")]
        .into_iter()
        .chain(args.iter().cloned());

    let mut builder = site_container(settings, Role::WpCli, format!("wordpress:cli-php{}", settings.php))
        .env("IS_KANA_ENVIRONMENT", "true")
        .command(command);
    builder = with_db_env(builder, settings);
    builder = with_wordpress_mounts(builder, settings);
    with_user(builder, user).build()
}

#[cfg(test)]
mod tests {
    use kana_docker::{MountKind, SITE_LABEL};

    use super::*;
    use crate::settings::SiteType;

    fn settings() -> SiteSettings {
        SiteSettings::new("demo", "/app", "/work/demo")
    }

    #[test]
    fn wordpress_routes_and_labels() {
        let spec = wordpress(&settings(), None);
        let labels = spec.labels();

        assert_eq!(spec.name(), "kana-demo-wordpress");
        assert_eq!(spec.image(), "wordpress:php8.2");
        assert_eq!(labels.get(SITE_LABEL).map(String::as_str), Some("demo"));
        assert_eq!(labels.get(TYPE_LABEL).map(String::as_str), Some("wordpress"));
        assert_eq!(
            labels.get("traefik.http.routers.wordpress-demo.rule").map(String::as_str),
            Some("HostRegexp(`demo.sites.kana.sh`, `{subdomain:.*}.demo.sites.kana.sh`)")
        );
        assert_eq!(
            labels.get("traefik.http.routers.wordpress-demo-http.entrypoints").map(String::as_str),
            Some("web")
        );
        assert_eq!(
            spec.env_var("WORDPRESS_CONFIG_EXTRA"),
            Some("define( 'WP_ENVIRONMENT_TYPE', 'local' );")
        );
        assert_eq!(spec.env_var("WORDPRESS_DB_HOST"), Some("kana-demo-database"));
    }

    #[test]
    fn plugin_mounts_working_dir() {
        let mut settings = settings();
        settings.site_type = SiteType::Plugin;
        let spec = wordpress(&settings, Some("1000:1000"));

        let plugin = spec
            .mounts()
            .iter()
            .find(|m| m.target == "/var/www/html/wp-content/plugins/demo")
            .unwrap();
        assert_eq!(plugin.kind, MountKind::Bind);
        assert_eq!(plugin.source, "/work/demo");
        assert_eq!(spec.user(), Some("1000:1000"));
    }

    #[test]
    fn sqlite_has_no_database_or_admin() {
        let mut settings = settings();
        settings.database = Database::Sqlite;

        assert!(database(&settings, None).is_none());
        assert!(phpmyadmin(&settings).is_none());
        assert_eq!(wordpress(&settings, None).env_var("KANA_SQLITE"), Some("true"));
    }

    #[test]
    fn mysql_uses_mysql_environment() {
        let mut settings = settings();
        settings.database = Database::MySql { version: "8".into() };
        let spec = database(&settings, None).unwrap();

        assert_eq!(spec.image(), "mysql:8");
        assert_eq!(spec.env_var("MYSQL_DATABASE"), Some("wordpress"));
        assert_eq!(spec.env_var("MARIADB_DATABASE"), None);
    }

    #[test]
    fn wp_cli_prefixes_path() {
        let args = vec!["option".to_string(), "get".to_string(), "siteurl".to_string()];
        let spec = wp_cli(&settings(), &args, None);

        assert_eq!(spec.name(), "kana-demo-wordpress_cli");
        assert_eq!(spec.image(), "wordpress:cli-php8.2");
        assert_eq!(
            spec.command().unwrap(),
            ["wp", "--path=/var/www/html", "option", "get", "siteurl"]
        );
    }
}
