//! Traefik configuration files mounted into the proxy container.

use std::collections::BTreeMap;
use std::path::Path;

use kana_site::SiteSettings;
use serde::Serialize;
use tracing::info;

use crate::error::{Result, io_error};

// ── Static config ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StaticConfig {
    pub log: LogConfig,
    pub api: ApiConfig,
    pub providers: ProvidersConfig,
    #[serde(rename = "entryPoints")]
    pub entry_points: BTreeMap<String, EntryPoint>,
}

#[derive(Debug, Serialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Serialize)]
pub struct ApiConfig {
    pub dashboard: bool,
    pub insecure: bool,
}

#[derive(Debug, Serialize)]
pub struct ProvidersConfig {
    pub docker: DockerProvider,
    pub file: FileProvider,
}

#[derive(Debug, Serialize)]
pub struct DockerProvider {
    #[serde(rename = "exposedByDefault")]
    pub exposed_by_default: bool,
    pub network: String,
}

#[derive(Debug, Serialize)]
pub struct FileProvider {
    pub filename: String,
    pub watch: bool,
}

#[derive(Debug, Serialize)]
pub struct EntryPoint {
    pub address: String,
}

// ── Dynamic config ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct DynamicConfig {
    pub tls: TlsConfig,
}

#[derive(Debug, Serialize)]
pub struct TlsConfig {
    pub options: BTreeMap<String, TlsOptions>,
    pub certificates: Vec<TlsCertificate>,
}

#[derive(Debug, Serialize)]
pub struct TlsOptions {
    #[serde(rename = "minVersion")]
    pub min_version: String,
}

#[derive(Debug, Serialize)]
pub struct TlsCertificate {
    #[serde(rename = "certFile")]
    pub cert_file: String,
    #[serde(rename = "keyFile")]
    pub key_file: String,
}

// ── Builders ────────────────────────────────────────────────────────

pub fn build_static_config() -> StaticConfig {
    let entry_points = [("web", ":80"), ("websecure", ":443"), ("traefik", ":8080")]
        .into_iter()
        .map(|(name, address)| {
            (
                name.to_string(),
                EntryPoint {
                    address: address.to_string(),
                },
            )
        })
        .collect();

    StaticConfig {
        log: LogConfig {
            level: "ERROR".into(),
        },
        api: ApiConfig {
            dashboard: true,
            insecure: true,
        },
        providers: ProvidersConfig {
            docker: DockerProvider {
                exposed_by_default: false,
                network: kana_site::containers::NETWORK.into(),
            },
            file: FileProvider {
                filename: "/etc/traefik/dynamic.toml".into(),
                watch: true,
            },
        },
        entry_points,
    }
}

pub fn build_dynamic_config(settings: &SiteSettings) -> DynamicConfig {
    let mut options = BTreeMap::new();
    options.insert(
        "default".to_string(),
        TlsOptions {
            min_version: "VersionTLS12".into(),
        },
    );

    DynamicConfig {
        tls: TlsConfig {
            options,
            certificates: vec![TlsCertificate {
                cert_file: format!("/var/certs/{}", settings.certs.site_cert),
                key_file: format!("/var/certs/{}", settings.certs.site_key),
            }],
        },
    }
}

fn write_if_absent(path: &Path, contents: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    std::fs::write(path, contents).map_err(io_error(path))?;
    info!(path = %path.display(), "setup: proxy config written");
    Ok(true)
}

/// Write the proxy's static and dynamic config unless they already exist.
pub fn write_proxy_config(settings: &SiteSettings) -> Result<()> {
    let rendered = toml::to_string_pretty(&build_static_config())?;
    write_if_absent(&settings.traefik_static_config(), &rendered)?;

    let rendered = toml::to_string_pretty(&build_dynamic_config(settings))?;
    write_if_absent(&settings.traefik_dynamic_config(), &rendered)?;
    Ok(())
}
