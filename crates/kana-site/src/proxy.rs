//! The shared Traefik container fronting every site.

use kana_docker::{ContainerSpec, Controller, PortSpec, Publish, ResourceId, Scope};
use tracing::info;

use crate::containers::NETWORK;
use crate::settings::SiteSettings;
use crate::{Error, Result};

pub const PROXY_CONTAINER: &str = "kana_traefik";

/// The router rules the sites use are Traefik v2 syntax.
pub const PROXY_IMAGE: &str = "traefik:2.11";

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

pub fn proxy_spec(settings: &SiteSettings) -> ContainerSpec {
    let path = |p: std::path::PathBuf| p.to_string_lossy().into_owned();

    ContainerSpec::builder(PROXY_CONTAINER, PROXY_IMAGE, Scope::Global)
        .hostname("kanatraefik")
        .network(NETWORK)
        .port(PortSpec::tcp(80))
        .port(PortSpec::tcp(443))
        .port(PortSpec::tcp(8080))
        .bind(path(settings.traefik_static_config()), "/etc/traefik/traefik.toml")
        .bind(path(settings.traefik_dynamic_config()), "/etc/traefik/dynamic.toml")
        .bind(path(settings.cert_dir()), "/var/certs")
        .bind(DOCKER_SOCKET, DOCKER_SOCKET)
        .build()
}

/// Start the proxy unless it is already running.
///
/// The Traefik config files are bind-mount sources only; a missing one is
/// [`Error::ResourceNotFound`].
pub async fn ensure_running(controller: &Controller, settings: &SiteSettings) -> Result<ResourceId> {
    for file in [settings.traefik_static_config(), settings.traefik_dynamic_config()] {
        if !file.is_file() {
            return Err(Error::ResourceNotFound(file));
        }
    }

    crate::site::ensure_image(controller, PROXY_IMAGE, settings.image_update_days).await?;
    let spec = proxy_spec(settings);
    Ok(controller.run_container(&spec, Publish::Declared).await?)
}

/// Stop the proxy and drop the shared network once no site container is
/// left. Returns whether anything was torn down.
pub async fn maybe_stop(controller: &Controller) -> Result<bool> {
    if !controller.list_by_site("").await?.is_empty() {
        return Ok(false);
    }

    let stopped = controller.stop_container(PROXY_CONTAINER).await?;
    let removed = controller.remove_network(NETWORK).await?;
    if stopped || removed {
        info!("proxy: no sites left, proxy and network removed");
    }
    Ok(stopped || removed)
}
