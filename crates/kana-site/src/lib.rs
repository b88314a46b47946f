//! Per-site orchestration: proxy, containers, TLS material, health checks
//! and the WordPress bootstrap that follows a healthy start.

pub mod containers;
pub mod health;
pub mod proxy;
pub mod settings;
pub mod site;
pub mod tasks;

use std::path::PathBuf;

pub use health::{HttpsProbe, Probe, ProbeFailure, RetryPolicy, verify_reachable};
pub use settings::{Database, Multisite, SiteSettings, SiteType, detect_site_type};
pub use site::{RunState, Site};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Docker(#[from] kana_docker::Error),

    #[error(transparent)]
    Certs(#[from] kana_certs::Error),

    #[error("{url} not reachable after {attempts} attempts: {last_failure}")]
    VerificationTimeout {
        url: String,
        attempts: u32,
        last_failure: ProbeFailure,
    },

    #[error("{0} does not exist")]
    ResourceNotFound(PathBuf),

    #[error("{image} is not available; check that the requested version exists")]
    InvalidVersion { image: String },

    #[error("WordPress installation failed: {0}")]
    WordPressInstall(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("unexpected wp-cli output: {0}")]
    WpCliOutput(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn io_error(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}
