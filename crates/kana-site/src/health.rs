//! Bounded-retry reachability checks.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, StatusCode};
use tracing::{debug, info};

use crate::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often and how long to poll. No backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }

    /// Same retry count, no sleeping between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(1))
    }
}

/// Why a single probe attempt did not count as healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Status(u16),
    Transport(String),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "HTTP {code}"),
            Self::Transport(message) => f.write_str(message),
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    /// One attempt against `url`.
    async fn check(&self, url: &str) -> std::result::Result<(), ProbeFailure>;
}

/// GETs the URL trusting only the given root certificate.
pub struct HttpsProbe {
    client: reqwest::Client,
}

impl HttpsProbe {
    pub fn new(root_pem: &str) -> Result<Self> {
        let root = Certificate::from_pem(root_pem.as_bytes())?;
        let client = reqwest::Client::builder()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpsProbe {
    async fn check(&self, url: &str) -> std::result::Result<(), ProbeFailure> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeFailure::Transport(e.to_string()))?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            status => Err(ProbeFailure::Status(status.as_u16())),
        }
    }
}

/// Poll `url` until it answers 200, at most `policy.max_retries + 1` times.
pub async fn verify_reachable(probe: &dyn Probe, url: &str, policy: RetryPolicy) -> Result<()> {
    let attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let failure = match probe.check(url).await {
            Ok(()) => {
                info!(url, attempt, "health: site is reachable");
                return Ok(());
            }
            Err(failure) => failure,
        };

        debug!(url, attempt, failure = %failure, "health: site not ready");
        if attempt >= attempts {
            return Err(Error::VerificationTimeout {
                url: url.to_string(),
                attempts: attempt,
                last_failure: failure,
            });
        }
        tokio::time::sleep(policy.interval).await;
    }
}
