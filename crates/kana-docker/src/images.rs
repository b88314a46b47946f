use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};

use crate::{Error, Result};

/// Persisted last-check timestamps per image reference.
///
/// Stored as a flat JSON object (`{"wordpress:php8.2": "2026-10-15T09:00:00Z"}`).
/// A log without a path lives only in memory.
#[derive(Debug, Default)]
pub struct ImageCheckLog {
    path: Option<PathBuf>,
    entries: BTreeMap<String, DateTime<Utc>>,
}

impl ImageCheckLog {
    /// Load the log at `path`. A missing file is an empty log.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(Error::ImageLog { path, source }),
        };
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn last_checked(&self, reference: &str) -> Option<DateTime<Utc>> {
        self.entries.get(reference).copied()
    }

    /// Whether `reference` is due for an update check. `max_days == 0`
    /// disables checks entirely, and an interval reaching past the
    /// representable range never expires.
    pub fn is_stale(&self, reference: &str, max_days: u32, now: DateTime<Utc>) -> bool {
        if max_days == 0 {
            return false;
        }
        let Some(last) = self.last_checked(reference) else {
            return true;
        };
        match Duration::try_days(i64::from(max_days)).and_then(|d| now.checked_sub_signed(d)) {
            Some(cutoff) => last < cutoff,
            None => false,
        }
    }

    /// Record a successful check of `reference` and persist the log.
    pub fn record(&mut self, reference: &str, at: DateTime<Utc>) -> Result<()> {
        self.entries.insert(reference.to_string(), at);
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| Error::ImageLog {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(&self.entries)?;
        std::fs::write(path, json).map_err(io_err)
    }
}
