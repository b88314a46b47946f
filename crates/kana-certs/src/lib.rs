//! Private certificate authority for Kana sites.
//!
//! One long-lived root (RSA-2048, self-signed, path length 0) is created on
//! first use and then only ever loaded. Leaf certificates for a site domain
//! are wildcards signed by that root.

mod authority;
mod files;

use std::path::PathBuf;

pub use authority::{Leaf, RootCa, load_or_create_root, load_root};
pub use files::RootFiles;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("root certificate {cert} does not match key {key}; remove both files to start over")]
    CorruptCertificateAuthority { cert: PathBuf, key: PathBuf },

    #[error("invalid RSA key: {0}")]
    Key(String),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("cannot parse certificate: {0}")]
    Parse(String),

    #[error("leaf certificate already exists: {0}")]
    LeafExists(PathBuf),

    #[error("certificate was not signed by this root: {0}")]
    Verify(String),
}

pub type Result<T> = std::result::Result<T, Error>;
