use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::{Error, Result};

/// Where the root key and certificate live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootFiles {
    pub dir: PathBuf,
    pub cert_name: String,
    pub key_name: String,
}

impl RootFiles {
    pub fn new(dir: impl Into<PathBuf>, cert_name: impl Into<String>, key_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            cert_name: cert_name.into(),
            key_name: key_name.into(),
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(&self.cert_name)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(&self.key_name)
    }

    /// Guards creation of the pair across processes.
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.key_name))
    }
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Create `path` exclusively with owner-only permissions and write
/// `contents`. Fails with `AlreadyExists` if the file is there.
pub(crate) fn write_exclusive(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Block until the exclusive lock on `path` is ours. The lock is released
/// when the returned file is dropped.
pub(crate) fn lock_exclusive(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(io_error(path))?;
    FileExt::lock_exclusive(&file).map_err(io_error(path))?;
    Ok(file)
}

pub(crate) fn read_to_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(io_error(path))
}
