//! Durable node identity: one uuid generated on first start and reused after.

use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("cannot read identity file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write identity file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identity file {0} is empty or malformed")]
    Malformed(PathBuf),
}

/// Returns the uuid stored at `path`, creating it (mode 0600) if absent.
pub fn load_or_create(path: &Path) -> Result<String, IdentityError> {
    if path.exists() {
        let raw = fs::read_to_string(path).map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let uuid = raw.trim();
        if uuid.is_empty() || uuid.chars().any(char::is_whitespace) {
            return Err(IdentityError::Malformed(path.to_path_buf()));
        }
        return Ok(uuid.to_string());
    }

    let uuid = uuid::Uuid::new_v4().to_string();
    let write_err = |source| IdentityError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).map_err(write_err)?;
    file.write_all(uuid.as_bytes()).map_err(write_err)?;

    info!(uuid = %uuid, path = %path.display(), "generated node identity");
    Ok(uuid)
}
