use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;

use crate::error::{Error, Result};

const OVERWRITE_ROUNDS: usize = 3;

/// Creates `path` and its parents with mode `0750`.
pub fn create_dirs(path: &Path, desc: &str) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(path)
        .map_err(|error| Error::os(format!("unable to create {} directory '{}': {}", desc, path.display(), error)))
}

/// Writes `content` to a file only its owner can read, replacing previous content.
pub fn write_file_0600(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Appends `content` to a log file, creating it with mode `0640`.
pub fn append_file_0640(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).mode(0o640).open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Overwrites `path` with random data a few times, then removes it. Missing files are ignored.
pub fn overwrite_and_delete(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Ok(());
    }
    for _ in 0..OVERWRITE_ROUNDS {
        let noise: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(50)
            .map(char::from)
            .collect();
        write_file_0600(path, &noise)?;
    }
    fs::remove_file(path)?;
    Ok(())
}

/// Secret material written for a single run.
///
/// Every file is shredded by [`SecretFiles::cleanup`], and again on drop
/// for any file a failed cleanup left behind.
#[derive(Debug, Default)]
pub struct SecretFiles {
    files: Vec<PathBuf>,
}

impl SecretFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, path: PathBuf, content: &str) -> Result<()> {
        self.files.push(path.clone());
        write_file_0600(&path, content)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn cleanup(&mut self) {
        let mut remaining: Vec<PathBuf> = Vec::new();
        for path in self.files.drain(..) {
            if let Err(error) = overwrite_and_delete(&path) {
                warn!("unable to remove secret file '{}': {}", path.display(), error);
                remaining.push(path);
            }
        }
        self.files = remaining;
    }
}

impl Drop for SecretFiles {
    fn drop(&mut self) {
        if !self.files.is_empty() {
            self.cleanup();
        }
    }
}
