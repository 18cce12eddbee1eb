//! Handles to the source trees being analyzed.

use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// A directory on disk that we are analyzing from source.
///
/// Constructed either from an existing path or by cloning a git URL into a
/// temporary directory. The temporary directory lives as long as any clone
/// of this handle, so resolvers can hold on to the repository cheaply.
#[derive(Debug, Clone)]
pub struct SourceRepository {
    path: PathBuf,
    _temp: Option<Arc<TempDir>>,
}

impl SourceRepository {
    /// Wrap an existing directory.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _temp: None,
        }
    }

    /// Clone `git_url` into a temporary directory and wrap the checkout.
    ///
    /// Clones never prompt for credentials and never reuse pooled SSH
    /// connections, so a hung remote cannot stall the whole run.
    pub fn from_git(git_url: &str) -> Result<Self> {
        let temp = TempDir::new().map_err(|e| Error::io(std::env::temp_dir(), e))?;
        info!(url = git_url, "cloning repository");
        let status = Command::new("git")
            .arg("clone")
            .arg(git_url)
            .current_dir(temp.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_SSH_COMMAND", "ssh -oControlMaster=no -oBatchMode=yes")
            .status()
            .map_err(|e| Error::io(temp.path(), e))?;
        if !status.success() {
            return Err(Error::resolution(format!("error cloning {git_url}")));
        }
        let checkout = std::fs::read_dir(temp.path())
            .map_err(|e| Error::io(temp.path(), e))?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .find(|p| p.is_dir())
            .ok_or_else(|| Error::resolution(format!("error cloning {git_url}")))?;
        Ok(Self {
            path: checkout,
            _temp: Some(Arc::new(temp)),
        })
    }

    /// The repository's path on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for SourceRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_existing_path() {
        let repo = SourceRepository::from_path("/some/where");
        assert_eq!(repo.path(), Path::new("/some/where"));
        assert_eq!(repo.to_string(), "/some/where");
    }
}
