use std::path::{Path, PathBuf};

use daemon::DaemonPaths;

use crate::error::{VmctlError, VmctlResult};

/// Directory name under `$HOME` used when no home is given.
const DEFAULT_HOME: &str = ".vmctl";

/// The vmctl home directory; one subdirectory per profile.
#[derive(Debug, Clone)]
pub struct HomePaths {
    home: PathBuf,
}

impl HomePaths {
    /// Use `home` if given, else `$HOME/.vmctl`.
    pub fn new(home: Option<PathBuf>) -> VmctlResult<Self> {
        let home = match home {
            Some(home) => home,
            None => std::env::var_os("HOME")
                .map(|h| PathBuf::from(h).join(DEFAULT_HOME))
                .ok_or_else(|| VmctlError::Config("HOME is not set; pass --home".into()))?,
        };
        Ok(Self { home })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Daemon paths for the instance named `profile`.
    pub fn instance(&self, profile: &str) -> VmctlResult<DaemonPaths> {
        if profile.is_empty() || profile.contains('/') || profile == "." || profile == ".." {
            return Err(VmctlError::Config(format!("invalid profile name {profile:?}")));
        }
        Ok(DaemonPaths::new(self.home.join(profile)))
    }
}
