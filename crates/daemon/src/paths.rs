use std::path::{Path, PathBuf};

use crate::socket::Socket;

/// Per-instance daemon paths derived from the instance directory.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    instance_dir: PathBuf,
}

impl DaemonPaths {
    pub fn new(instance_dir: PathBuf) -> Self {
        Self { instance_dir }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    /// Daemon run directory: `<instance>/daemon`.
    pub fn dir(&self) -> PathBuf {
        self.instance_dir.join("daemon")
    }

    /// Control socket: `<instance>/daemon/<name>.sock`.
    pub fn socket(&self, name: &str) -> Socket {
        Socket::from(self.dir().join(format!("{name}.sock")))
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.dir().join(format!("{name}.pid"))
    }

    pub fn lock_file(&self, name: &str) -> PathBuf {
        self.dir().join(format!("{name}.lock"))
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.dir().join(format!("{name}.log"))
    }

    /// Directory for binaries a daemon symlinks into place.
    pub fn bin_dir(&self) -> PathBuf {
        self.instance_dir.join("qemu").join("bin")
    }

    /// Directory for data files a daemon symlinks into place.
    pub fn share_dir(&self) -> PathBuf {
        self.instance_dir.join("qemu").join("share")
    }
}
