use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{VmctlError, VmctlResult};

/// Take an exclusive flock on `path` without waiting.
///
/// Fails with [`VmctlError::AlreadyRunning`] naming `owner` when another
/// process holds the lock. The returned guard holds the lock until dropped.
pub async fn try_acquire(path: PathBuf, owner: &str) -> VmctlResult<Flock<std::fs::File>> {
    let owner = owner.to_string();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| VmctlError::Config(format!("open lock {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_file, e)| {
            if e == Errno::EWOULDBLOCK {
                VmctlError::AlreadyRunning(owner)
            } else {
                VmctlError::Config(format!("flock {}: {e}", path.display()))
            }
        })
    })
    .await
    .map_err(|e| VmctlError::Config(format!("lock task: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gvproxy.lock");

        let guard = try_acquire(path.clone(), "gvproxy").await.unwrap();
        assert!(path.exists());
        drop(guard);
    }

    #[tokio::test]
    async fn held_lock_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gvproxy.lock");

        let _guard = try_acquire(path.clone(), "gvproxy").await.unwrap();
        let err = try_acquire(path, "gvproxy").await.unwrap_err();
        assert!(
            matches!(&err, VmctlError::AlreadyRunning(name) if name == "gvproxy"),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gvproxy.lock");

        drop(try_acquire(path.clone(), "gvproxy").await.unwrap());
        let _again = try_acquire(path, "gvproxy").await.unwrap();
    }

    #[tokio::test]
    async fn invalid_path_returns_error() {
        let path = PathBuf::from("/nonexistent/dir/gvproxy.lock");
        let err = try_acquire(path, "gvproxy").await.unwrap_err();
        assert!(matches!(err, VmctlError::Config(_)), "got: {err}");
    }
}
