use std::path::{Path, PathBuf};

use async_trait::async_trait;
use daemon::{DaemonError, DaemonPaths, Dependency, Privilege, Symlink};

/// Symlinks putting the host's qemu into the instance directory.
///
/// Binaries are located on `PATH`. A binary that cannot be found still
/// yields a dependency, one whose install reports what is missing.
pub fn qemu_dependencies(paths: &DaemonPaths) -> Vec<Box<dyn Dependency>> {
    let system = format!("qemu-system-{}", std::env::consts::ARCH);
    let mut deps: Vec<Box<dyn Dependency>> = Vec::new();
    let mut share: Option<PathBuf> = None;

    for binary in ["qemu-img", system.as_str()] {
        let target = paths.bin_dir().join(binary);
        match which::which(binary) {
            Ok(source) => {
                if share.is_none() {
                    share = share_dir(&source);
                }
                deps.push(Box::new(Symlink {
                    source,
                    target,
                    privilege: Privilege::User,
                }));
            }
            Err(e) => deps.push(Box::new(Missing {
                binary: binary.to_string(),
                target,
                reason: e.to_string(),
            })),
        }
    }

    if let Some(source) = share {
        deps.push(Box::new(Symlink {
            source,
            target: paths.share_dir().join("qemu"),
            privilege: Privilege::User,
        }));
    }

    deps
}

/// `<prefix>/share/qemu` for a binary at `<prefix>/bin/<name>`.
fn share_dir(binary: &Path) -> Option<PathBuf> {
    let resolved = std::fs::canonicalize(binary).unwrap_or_else(|_| binary.to_path_buf());
    let prefix = resolved.parent()?.parent()?;
    Some(prefix.join("share").join("qemu"))
}

/// A qemu binary that is not installed on the host.
struct Missing {
    binary: String,
    target: PathBuf,
    reason: String,
}

#[async_trait]
impl Dependency for Missing {
    fn name(&self) -> String {
        format!("symlink {} -> {}", self.target.display(), self.binary)
    }

    async fn installed(&self) -> bool {
        tokio::fs::try_exists(&self.target).await.unwrap_or(false)
    }

    async fn install(&self) -> daemon::Result<()> {
        Err(DaemonError::NotFound(format!(
            "{} ({}); is qemu installed?",
            self.binary, self.reason
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_dir_is_beside_bin() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("qemu-img"), b"").unwrap();
        let share = share_dir(&bin.join("qemu-img")).unwrap();
        assert_eq!(
            share,
            std::fs::canonicalize(dir.path()).unwrap().join("share").join("qemu")
        );
    }

    #[test]
    fn dependencies_target_instance_dirs() {
        let paths = DaemonPaths::new(PathBuf::from("/i"));
        let deps = qemu_dependencies(&paths);
        assert!(deps.len() >= 2);
        let names: Vec<_> = deps.iter().map(|d| d.name()).collect();
        assert!(names[0].starts_with("symlink /i/qemu/bin/qemu-img"), "{names:?}");
        assert!(
            names[1].starts_with(&format!(
                "symlink /i/qemu/bin/qemu-system-{}",
                std::env::consts::ARCH
            )),
            "{names:?}"
        );
    }

    #[tokio::test]
    async fn missing_binary_install_fails() {
        let dep = Missing {
            binary: "qemu-img".into(),
            target: PathBuf::from("/nonexistent/qemu/bin/qemu-img"),
            reason: "cannot find binary path".into(),
        };
        assert!(!dep.installed().await);
        let err = daemon::resolve(&[Box::new(dep)]).await.unwrap_err();
        assert!(err.to_string().contains("is qemu installed?"), "got: {err}");
    }
}
