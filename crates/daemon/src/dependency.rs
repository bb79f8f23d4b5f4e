use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::command::{Privilege, exec};
use crate::error::{DaemonError, Result};

/// Pre-state a daemon needs before it can start.
///
/// `install` must be idempotent; the resolver may call it on every start.
#[async_trait]
pub trait Dependency: Send + Sync {
    /// Human-readable identity, reported when resolution fails.
    fn name(&self) -> String;
    async fn installed(&self) -> bool;
    async fn install(&self) -> Result<()>;
}

/// Ensure every dependency is present, installing the missing ones in order.
///
/// Already-satisfied dependencies are skipped. The first failure aborts
/// resolution and names the dependency that failed.
pub async fn resolve(deps: &[Box<dyn Dependency>]) -> Result<()> {
    for dep in deps {
        let name = dep.name();
        if dep.installed().await {
            debug!(dependency = %name, "dependency satisfied");
            continue;
        }

        info!(dependency = %name, "installing dependency");
        let wrap = |source: DaemonError| DaemonError::Dependency {
            name: name.clone(),
            source: Box::new(source),
        };
        dep.install().await.map_err(wrap)?;

        if !dep.installed().await {
            return Err(wrap(DaemonError::NotFound(format!(
                "{name} still missing after install"
            ))));
        }
    }
    Ok(())
}

/// A symlink at `target` pointing to `source`.
#[derive(Debug, Clone)]
pub struct Symlink {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Privilege used to create the parent directory and the link.
    pub privilege: Privilege,
}

#[async_trait]
impl Dependency for Symlink {
    fn name(&self) -> String {
        format!(
            "symlink {} -> {}",
            self.target.display(),
            self.source.display()
        )
    }

    async fn installed(&self) -> bool {
        tokio::fs::read_link(&self.target)
            .await
            .is_ok_and(|dest| dest == self.source)
    }

    async fn install(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.source).await.unwrap_or(false) {
            return Err(DaemonError::NotFound(self.source.display().to_string()));
        }

        if let Some(parent) = self.target.parent() {
            let parent = parent.to_string_lossy();
            exec("mkdir", &["-p", &*parent], self.privilege).await?;
        }

        let source = self.source.to_string_lossy();
        let target = self.target.to_string_lossy();
        exec("ln", &["-sfn", &*source, &*target], self.privilege).await?;
        Ok(())
    }
}
