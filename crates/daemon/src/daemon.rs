use async_trait::async_trait;
use nix::unistd::geteuid;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dependency::{Dependency, resolve};
use crate::error::{DaemonError, Result};

/// A long-lived background process.
///
/// Concrete daemons are selected at composition time; the supervisor only
/// sees this contract.
#[async_trait]
pub trait Daemon: Send + Sync {
    // -- identity --
    /// Stable name used for process lookup and locking.
    fn name(&self) -> &str;

    // -- lifecycle --
    /// Liveness check. Must not have side effects.
    async fn alive(&self) -> Result<()>;
    /// Run the daemon until `cancel` fires or a fatal error occurs.
    ///
    /// Cancellation is the normal shutdown path and yields `Ok(())`.
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    // -- requirements --
    /// Pre-state required before `start`, and whether `start` itself needs root.
    fn dependencies(&self) -> (Vec<Box<dyn Dependency>>, bool);
}

/// Resolve `daemon`'s dependencies, then run it until cancelled.
///
/// A daemon that needs root is refused up front when this process is not
/// root. Dependency failures abort before `start` is attempted.
pub async fn start(daemon: &dyn Daemon, cancel: CancellationToken) -> Result<()> {
    start_as(daemon, cancel, geteuid().is_root()).await
}

async fn start_as(daemon: &dyn Daemon, cancel: CancellationToken, is_root: bool) -> Result<()> {
    let (deps, root_required) = daemon.dependencies();
    if root_required && !is_root {
        return Err(DaemonError::RootRequired(daemon.name().to_string()));
    }
    resolve(&deps).await?;
    info!(daemon = daemon.name(), root_required, "starting");
    daemon.start(cancel).await
}
