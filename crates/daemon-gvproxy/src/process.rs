use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use daemon::{Daemon, DaemonError, Dependency, Result, Socket};
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::NetworkConfig;
use crate::deps::qemu_dependencies;
use crate::mac::{Instance, MacAddress};
use crate::network::VirtualNetwork;
use crate::resolv::{HostResolver, RESOLV_CONF};

/// Daemon name; also the stem of its socket, pid, lock and log files.
pub const NAME: &str = "gvproxy";

/// What a VM needs to attach to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub socket: Socket,
    pub mac_address: MacAddress,
}

/// The network daemon for one VM instance.
#[derive(Debug, Clone)]
pub struct GvproxyDaemon {
    instance: Arc<Instance>,
    debug: bool,
}

impl GvproxyDaemon {
    pub fn new(instance: Arc<Instance>) -> Self {
        Self {
            instance,
            debug: false,
        }
    }

    /// Log every guest frame at trace level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn socket(&self) -> Socket {
        self.instance.paths().socket(NAME)
    }

    pub fn info(&self) -> Info {
        Info {
            socket: self.socket(),
            mac_address: self.instance.mac_address(),
        }
    }
}

#[async_trait]
impl Daemon for GvproxyDaemon {
    fn name(&self) -> &str {
        NAME
    }

    async fn alive(&self) -> Result<()> {
        let socket = self.socket();
        if tokio::fs::try_exists(socket.path()).await.unwrap_or(false) {
            Ok(())
        } else {
            Err(DaemonError::NotAlive {
                name: NAME.to_string(),
                detail: format!("socket {socket} does not exist"),
            })
        }
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let resolver = HostResolver::load(Path::new(RESOLV_CONF)).await;
        let mut config = NetworkConfig::new(self.instance.mac_address(), resolver);
        config.debug = self.debug;
        run(&self.socket(), config, cancel).await
    }

    fn dependencies(&self) -> (Vec<Box<dyn Dependency>>, bool) {
        (qemu_dependencies(self.instance.paths()), false)
    }
}

/// Serve `config` on `socket` until cancelled or the guest disconnects.
///
/// A stale socket file is removed first; failing to remove it aborts before
/// binding. The socket file is removed again on the way out, whatever the
/// outcome. Cancellation yields `Ok(())`.
pub async fn run(socket: &Socket, config: NetworkConfig, cancel: CancellationToken) -> Result<()> {
    remove_socket(socket).await?;
    let network = VirtualNetwork::new(config)?;

    if let Some(parent) = socket.path().parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let listener = UnixListener::bind(socket.path())
        .map_err(|e| DaemonError::Socket(format!("listen on {socket}: {e}")))?;
    info!(socket = %socket.unix(), "listening");

    let (done_tx, done_rx) = oneshot::channel();
    let acceptor = tokio::spawn(async move {
        let _ = done_tx.send(serve(listener, network).await);
    });

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            info!("shutting down");
            Ok(())
        }
        outcome = done_rx => outcome.unwrap_or_else(|_| {
            Err(DaemonError::Socket("acceptor exited without a result".into()))
        }),
    };

    // Aborting drops the listener, which unblocks a pending accept.
    acceptor.abort();
    let _ = acceptor.await;

    if let Err(e) = &outcome {
        error!(error = %e, "gvproxy stopped");
    }
    let cleanup = remove_socket(socket).await;
    outcome.and(cleanup)
}

/// Accept exactly one guest and bridge it. The listener stays bound while
/// the guest is connected.
async fn serve(listener: UnixListener, network: VirtualNetwork) -> Result<()> {
    let (conn, _) = listener
        .accept()
        .await
        .map_err(|e| DaemonError::Socket(format!("accept: {e}")))?;
    network.accept_qemu(conn).await?;
    Ok(())
}

async fn remove_socket(socket: &Socket) -> Result<()> {
    match tokio::fs::remove_file(socket.path()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DaemonError::Socket(format!("remove {socket}: {e}"))),
    }
}
