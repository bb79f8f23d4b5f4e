#[derive(Debug, thiserror::Error)]
pub enum VmctlError {
    #[error(transparent)]
    Chain(#[from] chain::ChainError),

    #[error(transparent)]
    Daemon(#[from] daemon::DaemonError),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} is still running")]
    StillRunning(String),

    #[error("signal error: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VmctlResult<T> = Result<T, VmctlError>;
