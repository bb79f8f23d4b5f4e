use daemon::DaemonError;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    #[error("guest connection: {0}")]
    Io(#[from] std::io::Error),
}

impl From<NetworkError> for DaemonError {
    fn from(e: NetworkError) -> Self {
        DaemonError::Network(e.to_string())
    }
}
