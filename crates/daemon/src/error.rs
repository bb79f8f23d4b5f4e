use crate::command::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("dependency {name}: {source}")]
    Dependency {
        name: String,
        #[source]
        source: Box<DaemonError>,
    },

    #[error("{name} is not alive: {detail}")]
    NotAlive { name: String, detail: String },

    #[error("{0} must be started as root")]
    RootRequired(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
