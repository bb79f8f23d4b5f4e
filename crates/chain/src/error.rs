/// Error type accepted from chain operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// An operation failed before any stage was entered.
    #[error(transparent)]
    Failed(BoxError),

    #[error("error at '{stage}': {source}")]
    AtStage {
        stage: String,
        #[source]
        source: BoxError,
    },
}

impl ChainError {
    /// The stage that was active when the operation failed, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Failed(_) => None,
            Self::AtStage { stage, .. } => Some(stage),
        }
    }

    /// The failing operation's own error, without stage context.
    pub fn into_inner(self) -> BoxError {
        match self {
            Self::Failed(source) | Self::AtStage { source, .. } => source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
