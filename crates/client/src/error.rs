use git::GitServiceError;
use services::services::{config::ConfigError, working_copy::WorkingCopyError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not a git repository: {path}")]
    NotARepository {
        path: String,
        #[source]
        source: GitServiceError,
    },

    #[error("Repository has no usable remote: {0}")]
    NoRemote(String),

    #[error(transparent)]
    Git(#[from] GitServiceError),

    #[error(transparent)]
    WorkingCopy(#[from] WorkingCopyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{failed} of {total} path(s) could not be changed")]
    TransitionsFailed { failed: usize, total: usize },

    #[error("Remote operation failed: {0}")]
    RemoteFailed(String),
}
