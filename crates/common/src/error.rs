use thiserror::Error;

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("console web server error: {0}")]
    Serve(std::io::Error),

    #[error("console web server closed")]
    ServerClosed,

    #[error("console web server already started")]
    AlreadyStarted,

    #[error("operation cancelled")]
    Cancelled,

    #[error("bitcoin rpc error: {0}")]
    Rpc(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MempoolError {
    /// Returns `true` for errors that only signal a routine shutdown: the
    /// server was closed or the shared token was cancelled.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, MempoolError::ServerClosed | MempoolError::Cancelled)
    }
}

pub type MempoolResult<T> = Result<T, MempoolError>;
