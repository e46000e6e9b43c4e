use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to start kernel worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid kernel message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("kernel worker exited")]
    WorkerExited,

    #[error("kernel worker did not expose {0}")]
    MissingPipe(&'static str),

    #[error("kernel worker error: {0}")]
    Worker(String),
}
