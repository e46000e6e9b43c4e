use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by an execution sandbox, dependency analyzer or summary
/// sink implementation.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Why a replay session was aborted.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("execution sandbox failed at cell {cell_id}: {source}")]
    Sandbox {
        cell_id: u64,
        #[source]
        source: CollabError,
    },

    #[error("dependency analyzer failed after cell {cell_id}: {source}")]
    Analyzer {
        cell_id: u64,
        #[source]
        source: CollabError,
    },

    #[error("prelude failed: {0}")]
    Prelude(#[source] CollabError),

    #[error("failed to persist summary: {0}")]
    Persist(#[source] CollabError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}
