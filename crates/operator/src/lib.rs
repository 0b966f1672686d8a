pub mod config;
pub mod controllers;
pub mod crd;
pub mod engine;
pub mod events;
pub mod kubernetes;
pub mod metrics;
pub mod server;
pub mod template;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unsupported job kind: {0}")]
    UnsupportedKind(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors worth retrying with backoff. Validation and startup errors are
    /// not: they need a user edit or a restart to clear.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kubernetes(_) | Error::Conflict(_) | Error::Io(_) | Error::Internal(_) => true,
            Error::Validation(_)
            | Error::UnsupportedKind(_)
            | Error::Config(_)
            | Error::SerdeJson(_) => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kubernetes(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
