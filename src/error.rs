//! Error types shared by the builders, the backends and the reconciliation layer.

use std::error::Error as StdError;

pub type Result<T, E = DeployError> = std::result::Result<T, E>;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Caller input violates an invariant.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// Requested minimums exceed what the host or cluster can provide.
    #[error("{0}")]
    InsufficientResources(String),

    /// The image policy rejected the container image.
    #[error("{0}")]
    Forbidden(String),

    /// Scheduler or container engine failure. Only `message` is displayed,
    /// the SDK error stays reachable through `source()`.
    #[error("{message}")]
    Backend {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DeployError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn backend<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Backend {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn backend_msg(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
            source: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Message plus the underlying cause, for operator logs.
    pub fn detail(&self) -> String {
        match self.source() {
            Some(cause) => format!("{self}: {cause}"),
            None => self.to_string(),
        }
    }
}

/// Classification of backend SDK errors by their HTTP-like status code.
pub(crate) fn is_status(code: Option<u16>, expected: u16) -> bool {
    code == Some(expected)
}

pub(crate) fn kube_status(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub(crate) fn docker_status(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

pub(crate) fn kube_not_found(err: &kube::Error) -> bool {
    is_status(kube_status(err), 404)
}

pub(crate) fn kube_conflict(err: &kube::Error) -> bool {
    is_status(kube_status(err), 409)
}

pub(crate) fn docker_not_found(err: &bollard::errors::Error) -> bool {
    is_status(docker_status(err), 404)
}

pub(crate) fn docker_conflict(err: &bollard::errors::Error) -> bool {
    is_status(docker_status(err), 409)
}
