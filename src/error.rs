use std::sync::Arc;

/// Result type used throughout the synchronizer.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while synchronizing caches or relaying telemetry.
///
/// None of these errors are fatal to the agent: a failing task logs the error and retries on its
/// next scheduled tick.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The central service (or the impression listener) could not be reached.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// The server answered with a non-success status code.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    /// The request was unauthorized, the API key is likely invalid.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Response body could not be decoded. Prior cache state is kept unchanged.
    #[error("malformed response: {0}")]
    MalformedResponse(Arc<serde_json::Error>),

    /// Storage backend is unreachable or failed the operation.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Invalid base URL configuration.
    #[error("invalid base url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// A task with the same name is already scheduled.
    #[error("task {0:?} is already scheduled")]
    DuplicateTask(String),

    /// A task thread panicked. This should normally never happen as every tick runs under
    /// `catch_unwind`.
    #[error("task thread panicked")]
    TaskPanicked,
}

impl Error {
    /// Whether retrying on the next tick may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Error::Unauthorized | Error::InvalidBaseUrl(_) | Error::InvalidConfiguration(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::MalformedResponse(Arc::new(value))
    }
}

impl From<redis::RedisError> for Error {
    fn from(value: redis::RedisError) -> Self {
        Error::StorageUnavailable(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn unauthorized_is_not_transient() {
        assert!(!Error::Unauthorized.is_transient());
        assert!(Error::StorageUnavailable("down".to_owned()).is_transient());
        assert!(Error::UnexpectedStatus(reqwest::StatusCode::BAD_GATEWAY).is_transient());
    }

    #[test]
    fn json_errors_are_malformed_responses() {
        let err = serde_json::from_str::<u32>("not a number").unwrap_err();
        assert!(matches!(Error::from(err), Error::MalformedResponse(_)));
    }
}
