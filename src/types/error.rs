//! Error types for botpool
//!
//! Pattern adapted from the gateway error enum: string payloads, an HTTP
//! status mapping, and `From` conversions for the crates we talk to.

use hyper::StatusCode;

/// Main error type for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A write to the shared directory was not acknowledged
    #[error("Directory write failed: {0}")]
    DirectoryWrite(String),

    /// A read from the shared directory failed
    #[error("Directory error: {0}")]
    Directory(String),

    /// A directory record holds a value this server cannot decode
    #[error("Malformed directory record: {0}")]
    MalformedRecord(String),

    /// The backend store has no definition for this identity
    #[error("Bot definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(String),

    /// No answer within the configured wait
    #[error("Worker timed out: {0}")]
    WorkerTimeout(String),

    /// The worker went away without answering
    #[error("Worker crashed: {0}")]
    WorkerCrash(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::DirectoryWrite(_) | Self::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::MalformedRecord(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DefinitionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::WorkerSpawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::WorkerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::WorkerCrash(_) | Self::Protocol(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only store round-trips qualify; a missing definition is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DirectoryWrite(_) | Self::Directory(_) | Self::Backend(_)
        )
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = self.to_string();
        (status, body)
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("JSON error: {}", err))
    }
}

impl From<mongodb::error::Error> for PoolError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<hyper::Error> for PoolError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PoolError::DirectoryWrite("nak".into()).is_transient());
        assert!(PoolError::Directory("io".into()).is_transient());
        assert!(PoolError::Backend("down".into()).is_transient());
        assert!(!PoolError::DefinitionNotFound("b1".into()).is_transient());
        assert!(!PoolError::WorkerTimeout("b1".into()).is_transient());
        assert!(!PoolError::MalformedRecord("SERVER-a".into()).is_transient());
        assert!(!PoolError::Protocol("bot field".into()).is_transient());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PoolError::DefinitionNotFound("b1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PoolError::WorkerTimeout("b1".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        let (status, body) = PoolError::WorkerCrash("exit 1".into()).into_status_code_and_body();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body, "Worker crashed: exit 1");
    }
}
