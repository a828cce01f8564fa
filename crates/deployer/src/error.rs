use sitedeploy_core::ProcessError;
use thiserror::Error;

/// Errors talking to a backend over HTTP or through a child process
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl TransportError {
    /// Transient failures worth retrying on idempotent reads
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_timeout() || e.is_connect(),
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Raw diagnostic text for a failure outcome: the response body when the
    /// backend sent one, the error itself otherwise
    pub fn diagnostic(&self) -> String {
        match self {
            TransportError::Status { body, .. } if !body.trim().is_empty() => body.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retry_classification() {
        let server_error = TransportError::Status {
            status: 503,
            body: "unavailable".into(),
        };
        assert!(server_error.is_retryable());

        let rate_limited = TransportError::Status {
            status: 429,
            body: String::new(),
        };
        assert!(rate_limited.is_retryable());

        let not_found = TransportError::Status {
            status: 404,
            body: "missing".into(),
        };
        assert!(!not_found.is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
    }

    #[test]
    fn test_diagnostic_prefers_body() {
        let err = TransportError::Status {
            status: 422,
            body: "{\"message\":\"bad zip\"}".into(),
        };
        assert_eq!(err.diagnostic(), "{\"message\":\"bad zip\"}");

        let err = TransportError::Status {
            status: 500,
            body: " ".into(),
        };
        assert_eq!(err.diagnostic(), "HTTP 500:  ");
    }
}
