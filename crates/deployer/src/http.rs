//! Shared HTTP plumbing for the hosting targets.
//!
//! Every request has a client-level deadline and is raced against the
//! caller's cancellation token. Only idempotent reads (status, connection
//! tests) go through [`with_read_retry`]; uploads, hooks and triggers are
//! sent exactly once.

use crate::error::TransportError;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use sitedeploy_core::CancellationToken;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Largest response body kept as diagnostic text
pub const MAX_ERROR_BODY: usize = 8 * 1024;

/// Deadline for status reads and connection tests
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Build a client with a deadline covering connect, upload and response
pub fn client(timeout: Duration) -> Result<Client, TransportError> {
    let client = Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(15))
        .user_agent(concat!("sitedeploy/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Send a request unless the caller cancels first
pub async fn send(
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<Response, TransportError> {
    tokio::select! {
        response = request.send() => Ok(response?),
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
    }
}

/// Send and read the body; non-2xx responses become
/// [`TransportError::Status`] with the (bounded) body attached
pub async fn send_text(
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<String, TransportError> {
    let response = send(request, cancel).await?;
    let status = response.status();
    let body = tokio::select! {
        body = response.text() => body?,
        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
    };

    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            body: truncate(&body, MAX_ERROR_BODY),
        });
    }
    Ok(body)
}

/// Like [`send_text`], decoding the body as JSON
pub async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<T, TransportError> {
    let body = send_text(request, cancel).await?;
    serde_json::from_str(&body).map_err(|e| {
        TransportError::InvalidResponse(format!("{}: {}", e, truncate(&body, 512)))
    })
}

/// Retry an idempotent read up to twice on timeouts, connect errors,
/// 429 and 5xx responses
pub async fn with_read_retry<T, F, Fut>(what: &str, op: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    op.retry(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(250))
            .with_max_times(2),
    )
    .when(TransportError::is_retryable)
    .notify(|err: &TransportError, delay: Duration| {
        warn!(request = what, error = %err, retry_in_ms = delay.as_millis() as u64, "Retrying read");
    })
    .await
}

/// Cut `text` to at most `max` bytes on a char boundary
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… ({} bytes truncated)", &text[..end], text.len() - end)
}

/// Join an API base and a path without doubling slashes
pub fn endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("short", 10), "short");
        let text = "ééééé"; // 2 bytes each
        let cut = truncate(text, 3);
        assert!(cut.starts_with('é'));
        assert!(cut.contains("bytes truncated"));
    }

    #[test]
    fn test_endpoint_joins_cleanly() {
        assert_eq!(
            endpoint("https://api.netlify.com/api/v1/", "/sites/abc"),
            "https://api.netlify.com/api/v1/sites/abc"
        );
    }

    #[tokio::test]
    async fn test_send_text_captures_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad request body"))
            .mount(&server)
            .await;

        let client = client(Duration::from_secs(5)).unwrap();
        let err = send_text(client.get(endpoint(&server.uri(), "boom")), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            TransportError::Status { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "bad request body");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = client(Duration::from_secs(5)).unwrap();
        let err = send(client.get(server.uri()), &cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[tokio::test]
    async fn test_read_retry_retries_server_errors_only() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<(), TransportError> = with_read_retry("status", move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Status {
                status: 503,
                body: String::new(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<(), TransportError> = with_read_retry("status", move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Status {
                status: 401,
                body: String::new(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
