//! HTTP readiness polling.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Uri};
use http_body_util::Empty;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::Instant;

use crate::domain::error::DomainError;

/// Waits for an HTTP endpoint to answer.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Polls `url` with `method` every `interval` until it answers 2xx.
    ///
    /// # Errors
    /// `DeploymentTimeout` once `timeout` has elapsed without a 2xx answer;
    /// `Validation` for a malformed URL.
    async fn wait_until_available(
        &self,
        method: Method,
        url: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), DomainError>;
}

/// Plain HTTP/1 checker; connection errors and non-2xx answers are retried.
pub struct HttpReadinessChecker {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl Default for HttpReadinessChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpReadinessChecker {
    #[must_use]
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);
        Self { client }
    }

    async fn check_once(&self, method: &Method, uri: &Uri, budget: Duration) -> Result<u16, String> {
        let request = Request::builder()
            .method(method.clone())
            .uri(uri.clone())
            .body(Empty::<Bytes>::new())
            .map_err(|e| e.to_string())?;
        match tokio::time::timeout(budget, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response.status().as_u16()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("attempt timed out".to_owned()),
        }
    }
}

#[async_trait]
impl ReadinessCheck for HttpReadinessChecker {
    #[tracing::instrument(skip(self, method), fields(method = %method))]
    async fn wait_until_available(
        &self,
        method: Method,
        url: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), DomainError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| DomainError::validation(format!("invalid readiness url '{url}': {e}")))?;
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.check_once(&method, &uri, remaining.max(interval)).await {
                Ok(status) if (200..300).contains(&status) => {
                    tracing::debug!(url = %url, attempts, "endpoint available");
                    return Ok(());
                }
                Ok(status) => tracing::trace!(url = %url, status, "endpoint not ready"),
                Err(e) => tracing::trace!(url = %url, error = %e, "endpoint not reachable"),
            }
            if Instant::now() >= deadline {
                tracing::warn!(url = %url, attempts, "endpoint did not become available");
                return Err(DomainError::timeout(method.as_str(), url, timeout));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::Method;
    use httpmock::MockServer;

    #[tokio::test]
    async fn succeeds_on_first_2xx() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/api/v3.0/shells");
                then.status(200);
            })
            .await;

        HttpReadinessChecker::new()
            .wait_until_available(
                Method::GET,
                &server.url("/api/v3.0/shells"),
                Duration::from_secs(5),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_2xx_is_retried_until_timeout() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::OPTIONS).path("/run");
                then.status(503);
            })
            .await;

        let err = HttpReadinessChecker::new()
            .wait_until_available(
                Method::OPTIONS,
                &server.url("/run"),
                Duration::from_millis(300),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        match err {
            DomainError::DeploymentTimeout { method, url, .. } => {
                assert_eq!(method, "OPTIONS");
                assert!(url.ends_with("/run"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(mock.hits_async().await > 1);
    }

    #[tokio::test]
    async fn connection_refused_times_out() {
        let port = crate::infra::ports::allocate_port().unwrap();
        let err = HttpReadinessChecker::new()
            .wait_until_available(
                Method::GET,
                &format!("http://127.0.0.1:{port}/"),
                Duration::from_millis(200),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::DeploymentTimeout { .. }));
    }

    #[tokio::test]
    async fn malformed_url_is_rejected() {
        let err = HttpReadinessChecker::new()
            .wait_until_available(
                Method::GET,
                "http://bad host/",
                Duration::from_millis(10),
                Duration::from_millis(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
