//! HTTP fetcher with timeout, parse safety and fallback values.
//!
//! The fetcher never retries; callers (the cache, the poller) own retry
//! policy. Failures are classified only for diagnostics.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Url};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error, warn};

use crate::{FetchFailure, SyncError};

/// Result of a read that may have fallen back to substitute data.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    /// The backend produced the value.
    Fresh(T),
    /// The backend could not be used; `value` is the fallback.
    Fallback { value: T, cause: FetchFailure },
}

impl<T> FetchOutcome<T> {
    pub fn value(&self) -> &T {
        match self {
            Self::Fresh(value) | Self::Fallback { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Fresh(value) | Self::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        match self {
            Self::Fresh(value) => FetchOutcome::Fresh(f(value)),
            Self::Fallback { value, cause } => FetchOutcome::Fallback {
                value: f(value),
                cause,
            },
        }
    }
}

/// JSON-over-HTTP client for the backend data store.
///
/// Resources are addressed by path segments below the base URL; each
/// segment is percent-encoded, so record ids never change the path shape.
#[derive(Debug, Clone)]
pub struct Fetcher {
    http: Client,
    base_url: Url,
    timeout: Duration,
}

impl Fetcher {
    /// Create a fetcher rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .map_err(|e| SyncError::Config(format!("invalid base URL {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!("base URL {base_url} cannot hold paths")));
        }

        let http = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute URL of `segments` below the base URL.
    pub fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`: the base URL always accepts path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// GET `segments` and decode the body as `T`.
    pub async fn fetch<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, FetchFailure> {
        let url = self.url(segments);
        let request = self.http.get(url.clone());
        let result = match self.execute(request).await {
            Ok(bytes) => decode(&bytes),
            Err(failure) => Err(failure),
        };
        if let Err(ref failure) = result {
            log_failure("GET", url.path(), failure);
        }
        result
    }

    /// GET `segments`, resolving to `fallback` on any failure.
    pub async fn fetch_with_fallback<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        fallback: T,
    ) -> FetchOutcome<T> {
        match self.fetch(segments).await {
            Ok(value) => FetchOutcome::Fresh(value),
            Err(cause) => {
                debug!(?segments, kind = cause.kind(), "serving fallback value");
                FetchOutcome::Fallback {
                    value: fallback,
                    cause,
                }
            }
        }
    }

    /// Send a JSON body with `method` and decode the response as `R`.
    ///
    /// Used for writes; failures are returned, never replaced. A 2xx status
    /// means the backend stored the write, so an empty or undecodable body
    /// resolves to `None` rather than failing it.
    pub async fn send<B, R>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> Result<Option<R>, FetchFailure>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(segments);
        let request = self.http.request(method.clone(), url.clone()).json(body);
        let bytes = match self.execute(request).await {
            Ok(bytes) => bytes,
            Err(failure) => {
                log_failure(method.as_str(), url.path(), &failure);
                return Err(failure);
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            debug!(method = %method, path = url.path(), "write acknowledged without a body");
            return Ok(None);
        }
        match decode(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(failure) => {
                log_failure(method.as_str(), url.path(), &failure);
                Ok(None)
            }
        }
    }

    /// Run `request` under the timeout and return the body of a 2xx response.
    async fn execute(&self, request: RequestBuilder) -> Result<Vec<u8>, FetchFailure> {
        let work = async {
            let response = request.send().await?;
            let status = response.status();

            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("<failed to read response: {}>", e));
                return Err(FetchFailure::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = response.bytes().await?;
            Ok(bytes.to_vec())
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(FetchFailure::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FetchFailure> {
    serde_json::from_slice(bytes).map_err(|e| FetchFailure::Parse {
        message: e.to_string(),
    })
}

fn log_failure(method: &str, path: &str, failure: &FetchFailure) {
    match failure {
        FetchFailure::Network { message } => {
            warn!(method, path, error = %message, "backend unreachable");
        }
        FetchFailure::Timeout { after_ms } => {
            warn!(method, path, after_ms, "backend request timed out");
        }
        FetchFailure::Status { status, body } => {
            warn!(method, path, status, body = %body, "backend returned an error status");
        }
        FetchFailure::Parse { message } => {
            error!(method, path, error = %message, "backend response violates the record contract");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Counter {
        count: u32,
    }

    fn fetcher(uri: String) -> Fetcher {
        Fetcher::new(uri, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_url_joining() {
        let f = Fetcher::new("https://api.example.com/", Duration::from_secs(1)).unwrap();
        assert_eq!(f.url(&["chats"]).as_str(), "https://api.example.com/chats");
        assert_eq!(
            f.url(&["messages", "c1"]).as_str(),
            "https://api.example.com/messages/c1"
        );

        let nested = Fetcher::new("https://api.example.com/functions/v1", Duration::from_secs(1)).unwrap();
        assert_eq!(
            nested.url(&["chats"]).as_str(),
            "https://api.example.com/functions/v1/chats"
        );
    }

    #[test]
    fn test_segments_are_percent_encoded() {
        let f = Fetcher::new("https://api.example.com", Duration::from_secs(1)).unwrap();
        assert_eq!(
            f.url(&["messages", "a b/c?x#y"]).as_str(),
            "https://api.example.com/messages/a%20b%2Fc%3Fx%23y"
        );
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let err = Fetcher::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(Fetcher::new("mailto:ops@example.com", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/counter"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"count": 7})))
            .mount(&server)
            .await;

        let outcome = fetcher(server.uri())
            .fetch_with_fallback(&["counter"], Counter { count: 0 })
            .await;
        assert_eq!(outcome, FetchOutcome::Fresh(Counter { count: 7 }));
    }

    #[tokio::test]
    async fn test_non_2xx_falls_back_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/counter"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let outcome = fetcher(server.uri())
            .fetch_with_fallback(&["counter"], Counter { count: 0 })
            .await;

        assert_eq!(
            outcome,
            FetchOutcome::Fallback {
                value: Counter { count: 0 },
                cause: FetchFailure::Status {
                    status: 503,
                    body: "maintenance".to_string(),
                },
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_json_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/counter"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let outcome = fetcher(server.uri())
            .fetch_with_fallback(&["counter"], Counter { count: 1 })
            .await;

        assert!(outcome.is_fallback());
        assert_eq!(outcome.value(), &Counter { count: 1 });
        match outcome {
            FetchOutcome::Fallback { cause, .. } => assert_eq!(cause.kind(), "parse"),
            other => panic!("expected fallback, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_shape_is_parse_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/counter"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"total": 3})))
            .mount(&server)
            .await;

        let result = fetcher(server.uri()).fetch::<Counter>(&["counter"]).await;
        assert!(matches!(result, Err(FetchFailure::Parse { .. })));
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/counter"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"count": 9}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let f = Fetcher::new(server.uri(), Duration::from_millis(50)).unwrap();
        let outcome = f.fetch_with_fallback(&["counter"], Counter { count: 0 }).await;

        match outcome {
            FetchOutcome::Fallback { value, cause } => {
                assert_eq!(value, Counter { count: 0 });
                assert_eq!(cause, FetchFailure::Timeout { after_ms: 50 });
            }
            other => panic!("expected timeout fallback, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_is_network_failure() {
        // Nothing listens on port 9 of localhost in the test environment.
        let f = Fetcher::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let result = f.fetch::<Counter>(&["counter"]).await;
        assert!(result.unwrap_err().is_network());
    }

    #[tokio::test]
    async fn test_send_propagates_failure() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/counter"))
            .and(body_json(serde_json::json!({"count": 3})))
            .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
            .mount(&server)
            .await;

        let result: Result<Option<Counter>, _> = fetcher(server.uri())
            .send(Method::PATCH, &["counter"], &serde_json::json!({"count": 3}))
            .await;

        assert_eq!(
            result,
            Err(FetchFailure::Status {
                status: 409,
                body: "conflict".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_send_decodes_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/counter"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"count": 4})))
            .mount(&server)
            .await;

        let result: Result<Option<Counter>, _> = fetcher(server.uri())
            .send(Method::POST, &["counter"], &serde_json::json!({"count": 4}))
            .await;
        assert_eq!(result, Ok(Some(Counter { count: 4 })));
    }

    #[tokio::test]
    async fn test_send_accepts_acknowledgement_without_record() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/other"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let f = fetcher(server.uri());
        let body = serde_json::json!({"count": 1});

        let empty: Result<Option<Counter>, _> = f.send(Method::PATCH, &["empty"], &body).await;
        assert_eq!(empty, Ok(None));

        let other: Result<Option<Counter>, _> = f.send(Method::PATCH, &["other"], &body).await;
        assert_eq!(other, Ok(None));
    }

    #[tokio::test]
    async fn test_fetch_encodes_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/counter/a%2Fb"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"count": 2})))
            .mount(&server)
            .await;

        let value = fetcher(server.uri())
            .fetch::<Counter>(&["counter", "a/b"])
            .await
            .unwrap();
        assert_eq!(value, Counter { count: 2 });
    }
}
