use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docx_remote_core::{CredentialSource, RemoteError, RemoteRequest, RemoteResponse, RemoteTransport};
use reqwest::Client as HttpClient;
use tracing::{debug, instrument};

/// `RemoteTransport` over reqwest.
///
/// Paths are resolved against `base_url`. When a credential source is set,
/// every request carries `Authorization: Bearer <token>`.
pub struct HttpTransport {
    http_client: HttpClient,
    base_url: String,
    credentials: Option<Arc<dyn CredentialSource>>,
    scopes: Vec<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: None,
            scopes: Vec::new(),
        })
    }

    pub fn with_credentials(
        mut self,
        credentials: Arc<dyn CredentialSource>,
        scopes: Vec<String>,
    ) -> Self {
        self.credentials = Some(credentials);
        self.scopes = scopes;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path), level = "debug")]
    async fn call(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            RemoteError::Validation(format!("Invalid HTTP method: {}", request.method))
        })?;

        let mut builder = self.http_client.request(method, self.url(&request.path));
        if let Some(credentials) = &self.credentials {
            let token = credentials.token(&self.scopes).await?;
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout(format!("{} {}: {}", request.method, request.path, e))
            } else {
                RemoteError::Network(format!("{} {}: {}", request.method, request.path, e))
            }
        })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Network(format!("Failed to read response body: {}", e)))?
            .to_vec();

        debug!(
            "{} {} -> {} ({} bytes)",
            request.method,
            request.path,
            status,
            body.len()
        );
        Ok(RemoteResponse {
            status,
            headers,
            body,
        })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("has_credentials", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StaticCredentials;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_call_sends_bearer_and_returns_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wb/range"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v3\"")
                    .set_body_string("{}"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri(), Duration::from_secs(5))
            .unwrap()
            .with_credentials(Arc::new(StaticCredentials::new("secret")), Vec::new());
        let response = transport
            .call(RemoteRequest::new("GET", "/wb/range"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.etag().as_deref(), Some("\"v3\""));
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "4"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri(), Duration::from_secs(5)).unwrap();
        let response = transport
            .call(RemoteRequest::new("PATCH", "wb/range"))
            .await
            .unwrap();

        assert_eq!(response.status, 429);
        let err = response.error_for_status("wb").unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_connection_failure_is_network_error() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9", Duration::from_secs(5)).unwrap();
        let err = transport
            .call(RemoteRequest::new("GET", "wb"))
            .await
            .unwrap_err();
        assert!(err.is_fault());
    }
}
