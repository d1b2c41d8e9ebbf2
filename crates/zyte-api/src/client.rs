//! reqwest-backed transport for the Zyte API
//!
//! POSTs the JSON request body to `<api_url>/extract` with HTTP basic auth
//! (API key as user name, empty password). Unsuccessful API statuses become
//! `ApiError::Request`; the message is taken from the problem-JSON `detail`
//! or `title` field when present.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::{ApiError, Result};
use crate::key::ApiKey;
use crate::transport::{ApiResponse, Transport};

/// Connection settings for `HttpTransport`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub api_key: ApiKey,
    pub timeout: Duration,
}

/// Transport that calls the real API over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: ApiKey,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Build a transport around an existing client (shared connection pool).
    pub fn with_client(client: reqwest::Client, config: ClientConfig) -> Self {
        let endpoint = format!("{}/extract", config.api_url.trim_end_matches('/'));
        Self {
            client,
            endpoint,
            api_key: config.api_key,
            timeout: config.timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip_all, fields(url = request.get("url").and_then(serde_json::Value::as_str).unwrap_or("")))]
    async fn send(&self, request: &Value) -> Result<ApiResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(self.api_key.expose(), Some(""))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            debug!(status = status.as_u16(), "API returned unsuccessful status");
            return Err(ApiError::Request {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let raw = response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(ApiResponse::from_raw(raw))
    }
}

impl Transport for HttpTransport {
    fn execute<'a>(
        &'a self,
        request: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        Box::pin(self.send(request))
    }
}

/// Extract a human-readable message from an error body.
fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| v.get("detail").or_else(|| v.get("title")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Start a mock API: echoes the request body back as the response, except
    /// for `https://forbidden.example` which gets a 451 problem document.
    async fn start_mock_api() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/extract",
                axum::routing::post(
                    |headers: HeaderMap, axum::Json(body): axum::Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        if body["url"] == "https://forbidden.example" {
                            return (
                                StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
                                axum::Json(json!({
                                    "type": "/download/domain-forbidden",
                                    "title": "Domain forbidden",
                                    "detail": "Extraction for the domain is forbidden.",
                                })),
                            )
                                .into_response();
                        }
                        axum::Json(json!({
                            "url": body["url"],
                            "statusCode": 200,
                            "httpResponseBody": "PGh0bWw+PC9odG1sPg==",
                            "session": body.get("session").cloned().unwrap_or(Value::Null),
                            "echoedAuthorization": auth,
                        }))
                        .into_response()
                    },
                ),
            );
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    fn transport_for(url: &str) -> HttpTransport {
        HttpTransport::new(ClientConfig {
            api_url: url.to_string(),
            api_key: ApiKey::new("test-key"),
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let transport = transport_for("https://api.zyte.com/v1/");
        assert_eq!(transport.endpoint(), "https://api.zyte.com/v1/extract");
    }

    #[test]
    fn error_message_prefers_detail_then_title_then_raw() {
        assert_eq!(error_message(r#"{"title":"t","detail":"d"}"#), "d");
        assert_eq!(error_message(r#"{"title":"t"}"#), "t");
        assert_eq!(error_message("plain text"), "plain text");
    }

    #[tokio::test]
    async fn successful_call_returns_response_and_sends_basic_auth() {
        let (url, _server) = start_mock_api().await;
        let transport = transport_for(&url);

        let resp = transport
            .execute(&json!({
                "url": "https://example.com",
                "httpResponseBody": true,
                "session": {"id": "s-1"},
            }))
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.url, "https://example.com");
        assert_eq!(resp.session_id(), Some("s-1"));
        assert!(resp.has_body());
        // "test-key:" base64-encoded
        assert_eq!(resp.raw["echoedAuthorization"], "Basic dGVzdC1rZXk6");
    }

    #[tokio::test]
    async fn unsuccessful_status_maps_to_request_error() {
        let (url, _server) = start_mock_api().await;
        let transport = transport_for(&url);

        let err = transport
            .execute(&json!({"url": "https://forbidden.example"}))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ApiError::Request {
                status: 451,
                message: "Extraction for the domain is forbidden.".into(),
            }
        );
    }

    #[tokio::test]
    async fn unreachable_api_maps_to_transport_error() {
        let transport = transport_for("http://127.0.0.1:1");
        let err = transport
            .execute(&json!({"url": "https://example.com"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)), "got: {err:?}");
    }
}
