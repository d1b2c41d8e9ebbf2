//! Observability listener
//!
//! - GET /health: session pool health, 503 when every pool is unhealthy
//! - GET /metrics: Prometheus text exposition

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use zyte_session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub prometheus: PrometheusHandle,
    pub sessions: SessionManager,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.sessions.health();
    let status = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let close = state.sessions.close_handle();
    body["crawl"] = match close.reason() {
        Some(reason) => serde_json::json!({"state": "closing", "reason": reason.as_str()}),
        None => serde_json::json!({"state": "running", "reason": Value::Null}),
    };

    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use zyte_session::{CloseReason, Request as CrawlRequest, SessionSettings};

    use crate::metrics::isolated_recorder;
    use crate::mock_api;

    fn enabled() -> SessionSettings {
        SessionSettings {
            enabled: Some(true),
            ..SessionSettings::default()
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_without_pools_is_healthy() {
        let (_recorder, prometheus) = isolated_recorder();
        let sessions = SessionManager::builder(enabled(), mock_api::transport())
            .build()
            .unwrap();
        let app = build_router(AppState { prometheus, sessions });

        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["pools_total"], 0);
        assert_eq!(body["crawl"]["state"], "running");
    }

    #[tokio::test]
    async fn health_reports_live_pool_and_close_reason() {
        let (_recorder, prometheus) = isolated_recorder();
        let sessions = SessionManager::builder(enabled(), mock_api::transport())
            .build()
            .unwrap();
        let mut request = CrawlRequest::new("https://example.com/").unwrap();
        sessions.assign(&mut request).await.unwrap();
        sessions.close_handle().close(CloseReason::Shutdown);

        let app = build_router(AppState {
            prometheus,
            sessions,
        });
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pools_total"], 1);
        assert_eq!(body["pools"]["example.com"]["sessions"], 1);
        assert_eq!(body["crawl"]["state"], "closing");
        assert_eq!(body["crawl"]["reason"], "shutdown");
    }

    #[tokio::test]
    async fn health_is_unavailable_when_every_pool_is_stuck() {
        let (_recorder, prometheus) = isolated_recorder();
        let settings = SessionSettings {
            max_bad_inits: 1,
            ..enabled()
        };
        let sessions = SessionManager::builder(settings, mock_api::transport())
            .build()
            .unwrap();
        let mut request = CrawlRequest::new("https://forbidden.example/").unwrap();
        assert!(sessions.assign(&mut request).await.is_err());

        let app = build_router(AppState { prometheus, sessions });
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["crawl"]["reason"], "bad_session_inits");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_text_format() {
        let (recorder, prometheus) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);
        metrics::counter!("zyte_api_requests_total", "outcome" => "success").increment(1);

        let sessions = SessionManager::builder(enabled(), mock_api::transport())
            .build()
            .unwrap();
        let app = build_router(AppState { prometheus, sessions });
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("zyte_api_requests_total"));
    }
}
