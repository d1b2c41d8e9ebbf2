//! Transport seam and response type
//!
//! The `Transport` trait is the only way the rest of the workspace reaches the
//! API. It uses `Pin<Box<dyn Future>>` return types so it stays dyn-compatible
//! (`Arc<dyn Transport>`).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use crate::actions::find_action;
use crate::error::Result;

/// A successful API answer.
///
/// `status` is the status code of the target page as reported by the API
/// (`statusCode`), not the status of the API call itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub url: String,
    pub raw: Value,
}

impl ApiResponse {
    /// Build a response from the decoded API body.
    pub fn from_raw(raw: Value) -> Self {
        let status = raw
            .get("statusCode")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(200);
        let url = raw
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self { status, url, raw }
    }

    /// Session ID echoed back by the API, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.raw.get("session")?.get("id")?.as_str()
    }

    /// Whether the answer carries a page body (HTTP or browser-rendered).
    pub fn has_body(&self) -> bool {
        self.raw.get("httpResponseBody").is_some() || self.raw.get("browserHtml").is_some()
    }

    /// First reported result of the action named `name`.
    pub fn action(&self, name: &str) -> Option<&Value> {
        find_action(&self.raw, name)
    }
}

/// Abstraction over how API calls are executed.
///
/// `request` is the full JSON request body, `url` included.
pub trait Transport: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>>;
}

/// Transport answering from a closure.
///
/// Counts calls so callers can assert how many API requests were made.
pub struct FnTransport<F> {
    handler: F,
    calls: AtomicUsize,
}

impl<F> FnTransport<F> {
    pub fn new<Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ApiResponse>> + Send + 'static,
    {
        Self {
            handler,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of API calls executed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ApiResponse>> + Send + 'static,
{
    fn execute<'a>(
        &'a self,
        request: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Box::pin((self.handler)(request.clone()))
    }
}
