//! Downloader integration
//!
//! Every crawl request passes through, in order:
//!
//! 1. the max-requests cap,
//! 2. session assignment,
//! 3. the API call (counted and capped by `CountingTransport`),
//! 4. forbidden-domain accounting for start requests,
//! 5. session result handling and the retry policy.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use zyte_api::{ApiError, ApiResponse, Transport};
use zyte_session::{
    CloseHandle, CloseReason, MemoryStats, Request, SessionManager, StatsSink, Verdict,
};

use crate::metrics;

pub const PROCESSED_STAT: &str = "scrapy-zyte-api/processed";

const FORBIDDEN_STATUS: u16 = 451;

/// Wraps the real transport to count API calls, session inits included, and
/// to enforce the crawl-wide API request cap.
pub struct CountingTransport {
    inner: Arc<dyn Transport>,
    stats: Arc<MemoryStats>,
    close: CloseHandle,
    /// Completed plus in-flight calls.
    started: AtomicU64,
    /// 0 means no limit.
    max_requests: u64,
}

impl CountingTransport {
    pub fn new(
        inner: Arc<dyn Transport>,
        stats: Arc<MemoryStats>,
        close: CloseHandle,
        max_requests: u64,
    ) -> Self {
        if max_requests > 0 {
            info!(
                max_requests,
                "the crawl will close after this many API requests"
            );
        }
        Self {
            inner,
            stats,
            close,
            started: AtomicU64::new(0),
            max_requests,
        }
    }

    /// Completed plus in-flight API calls.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn limit_reached(&self) -> bool {
        self.max_requests > 0 && self.started() >= self.max_requests
    }

    /// Take one request slot. Fails, and requests a crawl close, once the
    /// cap is reached.
    fn reserve(&self) -> bool {
        let max = self.max_requests;
        let reserved = self
            .started
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            self.close.close(CloseReason::MaxRequests);
        }
        reserved
    }

    /// Send `request` unless the cap is reached, in which case nothing is
    /// sent and `None` is returned.
    pub async fn execute_capped(&self, request: &Value) -> Option<zyte_api::Result<ApiResponse>> {
        if !self.reserve() {
            return None;
        }
        let start = Instant::now();
        let result = self.inner.execute(request).await;
        self.stats.inc_value(PROCESSED_STAT);
        metrics::record_api_request(&result, start.elapsed().as_secs_f64());
        Some(result)
    }
}

impl Transport for CountingTransport {
    fn execute<'a>(
        &'a self,
        request: &'a Value,
    ) -> Pin<Box<dyn Future<Output = zyte_api::Result<ApiResponse>> + Send + 'a>> {
        Box::pin(async move {
            match self.execute_capped(request).await {
                Some(result) => result,
                None => Err(ApiError::Transport(format!(
                    "max API requests ({}) reached",
                    self.max_requests
                ))),
            }
        })
    }
}

/// Closes the crawl when every start request hit a forbidden domain.
#[derive(Debug, Default)]
pub struct ForbiddenDomains {
    state: Mutex<ForbiddenState>,
}

#[derive(Debug, Default)]
struct ForbiddenState {
    total: usize,
    failed: usize,
}

impl ForbiddenDomains {
    pub fn set_start_requests(&self, total: usize, close: &CloseHandle) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.total = total;
        Self::maybe_close(&state, close);
    }

    pub fn record_failure(&self, close: &CloseHandle) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.failed += 1;
        Self::maybe_close(&state, close);
    }

    fn maybe_close(state: &ForbiddenState, close: &CloseHandle) {
        if state.total == 0 || state.failed < state.total {
            return;
        }
        error!("all start requests point to a domain forbidden by the API, stopping");
        close.close(CloseReason::FailedForbiddenDomain);
    }
}

/// A request moving through the crawl.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub request: Request,
    pub is_start: bool,
    pub retry_times: u32,
}

impl CrawlRequest {
    pub fn start(request: Request) -> Self {
        Self {
            request,
            is_start: true,
            retry_times: 0,
        }
    }
}

/// What happened to a request.
#[derive(Debug)]
pub enum Fetch {
    Response(ApiResponse),
    Retry(CrawlRequest),
    Dropped,
}

pub struct Downloader {
    transport: Arc<CountingTransport>,
    sessions: SessionManager,
    stats: Arc<MemoryStats>,
    close: CloseHandle,
    forbidden: ForbiddenDomains,
    retry_times: u32,
}

impl Downloader {
    pub fn new(
        transport: Arc<CountingTransport>,
        sessions: SessionManager,
        stats: Arc<MemoryStats>,
        close: CloseHandle,
        retry_times: u32,
    ) -> Self {
        Self {
            transport,
            sessions,
            stats,
            close,
            forbidden: ForbiddenDomains::default(),
            retry_times,
        }
    }

    pub fn set_start_requests(&self, total: usize) {
        self.forbidden.set_start_requests(total, &self.close);
    }

    pub async fn fetch(&self, mut req: CrawlRequest) -> Fetch {
        if self.transport.limit_reached() {
            self.close.close(CloseReason::MaxRequests);
            info!(url = %req.request.url(), "skipping request, max API requests reached");
            return Fetch::Dropped;
        }

        if let Err(err) = self.sessions.assign(&mut req.request).await {
            warn!(url = %req.request.url(), error = %err, "no session available, dropping request");
            return Fetch::Dropped;
        }

        if !req.request.params.contains_key("httpResponseBody")
            && !req.request.params.contains_key("browserHtml")
        {
            req.request
                .params
                .insert("httpResponseBody".into(), Value::Bool(true));
        }

        let Some(result) = self.transport.execute_capped(&req.request.api_body()).await else {
            self.sessions.release(&req.request);
            info!(url = %req.request.url(), "skipping request, max API requests reached");
            return Fetch::Dropped;
        };

        if let Err(err) = &result {
            if req.is_start && err.status() == Some(FORBIDDEN_STATUS) {
                self.forbidden.record_failure(&self.close);
            }
        }

        let verdict = match self.sessions.notify_result(&req.request, result.as_ref()) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(url = %req.request.url(), error = %err, "dropping request");
                return Fetch::Dropped;
            }
        };

        match (verdict, result) {
            (Verdict::Expired, _) => self.retry(req, "session_expired"),
            (_, Err(err)) if err.status() == Some(FORBIDDEN_STATUS) => {
                warn!(
                    url = %req.request.url(),
                    error = %err,
                    "domain forbidden by the API, dropping request"
                );
                Fetch::Dropped
            }
            (_, Err(err)) => {
                debug!(url = %req.request.url(), error = %err, "API request failed");
                self.retry(req, "unsuccessful_response")
            }
            (_, Ok(response)) => {
                self.stats.inc_value("response_received_count");
                Fetch::Response(response)
            }
        }
    }

    fn retry(&self, mut req: CrawlRequest, reason: &str) -> Fetch {
        let attempt = req.retry_times + 1;
        if attempt > self.retry_times {
            self.stats.inc_value("retry/max_reached");
            error!(
                url = %req.request.url(),
                retries = req.retry_times,
                reason,
                "gave up retrying"
            );
            return Fetch::Dropped;
        }
        debug!(url = %req.request.url(), attempt, reason, "retrying");
        self.stats.inc_value("retry/count");
        self.stats.inc_value(&format!("retry/reason_count/{reason}"));
        req.retry_times = attempt;
        Fetch::Retry(req)
    }
}
