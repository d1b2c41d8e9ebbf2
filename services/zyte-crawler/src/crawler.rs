//! Crawl loop
//!
//! Start requests are fetched with bounded concurrency. Retries go back on the
//! queue. Once a close is requested no new request is dispatched; in-flight
//! ones drain, then the session manager shuts down.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use zyte_api::Transport;
use zyte_session::{
    CloseHandle, CloseReason, MemoryStats, Request, SessionManager, SessionManagerBuilder,
    SessionSettings, StatsSink,
};

use crate::config::CrawlOptions;
use crate::downloader::{CountingTransport, CrawlRequest, Downloader, Fetch};

/// How long in-flight requests and session initializations get to finish
/// once the crawl is closing.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a finished crawl.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub reason: String,
    pub stats: BTreeMap<String, u64>,
}

pub struct Crawler {
    downloader: Arc<Downloader>,
    sessions: SessionManager,
    stats: Arc<MemoryStats>,
    close: CloseHandle,
    concurrency: usize,
}

impl Crawler {
    pub fn new(
        options: CrawlOptions,
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
    ) -> zyte_session::Result<Self> {
        Self::build(options, settings, transport, |builder| builder)
    }

    /// Like `new`, with a hook to register checkers or per-domain session
    /// configs on the session manager.
    pub fn build(
        options: CrawlOptions,
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
        customize: impl FnOnce(SessionManagerBuilder) -> SessionManagerBuilder,
    ) -> zyte_session::Result<Self> {
        let stats = Arc::new(MemoryStats::new());
        let close = CloseHandle::new();
        let transport = Arc::new(CountingTransport::new(
            transport,
            Arc::clone(&stats),
            close.clone(),
            options.max_requests,
        ));

        let builder = SessionManager::builder(settings, transport.clone())
            .stats(stats.clone())
            .close_handle(close.clone());
        let sessions = customize(builder).build()?;

        let downloader = Downloader::new(
            transport,
            sessions.clone(),
            Arc::clone(&stats),
            close.clone(),
            options.retry_times,
        );

        Ok(Self {
            downloader: Arc::new(downloader),
            sessions,
            stats,
            close,
            concurrency: options.concurrency.max(1),
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn close_handle(&self) -> &CloseHandle {
        &self.close
    }

    pub async fn run(&self, requests: Vec<Request>) -> CrawlReport {
        let mut queue: VecDeque<CrawlRequest> =
            requests.into_iter().map(CrawlRequest::start).collect();
        info!(
            start_requests = queue.len(),
            concurrency = self.concurrency,
            "crawl started"
        );
        self.downloader.set_start_requests(queue.len());

        let mut tasks = JoinSet::new();
        loop {
            if self.close.is_closing() {
                break;
            }
            while tasks.len() < self.concurrency {
                let Some(request) = queue.pop_front() else {
                    break;
                };
                let downloader = Arc::clone(&self.downloader);
                tasks.spawn(async move { downloader.fetch(request).await });
            }
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            self.handle(joined, &mut queue);
        }

        if !tasks.is_empty() {
            debug!(in_flight = tasks.len(), "draining in-flight requests");
        }
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(joined) = tasks.join_next().await {
                self.handle(joined, &mut queue);
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                remaining = tasks.len(),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, abandoning in-flight requests"
            );
            self.sessions.shutdown(Duration::ZERO).await;
            tasks.shutdown().await;
        }
        self.sessions.shutdown(DRAIN_TIMEOUT).await;

        let reason = self
            .close
            .reason()
            .unwrap_or(CloseReason::Finished)
            .as_str()
            .to_string();
        let report = CrawlReport {
            reason,
            stats: self.stats.snapshot(),
        };
        info!(
            reason = %report.reason,
            unscheduled = queue.len(),
            "crawl finished"
        );
        report
    }

    fn handle(&self, joined: Result<Fetch, JoinError>, queue: &mut VecDeque<CrawlRequest>) {
        match joined {
            Ok(Fetch::Response(response)) => {
                debug!(url = %response.url, status = response.status, "response received");
            }
            Ok(Fetch::Retry(request)) => queue.push_back(request),
            Ok(Fetch::Dropped) => {}
            Err(err) => {
                error!(error = %err, "request task failed");
                self.stats.inc_value("request_task_failed_count");
            }
        }
    }
}
