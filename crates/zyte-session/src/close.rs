//! Crawl-close signalling
//!
//! Terminal conditions anywhere in the crawl (session budget exhaustion,
//! checker aborts, forbidden domains, request caps) request a close through a
//! shared `CloseHandle`. The first reason wins; later requests are logged and
//! ignored. The crawl loop watches the handle and stops scheduling new work.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

/// Why a crawl stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Finished,
    BadSessionInits,
    CheckerFailed,
    UnsupportedSetLocation,
    FailedForbiddenDomain,
    MaxRequests,
    Shutdown,
    Custom(String),
}

impl CloseReason {
    pub fn as_str(&self) -> &str {
        match self {
            CloseReason::Finished => "finished",
            CloseReason::BadSessionInits => "bad_session_inits",
            CloseReason::CheckerFailed => "checker_failed",
            CloseReason::UnsupportedSetLocation => "unsupported_set_location",
            CloseReason::FailedForbiddenDomain => "failed-forbidden-domain",
            CloseReason::MaxRequests => "closespider_max_zapi_requests",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Custom(reason) => reason,
        }
    }

    /// Map a reason string onto a known variant, keeping unknown ones verbatim.
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "finished" => CloseReason::Finished,
            "bad_session_inits" => CloseReason::BadSessionInits,
            "checker_failed" => CloseReason::CheckerFailed,
            "unsupported_set_location" => CloseReason::UnsupportedSetLocation,
            "failed-forbidden-domain" => CloseReason::FailedForbiddenDomain,
            "closespider_max_zapi_requests" => CloseReason::MaxRequests,
            "shutdown" => CloseReason::Shutdown,
            other => CloseReason::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, cloneable handle for requesting and observing a crawl close.
#[derive(Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request a close. Returns `true` if this call set the reason.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            accepted = true;
            true
        });
        if accepted {
            warn!(reason = %reason, "crawl close requested");
        } else {
            debug!(reason = %reason, "crawl already closing, ignoring close request");
        }
        accepted
    }

    /// Reason requested so far, if any.
    pub fn reason(&self) -> Option<CloseReason> {
        self.tx.borrow().clone()
    }

    pub fn is_closing(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CloseReason>> {
        self.tx.subscribe()
    }
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}
