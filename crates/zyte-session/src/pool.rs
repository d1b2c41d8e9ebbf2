//! Pool state machine
//!
//! One `Pool` per pool key. It tracks live sessions, in-flight
//! initializations (`pending`), the consecutive bad-init count and the queue
//! of requests waiting for a session. All methods are synchronous; the
//! manager calls them under the pool's mutex so each call is one indivisible
//! step.
//!
//! Sessions are checked out exclusively: a session is either idle (in the
//! LRU queue) or serving exactly one request.
//!
//! Invariant: `sessions.len() + pending <= limits.max_size`.

use std::collections::{HashMap, VecDeque};

use serde_json::json;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::settings::PoolLimits;

/// Sender half of a queued `assign` call.
pub(crate) type Waiter = oneshot::Sender<Result<String>>;

#[derive(Debug)]
struct Session {
    error_count: usize,
    request_count: u64,
}

/// What an `assign` call should do next.
#[derive(Debug)]
pub(crate) enum Acquire {
    /// An idle session, now checked out to the caller.
    Ready(String),
    /// A slot was reserved; the caller must initialize a session.
    Init,
    /// Queued behind other requests.
    Wait(oneshot::Receiver<Result<String>>),
    Fail(Error),
}

/// Health of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl PoolStatus {
    pub fn label(self) -> &'static str {
        match self {
            PoolStatus::Healthy => "healthy",
            PoolStatus::Degraded => "degraded",
            PoolStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub key: String,
    pub sessions: usize,
    pub idle: usize,
    pub pending: usize,
    pub waiting: usize,
    pub bad_inits: usize,
    pub limits: PoolLimits,
    pub status: PoolStatus,
}

impl PoolSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "status": self.status.label(),
            "sessions": self.sessions,
            "idle": self.idle,
            "pending": self.pending,
            "waiting": self.waiting,
            "bad_inits": self.bad_inits,
            "max_size": self.limits.max_size,
            "max_bad_inits": self.limits.max_bad_inits,
        })
    }
}

#[derive(Debug)]
pub(crate) struct Pool {
    key: String,
    limits: PoolLimits,
    sessions: HashMap<String, Session>,
    idle: VecDeque<String>,
    pending: usize,
    bad_inits: usize,
    terminal: Option<Error>,
    waiters: VecDeque<Waiter>,
}

impl Pool {
    pub(crate) fn new(key: impl Into<String>, limits: PoolLimits) -> Self {
        Self {
            key: key.into(),
            limits,
            sessions: HashMap::new(),
            idle: VecDeque::new(),
            pending: 0,
            bad_inits: 0,
            terminal: None,
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn limits(&self) -> PoolLimits {
        self.limits
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.bad_inits >= self.limits.max_bad_inits
    }

    fn has_capacity(&self) -> bool {
        self.sessions.len() + self.pending < self.limits.max_size
    }

    /// Nothing in the pool can ever produce a session again.
    fn is_stuck(&self) -> bool {
        self.sessions.is_empty() && self.pending == 0 && self.exhausted()
    }

    fn stuck_error(&self) -> Error {
        self.terminal
            .clone()
            .unwrap_or_else(|| Error::TooManyBadInits(self.key.clone()))
    }

    pub(crate) fn acquire(&mut self) -> Acquire {
        if let Some(err) = &self.terminal {
            return Acquire::Fail(err.clone());
        }
        if let Some(id) = self.idle.pop_front() {
            self.checkout(&id);
            return Acquire::Ready(id);
        }
        if self.try_reserve() {
            return Acquire::Init;
        }
        if self.is_stuck() {
            return Acquire::Fail(self.stuck_error());
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(tx);
        Acquire::Wait(rx)
    }

    /// Reserve an init slot if capacity and budget allow.
    pub(crate) fn try_reserve(&mut self) -> bool {
        if self.terminal.is_some() || self.exhausted() || !self.has_capacity() {
            return false;
        }
        self.pending += 1;
        true
    }

    /// Give back a reservation whose init did not produce a session.
    pub(crate) fn release_reservation(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.fail_waiters_if_stuck();
    }

    /// Count a bad init. Returns `true` if the budget is now exhausted.
    pub(crate) fn record_bad_init(&mut self) -> bool {
        self.bad_inits += 1;
        self.exhausted()
    }

    /// Turn a reservation into a live session. With `checkout` the session
    /// goes straight to the caller, otherwise it is handed to the next waiter
    /// or parked as idle.
    pub(crate) fn add_session(&mut self, id: &str, checkout: bool) {
        self.pending = self.pending.saturating_sub(1);
        self.bad_inits = 0;
        self.sessions.insert(
            id.to_string(),
            Session {
                error_count: 0,
                request_count: 0,
            },
        );
        if checkout {
            self.checkout(id);
        } else {
            self.check_in(id);
        }
    }

    fn checkout(&mut self, id: &str) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.request_count += 1;
        }
    }

    /// Return a checked-out session. Evicted sessions are ignored.
    pub(crate) fn check_in(&mut self, id: &str) {
        if !self.sessions.contains_key(id) {
            return;
        }
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(Ok(id.to_string())).is_ok() {
                self.checkout(id);
                return;
            }
        }
        self.idle.push_back(id.to_string());
    }

    /// Increment and return the error count of a session.
    pub(crate) fn record_use_error(&mut self, id: &str) -> usize {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.error_count += 1;
                session.error_count
            }
            None => 0,
        }
    }

    pub(crate) fn reset_errors(&mut self, id: &str) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.error_count = 0;
        }
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub(crate) fn evict(&mut self, id: &str) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };
        self.idle.retain(|idle| idle != id);
        debug!(
            pool = %self.key,
            session_id = %id,
            requests = session.request_count,
            "session evicted"
        );
        self.fail_waiters_if_stuck();
        true
    }

    /// Stop serving this pool: current and future callers get `err`.
    pub(crate) fn mark_terminal(&mut self, err: Error) {
        self.terminal = Some(err.clone());
        self.fail_waiters(err);
    }

    pub(crate) fn fail_waiters(&mut self, err: Error) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn fail_waiters_if_stuck(&mut self) {
        if self.is_stuck() && !self.waiters.is_empty() {
            let err = self.stuck_error();
            self.fail_waiters(err);
        }
    }

    pub(crate) fn snapshot(&self) -> PoolSnapshot {
        let live = !self.sessions.is_empty();
        let status = if self.terminal.is_some() {
            PoolStatus::Unhealthy
        } else if live && !self.exhausted() {
            PoolStatus::Healthy
        } else if live || self.pending > 0 {
            PoolStatus::Degraded
        } else {
            PoolStatus::Unhealthy
        };
        PoolSnapshot {
            key: self.key.clone(),
            sessions: self.sessions.len(),
            idle: self.idle.len(),
            pending: self.pending,
            waiting: self.waiters.iter().filter(|w| !w.is_closed()).count(),
            bad_inits: self.bad_inits,
            limits: self.limits,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_size: usize, max_bad_inits: usize) -> Pool {
        Pool::new(
            "example.com",
            PoolLimits {
                max_size,
                max_bad_inits,
                max_errors: 1,
            },
        )
    }

    #[test]
    fn reserves_until_capacity_then_queues() {
        let mut pool = pool(2, 8);
        assert!(matches!(pool.acquire(), Acquire::Init));
        assert!(matches!(pool.acquire(), Acquire::Init));
        assert!(matches!(pool.acquire(), Acquire::Wait(_)));
        assert_eq!(pool.snapshot().pending, 2);
    }

    #[test]
    fn idle_sessions_are_reused_least_recently_used_first() {
        let mut pool = pool(3, 8);
        for id in ["a", "b", "c"] {
            assert!(pool.try_reserve());
            pool.add_session(id, false);
        }
        let Acquire::Ready(first) = pool.acquire() else {
            panic!("expected ready session");
        };
        assert_eq!(first, "a");
        pool.check_in(&first);

        let order: Vec<String> = (0..3)
            .map(|_| match pool.acquire() {
                Acquire::Ready(id) => id,
                other => panic!("expected ready session, got {other:?}"),
            })
            .collect();
        assert_eq!(order, ["b", "c", "a"]);
    }

    #[test]
    fn check_in_hands_session_to_first_waiter() {
        let mut pool = pool(1, 8);
        assert!(matches!(pool.acquire(), Acquire::Init));
        pool.add_session("a", true);

        let Acquire::Wait(mut first) = pool.acquire() else {
            panic!("expected wait");
        };
        let Acquire::Wait(mut second) = pool.acquire() else {
            panic!("expected wait");
        };

        pool.check_in("a");
        assert_eq!(first.try_recv().unwrap(), Ok("a".to_string()));
        assert!(second.try_recv().is_err());
        assert_eq!(pool.snapshot().idle, 0);
    }

    #[test]
    fn dropped_waiters_are_skipped() {
        let mut pool = pool(1, 8);
        assert!(pool.try_reserve());
        pool.add_session("a", true);
        let Acquire::Wait(gone) = pool.acquire() else {
            panic!("expected wait");
        };
        drop(gone);

        pool.check_in("a");
        assert_eq!(pool.snapshot().idle, 1);
    }

    #[test]
    fn exhausted_empty_pool_fails_and_notifies_waiters() {
        let mut pool = pool(2, 1);
        assert!(matches!(pool.acquire(), Acquire::Init));
        assert!(matches!(pool.acquire(), Acquire::Init));
        let Acquire::Wait(mut waiter) = pool.acquire() else {
            panic!("expected wait");
        };

        assert!(pool.record_bad_init());
        pool.release_reservation();
        // The second init is still in flight.
        assert!(waiter.try_recv().is_err());

        pool.release_reservation();
        assert_eq!(
            waiter.try_recv().unwrap(),
            Err(Error::TooManyBadInits("example.com".into()))
        );
        assert!(matches!(
            pool.acquire(),
            Acquire::Fail(Error::TooManyBadInits(_))
        ));
    }

    #[test]
    fn exhausted_pool_with_live_session_queues() {
        let mut pool = pool(2, 1);
        assert!(pool.try_reserve());
        pool.add_session("a", true);
        assert!(pool.try_reserve());
        pool.record_bad_init();
        pool.release_reservation();

        assert!(matches!(pool.acquire(), Acquire::Wait(_)));
        assert_eq!(pool.snapshot().status, PoolStatus::Degraded);
    }

    #[test]
    fn successful_init_resets_bad_inits() {
        let mut pool = pool(1, 3);
        assert!(pool.try_reserve());
        pool.record_bad_init();
        pool.record_bad_init();
        pool.add_session("a", false);
        assert_eq!(pool.snapshot().bad_inits, 0);
    }

    #[test]
    fn eviction_frees_capacity_and_ignores_late_check_in() {
        let mut pool = pool(1, 8);
        assert!(pool.try_reserve());
        pool.add_session("a", true);
        assert!(!pool.try_reserve());

        assert!(pool.evict("a"));
        assert!(!pool.evict("a"));
        pool.check_in("a");
        assert_eq!(pool.snapshot().idle, 0);
        assert!(pool.try_reserve());
    }

    #[test]
    fn error_counts_accumulate_until_reset() {
        let mut pool = pool(1, 8);
        assert!(pool.try_reserve());
        pool.add_session("a", true);
        assert_eq!(pool.record_use_error("a"), 1);
        assert_eq!(pool.record_use_error("a"), 2);
        pool.reset_errors("a");
        assert_eq!(pool.record_use_error("a"), 1);
        assert_eq!(pool.record_use_error("missing"), 0);
    }

    #[test]
    fn terminal_pool_rejects_everyone() {
        let mut pool = pool(1, 8);
        assert!(pool.try_reserve());
        let Acquire::Wait(mut waiter) = pool.acquire() else {
            panic!("expected wait");
        };
        pool.mark_terminal(Error::UnsupportedLocation("example.com".into()));
        assert_eq!(
            waiter.try_recv().unwrap(),
            Err(Error::UnsupportedLocation("example.com".into()))
        );
        assert!(matches!(
            pool.acquire(),
            Acquire::Fail(Error::UnsupportedLocation(_))
        ));
        assert_eq!(pool.snapshot().status, PoolStatus::Unhealthy);
    }

    #[test]
    fn health_status_labels() {
        let mut pool = pool(2, 8);
        assert_eq!(pool.snapshot().status, PoolStatus::Unhealthy);
        assert!(pool.try_reserve());
        assert_eq!(pool.snapshot().status, PoolStatus::Degraded);
        pool.add_session("a", false);
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.status, PoolStatus::Healthy);
        assert_eq!(snapshot.to_json()["status"], "healthy");
        assert_eq!(snapshot.to_json()["max_size"], 2);
    }
}
