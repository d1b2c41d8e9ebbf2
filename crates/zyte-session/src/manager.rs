//! Session Manager
//!
//! Owns every pool and drives the session lifecycle around API requests:
//! `assign` before a request is sent, `notify_result` once it completes.
//!
//! Pool state lives behind a `std::sync::Mutex` per pool that is never held
//! across an `.await`, so every check-and-update (capacity reservation,
//! eviction, hand-off to a waiter) is one indivisible step. Requests that
//! find a pool at capacity queue on a oneshot channel and are woken in
//! arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zyte_api::{ApiError, ApiResponse, Transport};

use crate::checker::{CheckOutcome, Checker, CheckerRegistry};
use crate::close::{CloseHandle, CloseReason};
use crate::config::{DefaultSessionConfig, SessionConfig, SessionConfigRegistry};
use crate::error::{Error, Result};
use crate::params;
use crate::pool::{Acquire, Pool, PoolSnapshot, PoolStatus};
use crate::request::Request;
use crate::settings::SessionSettings;
use crate::stats::{self, MemoryStats, Outcome, Phase, StatsSink};

type SharedPool = Arc<Mutex<Pool>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What `notify_result` decided about the session a request used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The request did not use a session.
    Unmanaged,
    /// The session passed its check and is available again.
    Passed,
    /// The session failed its check and was replaced. Retry the request.
    Expired,
    /// The request failed. `evicted` is set if the session hit its error
    /// budget and was replaced.
    Errored { evicted: bool },
}

enum InitOutcome {
    Ready(String),
    Bad,
    Unsupported,
    Abort(String),
}

/// A held `pending` slot. Released on drop unless fulfilled, so an abandoned
/// init never leaks pool capacity.
struct Reservation {
    pool: SharedPool,
    active: bool,
}

impl Reservation {
    fn new(pool: SharedPool) -> Self {
        Self { pool, active: true }
    }

    fn fulfil(mut self, id: &str, checkout: bool) {
        self.active = false;
        lock(&self.pool).add_session(id, checkout);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.active {
            lock(&self.pool).release_reservation();
        }
    }
}

/// A queued `assign` call. If the caller goes away after a session was
/// handed to it, the session goes back to the pool.
struct Waiting {
    rx: Option<oneshot::Receiver<Result<String>>>,
    pool: SharedPool,
}

impl Waiting {
    async fn recv(mut self) -> Result<String> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::Closed);
        };
        let received = rx.await;
        self.rx = None;
        received.unwrap_or(Err(Error::Closed))
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(Ok(id)) = rx.try_recv() {
                lock(&self.pool).check_in(&id);
            }
        }
    }
}

struct Inner {
    settings: Arc<SessionSettings>,
    configs: SessionConfigRegistry,
    transport: Arc<dyn Transport>,
    stats: Arc<dyn StatsSink>,
    close: CloseHandle,
    pools: Mutex<HashMap<String, SharedPool>>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

/// Per-domain session pools for one crawl. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn builder(
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            settings,
            transport,
            stats: None,
            close: None,
            checkers: CheckerRegistry::new(),
            checker: None,
            configs: Vec::new(),
        }
    }

    pub fn close_handle(&self) -> &CloseHandle {
        &self.inner.close
    }

    /// Whether `request` should get a session. Session init requests never do.
    pub fn is_enabled(&self, request: &Request) -> bool {
        !request.is_session_init() && params::resolve_enabled(request, &self.inner.settings)
    }

    /// Pool key of `request`: its pool override, else its config's pool.
    pub fn pool_key(&self, request: &Request) -> String {
        match &request.meta.pool {
            Some(pool) => pool.clone(),
            None => self.inner.configs.for_request(request).pool(request),
        }
    }

    /// Attach a session to `request` before it is sent.
    ///
    /// Returns `None` when sessions are disabled for the request. Otherwise
    /// reuses the least recently used idle session of the request's pool,
    /// initializes a new one if the pool has room, or waits for one to be
    /// released. Terminal pool conditions also request a crawl close.
    pub async fn assign(&self, request: &mut Request) -> Result<Option<String>> {
        if !self.is_enabled(request) {
            return Ok(None);
        }
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        request.detach_session();
        let key = self.pool_key(request);
        let config = Arc::clone(self.inner.configs.for_request(request));
        let pool = self.inner.pool(&key);

        let id = self
            .inner
            .checkout(&key, &pool, config.as_ref(), request)
            .await?;
        request.attach_session(&key, &id);
        debug!(pool = %key, session_id = %id, url = %request.url(), "session assigned");
        Ok(Some(id))
    }

    /// Account for the outcome of a request sent with `assign`.
    ///
    /// Must be called exactly once per assigned request. Errors are returned
    /// only for terminal conditions (unsupported location, checker abort);
    /// the crawl close has already been requested when they are.
    pub fn notify_result(
        &self,
        request: &Request,
        result: std::result::Result<&ApiResponse, &ApiError>,
    ) -> Result<Verdict> {
        if request.is_session_init() {
            return Ok(Verdict::Unmanaged);
        }
        let Some(assignment) = request.session.as_ref() else {
            return Ok(Verdict::Unmanaged);
        };
        let key = assignment.pool.as_str();
        let id = assignment.session_id.as_str();
        let pool = self.inner.pool(key);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.inner.record(key, Phase::Use, Outcome::Failed);
                let evicted = {
                    let mut pool = lock(&pool);
                    let errors = pool.record_use_error(id);
                    if errors >= pool.limits().max_errors {
                        pool.evict(id)
                    } else {
                        pool.check_in(id);
                        false
                    }
                };
                if evicted {
                    info!(pool = %key, session_id = %id, error = %err, "session evicted after errors");
                    self.inner.replace(key, &pool, request);
                } else {
                    debug!(pool = %key, session_id = %id, error = %err, "request failed");
                }
                return Ok(Verdict::Errored { evicted });
            }
        };

        let config = self.inner.configs.for_request(request);
        match config.check(request, response) {
            Ok(CheckOutcome::Pass) => {
                self.inner.record(key, Phase::Use, Outcome::CheckPassed);
                let mut pool = lock(&pool);
                pool.reset_errors(id);
                pool.check_in(id);
                Ok(Verdict::Passed)
            }
            Ok(CheckOutcome::Fail) => {
                self.inner.record(key, Phase::Use, Outcome::CheckFailed);
                if self.inner.settings.checker_warn_on_no_body && !response.has_body() {
                    warn!(
                        pool = %key,
                        url = %request.url(),
                        "session check failed on a response without httpResponseBody or \
                         browserHtml; set checker_warn_on_no_body = false if the checker \
                         does not inspect the body"
                    );
                }
                let evicted = lock(&pool).evict(id);
                if evicted {
                    info!(pool = %key, session_id = %id, "session expired");
                    self.inner.replace(key, &pool, request);
                }
                Ok(Verdict::Expired)
            }
            Ok(CheckOutcome::Unsupported) => {
                self.inner.record(key, Phase::Use, Outcome::CheckFailed);
                Err(self.inner.unsupported(key, &pool, Some(id)))
            }
            Err(abort) => {
                lock(&pool).check_in(id);
                error!(pool = %key, reason = %abort.reason, "session checker aborted the crawl");
                self.inner.close.close(CloseReason::from_reason(&abort.reason));
                Err(abort.into())
            }
        }
    }

    /// Return the session of an assigned request that was never sent.
    ///
    /// Use instead of `notify_result` when the request is skipped; nothing
    /// is recorded and the session's error count is unchanged.
    pub fn release(&self, request: &Request) {
        if request.is_session_init() {
            return;
        }
        let Some(assignment) = request.session.as_ref() else {
            return;
        };
        let pool = self.inner.pool(&assignment.pool);
        lock(&pool).check_in(&assignment.session_id);
        debug!(
            pool = %assignment.pool,
            session_id = %assignment.session_id,
            "session released unused"
        );
    }

    /// Stop accepting work. Waits up to `timeout` for replacement
    /// initializations still in flight, abandons the rest, and fails every
    /// queued `assign` with `Error::Closed`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                remaining = tasks.len(),
                "abandoning pending session initializations"
            );
            tasks.shutdown().await;
        }

        let pools: Vec<SharedPool> = lock(&self.inner.pools).values().cloned().collect();
        for pool in pools {
            lock(&pool).fail_waiters(Error::Closed);
        }
    }

    pub fn pool_snapshot(&self, key: &str) -> Option<PoolSnapshot> {
        let pool = lock(&self.inner.pools).get(key).cloned()?;
        let snapshot = lock(&pool).snapshot();
        Some(snapshot)
    }

    /// Snapshots of every pool, ordered by key.
    pub fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        let pools: Vec<SharedPool> = lock(&self.inner.pools).values().cloned().collect();
        let mut snapshots: Vec<PoolSnapshot> =
            pools.iter().map(|pool| lock(pool).snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Session pool health as JSON.
    ///
    /// Overall status is `healthy` when every pool is (or no pool exists
    /// yet), `unhealthy` when no pool is healthy or degraded, and `degraded`
    /// otherwise.
    pub fn health(&self) -> Value {
        let snapshots = self.pool_snapshots();
        let count = |status: PoolStatus| snapshots.iter().filter(|s| s.status == status).count();
        let healthy = count(PoolStatus::Healthy);
        let unhealthy = count(PoolStatus::Unhealthy);

        let status = if healthy == snapshots.len() {
            "healthy"
        } else if unhealthy == snapshots.len() {
            "unhealthy"
        } else {
            "degraded"
        };

        let pools: serde_json::Map<String, Value> = snapshots
            .iter()
            .map(|s| (s.key.clone(), s.to_json()))
            .collect();

        json!({
            "status": status,
            "pools_total": snapshots.len(),
            "pools_healthy": healthy,
            "pools_unhealthy": unhealthy,
            "pools": pools,
        })
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, pool: &str, phase: Phase, outcome: Outcome) {
        stats::record(self.stats.as_ref(), pool, phase, outcome);
    }

    fn pool(&self, key: &str) -> SharedPool {
        let mut pools = lock(&self.pools);
        let pool = pools.entry(key.to_string()).or_insert_with(|| {
            let limits = self.settings.limits_for(key);
            debug!(
                pool = %key,
                max_size = limits.max_size,
                max_bad_inits = limits.max_bad_inits,
                max_errors = limits.max_errors,
                "session pool created"
            );
            Arc::new(Mutex::new(Pool::new(key, limits)))
        });
        Arc::clone(pool)
    }

    /// Request a crawl close for a terminal error.
    fn escalate(&self, err: &Error) {
        if let Some(reason) = err.close_reason() {
            self.close.close(reason);
        }
    }

    /// Mark `key` as unable to set its location and close the crawl.
    fn unsupported(&self, key: &str, pool: &SharedPool, session: Option<&str>) -> Error {
        let err = Error::UnsupportedLocation(key.to_string());
        {
            let mut pool = lock(pool);
            if let Some(id) = session {
                pool.evict(id);
            }
            pool.mark_terminal(err.clone());
        }
        error!(pool = %key, "setLocation is not supported for this pool");
        self.escalate(&err);
        err
    }

    async fn checkout(
        &self,
        key: &str,
        pool: &SharedPool,
        config: &dyn SessionConfig,
        request: &Request,
    ) -> Result<String> {
        loop {
            let next = lock(pool).acquire();
            match next {
                Acquire::Ready(id) => return Ok(id),
                Acquire::Init => {
                    let reservation = Reservation::new(Arc::clone(pool));
                    match self
                        .initialize(key, pool, reservation, config, request, true)
                        .await
                    {
                        Ok(id) => return Ok(id),
                        // The pool decides on the next pass whether live
                        // sessions are worth waiting for.
                        Err(Error::TooManyBadInits(_)) => continue,
                        Err(err) => return Err(err),
                    }
                }
                Acquire::Wait(rx) => {
                    debug!(pool = %key, "waiting for a session");
                    let waiting = Waiting {
                        rx: Some(rx),
                        pool: Arc::clone(pool),
                    };
                    let result = waiting.recv().await;
                    if let Err(err) = &result {
                        self.escalate(err);
                    }
                    return result;
                }
                Acquire::Fail(err) => {
                    self.escalate(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Initialize sessions on `reservation` until one passes its check or
    /// the pool runs out of init budget.
    async fn initialize(
        &self,
        key: &str,
        pool: &SharedPool,
        reservation: Reservation,
        config: &dyn SessionConfig,
        source: &Request,
        checkout: bool,
    ) -> Result<String> {
        loop {
            match self.attempt_init(key, config, source).await {
                InitOutcome::Ready(id) => {
                    info!(pool = %key, session_id = %id, "session initialized");
                    reservation.fulfil(&id, checkout);
                    return Ok(id);
                }
                InitOutcome::Bad => {
                    let exhausted = lock(pool).record_bad_init();
                    if exhausted {
                        error!(pool = %key, "too many bad session initializations");
                        drop(reservation);
                        return Err(Error::TooManyBadInits(key.to_string()));
                    }
                }
                InitOutcome::Unsupported => {
                    drop(reservation);
                    return Err(self.unsupported(key, pool, None));
                }
                InitOutcome::Abort(reason) => {
                    drop(reservation);
                    error!(pool = %key, reason = %reason, "session checker aborted the crawl");
                    self.close.close(CloseReason::from_reason(&reason));
                    return Err(Error::CheckerAbort(reason));
                }
            }
        }
    }

    /// One initialization request and its check.
    async fn attempt_init(
        &self,
        key: &str,
        config: &dyn SessionConfig,
        source: &Request,
    ) -> InitOutcome {
        let (url, mut params) = params::split_init_url(config.params(source), source.url());
        let id = Uuid::new_v4().to_string();
        params.insert("session".into(), json!({ "id": id }));

        let init = match Request::session_init(&url, params) {
            Ok(init) => init,
            Err(err) => {
                warn!(pool = %key, error = %err, "session initialization failed");
                self.record(key, Phase::Init, Outcome::Failed);
                return InitOutcome::Bad;
            }
        };

        let response = match self.transport.execute(&init.api_body()).await {
            Ok(response) => response,
            Err(err) => {
                warn!(pool = %key, url = %url, error = %err, "session initialization failed");
                self.record(key, Phase::Init, Outcome::Failed);
                return InitOutcome::Bad;
            }
        };

        match config.check(&init, &response) {
            Ok(CheckOutcome::Pass) => {
                self.record(key, Phase::Init, Outcome::CheckPassed);
                let id = response.session_id().map(str::to_string).unwrap_or(id);
                InitOutcome::Ready(id)
            }
            Ok(CheckOutcome::Fail) => {
                warn!(pool = %key, url = %url, "session initialization check failed");
                self.record(key, Phase::Init, Outcome::CheckFailed);
                InitOutcome::Bad
            }
            Ok(CheckOutcome::Unsupported) => InitOutcome::Unsupported,
            Err(abort) => InitOutcome::Abort(abort.reason),
        }
    }

    /// Start a background initialization replacing an evicted session, if
    /// the pool has room and budget for one.
    fn replace(self: &Arc<Self>, key: &str, pool: &SharedPool, source: &Request) {
        if self.is_closed() {
            return;
        }
        if !lock(pool).try_reserve() {
            debug!(pool = %key, "no room to replace session");
            return;
        }
        let reservation = Reservation::new(Arc::clone(pool));
        let inner = Arc::clone(self);
        let pool = Arc::clone(pool);
        let key = key.to_string();
        let mut source = source.clone();
        source.detach_session();
        let config = Arc::clone(self.configs.for_request(&source));

        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(err) = inner
                .initialize(&key, &pool, reservation, config.as_ref(), &source, false)
                .await
            {
                debug!(pool = %key, error = %err, "replacement session not created");
            }
        });
    }
}

/// Builds a `SessionManager`.
pub struct SessionManagerBuilder {
    settings: SessionSettings,
    transport: Arc<dyn Transport>,
    stats: Option<Arc<dyn StatsSink>>,
    close: Option<CloseHandle>,
    checkers: CheckerRegistry,
    checker: Option<Arc<dyn Checker>>,
    configs: Vec<(String, Arc<dyn SessionConfig>)>,
}

impl SessionManagerBuilder {
    /// Where session stats go. Defaults to a private `MemoryStats`.
    pub fn stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Handle used to request a crawl close.
    pub fn close_handle(mut self, close: CloseHandle) -> Self {
        self.close = Some(close);
        self
    }

    /// Registry to look up `SessionSettings::checker` in.
    pub fn checker_registry(mut self, checkers: CheckerRegistry) -> Self {
        self.checkers = checkers;
        self
    }

    /// Use `checker` regardless of `SessionSettings::checker`.
    pub fn checker(mut self, checker: impl Checker + 'static) -> Self {
        self.checker = Some(Arc::new(checker));
        self
    }

    /// Use `config` for requests to `domain` and its subdomains.
    pub fn session_config(
        mut self,
        domain: impl Into<String>,
        config: Arc<dyn SessionConfig>,
    ) -> Self {
        self.configs.push((domain.into(), config));
        self
    }

    pub fn build(self) -> Result<SessionManager> {
        let settings = Arc::new(self.settings);
        let checker = match self.checker {
            Some(checker) => checker,
            None => self.checkers.resolve(&settings)?,
        };
        let default = DefaultSessionConfig::new(Arc::clone(&settings), checker);
        let mut configs = SessionConfigRegistry::new(Arc::new(default));
        for (domain, config) in self.configs {
            configs.register(domain, config);
        }

        Ok(SessionManager {
            inner: Arc::new(Inner {
                settings,
                configs,
                transport: self.transport,
                stats: self
                    .stats
                    .unwrap_or_else(|| Arc::new(MemoryStats::new())),
                close: self.close.unwrap_or_default(),
                pools: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }
}
