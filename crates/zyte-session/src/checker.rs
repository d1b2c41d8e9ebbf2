//! Session checkers
//!
//! A checker looks at a finished API call and decides whether the session
//! that served it is still good. It runs after every session initialization
//! and after every response received through a session.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use zyte_api::{ApiResponse, SET_LOCATION, has_action};

use crate::close::CloseReason;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::settings::SessionSettings;

/// Verdict on a session after a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    Fail,
    /// The target does not support the requested location. Terminal for the
    /// pool; retrying cannot help.
    Unsupported,
}

impl From<bool> for CheckOutcome {
    fn from(passed: bool) -> Self {
        if passed {
            CheckOutcome::Pass
        } else {
            CheckOutcome::Fail
        }
    }
}

/// Signal from a checker that the whole crawl must stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerAbort {
    pub reason: String,
}

impl CheckerAbort {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for CheckerAbort {
    fn default() -> Self {
        Self::new(CloseReason::CheckerFailed.as_str())
    }
}

impl From<CheckerAbort> for Error {
    fn from(abort: CheckerAbort) -> Self {
        Error::CheckerAbort(abort.reason)
    }
}

pub type CheckResult = std::result::Result<CheckOutcome, CheckerAbort>;

/// Decides whether a session is still usable.
pub trait Checker: Send + Sync {
    fn check(&self, request: &Request, response: &ApiResponse) -> CheckResult;
}

/// Checker backed by a closure.
pub struct FnChecker<F>(F);

impl<F> FnChecker<F>
where
    F: Fn(&Request, &ApiResponse) -> CheckResult + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self(check)
    }
}

impl<F> Checker for FnChecker<F>
where
    F: Fn(&Request, &ApiResponse) -> CheckResult + Send + Sync,
{
    fn check(&self, request: &Request, response: &ApiResponse) -> CheckResult {
        (self.0)(request, response)
    }
}

const UNSUPPORTED_PREFIX: &str = "Action setLocation not supported on ";

/// Default checker.
///
/// Requests that ran a `setLocation` action pass only if the API reports that
/// action as successful. Everything else passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocationChecker;

impl Checker for LocationChecker {
    fn check(&self, request: &Request, response: &ApiResponse) -> CheckResult {
        if !has_action(&request.api_body(), SET_LOCATION) {
            return Ok(CheckOutcome::Pass);
        }
        let Some(result) = response.action(SET_LOCATION) else {
            debug!(url = %request.url(), "setLocation result missing from response");
            return Ok(CheckOutcome::Fail);
        };
        let error = result.get("error").and_then(Value::as_str).unwrap_or("");
        let status = result.get("status").and_then(Value::as_str).unwrap_or("");
        if error.starts_with(UNSUPPORTED_PREFIX) || status == "notSupported" {
            return Ok(CheckOutcome::Unsupported);
        }
        Ok(CheckOutcome::from(status == "success"))
    }
}

type CheckerBuilder = Box<dyn Fn(&SessionSettings) -> Arc<dyn Checker> + Send + Sync>;

/// Checkers selectable by name from `SessionSettings::checker`.
pub struct CheckerRegistry {
    instances: HashMap<String, Arc<dyn Checker>>,
    builders: HashMap<String, CheckerBuilder>,
}

pub const DEFAULT_CHECKER: &str = "default";

impl CheckerRegistry {
    /// Registry containing only `default` (the location checker).
    pub fn new() -> Self {
        let mut registry = Self {
            instances: HashMap::new(),
            builders: HashMap::new(),
        };
        registry.register(DEFAULT_CHECKER, LocationChecker);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, checker: impl Checker + 'static) {
        let name = name.into();
        self.builders.remove(&name);
        self.instances.insert(name, Arc::new(checker));
    }

    /// Register a checker constructed from the crawl settings at build time.
    pub fn register_builder<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&SessionSettings) -> Arc<dyn Checker> + Send + Sync + 'static,
    {
        let name = name.into();
        self.instances.remove(&name);
        self.builders.insert(name, Box::new(builder));
    }

    /// Resolve the checker named in `settings`, or `default` if none is.
    pub fn resolve(&self, settings: &SessionSettings) -> Result<Arc<dyn Checker>> {
        let name = settings.checker.as_deref().unwrap_or(DEFAULT_CHECKER);
        if let Some(checker) = self.instances.get(name) {
            return Ok(Arc::clone(checker));
        }
        match self.builders.get(name) {
            Some(build) => Ok(build(settings)),
            None => Err(Error::UnknownChecker(name.to_string())),
        }
    }
}

impl Default for CheckerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
