//! Per-URL session configuration
//!
//! A `SessionConfig` decides, for a given request, which pool it belongs to,
//! how sessions for that pool are initialized, and how responses are checked.
//! Sites that need something other than the crawl-wide behavior register
//! their own config for their domains.

use std::sync::Arc;

use zyte_api::ApiResponse;

use crate::checker::{CheckResult, Checker};
use crate::params;
use crate::request::Request;
use crate::settings::{Location, Params, SessionSettings};

pub trait SessionConfig: Send + Sync {
    /// Pool key. Requests with the same key share sessions.
    fn pool(&self, request: &Request) -> String;

    /// Location to set on new sessions, if any.
    fn location(&self, request: &Request) -> Option<Location>;

    /// Session initialization parameters. A `url` key overrides the page the
    /// session is initialized on.
    fn params(&self, request: &Request) -> Params;

    fn check(&self, request: &Request, response: &ApiResponse) -> CheckResult;
}

/// Crawl-wide behavior driven by `SessionSettings`.
#[derive(Clone)]
pub struct DefaultSessionConfig {
    settings: Arc<SessionSettings>,
    checker: Arc<dyn Checker>,
}

impl DefaultSessionConfig {
    pub fn new(settings: Arc<SessionSettings>, checker: Arc<dyn Checker>) -> Self {
        Self { settings, checker }
    }
}

impl SessionConfig for DefaultSessionConfig {
    fn pool(&self, request: &Request) -> String {
        request.netloc()
    }

    fn location(&self, request: &Request) -> Option<Location> {
        params::resolve_location(request, &self.settings)
    }

    fn params(&self, request: &Request) -> Params {
        params::resolve_init_params(request, &self.settings, self.location(request))
    }

    fn check(&self, request: &Request, response: &ApiResponse) -> CheckResult {
        self.checker.check(request, response)
    }
}

/// Maps request hosts to session configs.
pub struct SessionConfigRegistry {
    default: Arc<dyn SessionConfig>,
    domains: Vec<(String, Arc<dyn SessionConfig>)>,
}

impl SessionConfigRegistry {
    pub fn new(default: Arc<dyn SessionConfig>) -> Self {
        Self {
            default,
            domains: Vec::new(),
        }
    }

    /// Use `config` for `domain` and its subdomains. Later registrations for
    /// the same domain replace earlier ones.
    pub fn register(&mut self, domain: impl Into<String>, config: Arc<dyn SessionConfig>) {
        let domain = domain.into().trim_start_matches('.').to_ascii_lowercase();
        self.domains.retain(|(existing, _)| *existing != domain);
        self.domains.push((domain, config));
    }

    /// Config whose domain is the longest suffix match of the request host.
    pub fn for_request(&self, request: &Request) -> &Arc<dyn SessionConfig> {
        let host = request.host();
        self.domains
            .iter()
            .filter(|(domain, _)| domain_matches(host, domain))
            .max_by_key(|(domain, _)| domain.len())
            .map(|(_, config)| config)
            .unwrap_or(&self.default)
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
