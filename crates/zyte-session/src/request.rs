//! Crawl requests as seen by the session layer
//!
//! A `Request` carries the target URL, the API parameters that will be sent
//! for it, and per-request session overrides (`SessionMeta`). Once a session
//! is assigned, the request also records which pool and session it uses so
//! the result can be attributed after the call completes.

use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::settings::{Location, Params};

/// Per-request location override.
///
/// `Suppressed` is an explicit opt-out: the request gets no location even if
/// a global location is configured. When deserialized, an empty object means
/// `Suppressed`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LocationOverride {
    #[default]
    Unset,
    Suppressed,
    Set(Location),
}

impl LocationOverride {
    /// Empty objects suppress, anything else sets.
    pub fn from_object(location: Location) -> Self {
        if location.is_empty() {
            LocationOverride::Suppressed
        } else {
            LocationOverride::Set(location)
        }
    }
}

impl<'de> Deserialize<'de> for LocationOverride {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Location::deserialize(deserializer).map(LocationOverride::from_object)
    }
}

/// Per-request session overrides. `None` means "use the crawl setting".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionMeta {
    pub enabled: Option<bool>,
    pub params: Option<Params>,
    pub location: LocationOverride,
    pub pool: Option<String>,
}

/// Session attached to an in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub pool: String,
    pub session_id: String,
}

/// A request headed for the API.
#[derive(Debug, Clone)]
pub struct Request {
    url: Url,
    pub params: Params,
    pub meta: SessionMeta,
    pub session: Option<Assignment>,
    session_init: bool,
}

impl Request {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.host_str().is_none() {
            return Err(Error::InvalidUrl {
                url: url.to_string(),
                reason: "URL has no host".into(),
            });
        }
        Ok(Self {
            url: parsed,
            params: Params::new(),
            meta: SessionMeta::default(),
            session: None,
            session_init: false,
        })
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_meta(mut self, meta: SessionMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Request used to initialize a session. Never gets a session assigned.
    pub(crate) fn session_init(url: &str, params: Params) -> Result<Self> {
        let mut request = Self::new(url)?.with_params(params);
        request.session_init = true;
        Ok(request)
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Host plus explicit port, e.g. `example.com` or `localhost:8080`.
    pub fn netloc(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn is_session_init(&self) -> bool {
        self.session_init
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|a| a.session_id.as_str())
    }

    /// Record the assigned session and put its ID into the API parameters.
    /// Replaces any previous assignment (e.g. on retry).
    pub(crate) fn attach_session(&mut self, pool: &str, session_id: &str) {
        self.params
            .insert("session".into(), json!({ "id": session_id }));
        self.session = Some(Assignment {
            pool: pool.to_string(),
            session_id: session_id.to_string(),
        });
    }

    pub(crate) fn detach_session(&mut self) {
        if self.session.take().is_some() {
            self.params.remove("session");
        }
    }

    /// Full API request body: parameters plus the target URL.
    pub fn api_body(&self) -> Value {
        let mut body = self.params.clone();
        body.insert("url".into(), Value::String(self.url().to_string()));
        Value::Object(body)
    }
}
