//! Per-request resolution of session settings
//!
//! Every setting here has up to three layers: the request's `SessionMeta`,
//! the crawl's `SessionSettings`, and a built-in fallback. An absent layer
//! falls through to the next one; a present layer wins even when its value
//! is `false` or empty.

use serde_json::Value;
use zyte_api::set_location_action;

use crate::request::{LocationOverride, Request};
use crate::settings::{Location, Params, SessionSettings};

/// Session management applies: request override > crawl setting > off.
pub fn resolve_enabled(request: &Request, settings: &SessionSettings) -> bool {
    request.meta.enabled.or(settings.enabled).unwrap_or(false)
}

/// Location for new sessions. A suppressed request location hides the crawl
/// location; an empty crawl location counts as unset.
pub fn resolve_location(request: &Request, settings: &SessionSettings) -> Option<Location> {
    match &request.meta.location {
        LocationOverride::Set(location) => Some(location.clone()),
        LocationOverride::Suppressed => None,
        LocationOverride::Unset => settings
            .location
            .as_ref()
            .filter(|location| !location.is_empty())
            .cloned(),
    }
}

/// Session initialization parameters.
///
/// Request params, else crawl params, else parameters synthesized from
/// `location`, else empty (bare initialization). May contain a `url` key
/// naming the page to initialize the session on.
pub fn resolve_init_params(
    request: &Request,
    settings: &SessionSettings,
    location: Option<Location>,
) -> Params {
    if let Some(params) = request.meta.params.as_ref().or(settings.params.as_ref()) {
        return params.clone();
    }
    match location {
        Some(location) => location_params(&location),
        None => Params::new(),
    }
}

/// `browserHtml` plus a single `setLocation` action for `location`.
pub fn location_params(location: &Location) -> Params {
    let mut params = Params::new();
    params.insert("browserHtml".into(), Value::Bool(true));
    params.insert(
        "actions".into(),
        Value::Array(vec![set_location_action(&Value::Object(location.clone()))]),
    );
    params
}

/// Splits init params into the URL to initialize on and the remaining API
/// parameters. Falls back to `fallback_url` when params carry no string `url`.
pub fn split_init_url(mut params: Params, fallback_url: &str) -> (String, Params) {
    let url = match params.remove("url") {
        Some(Value::String(url)) => url,
        _ => fallback_url.to_string(),
    };
    (url, params)
}
