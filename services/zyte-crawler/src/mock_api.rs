//! Scripted stand-in for the remote API used by crawl tests.
//!
//! - `forbidden.example` answers 451.
//! - Asking for both `browserHtml` and `httpResponseBody` answers 400.
//! - `setLocation` on `no-location-support.example` is reported unsupported.
//! - `setLocation` on `postal-code-10001.example` succeeds only for postal
//!   code 10001 and answers 400 otherwise.
//! - Everything else echoes the URL and session back with a body.

use std::sync::Arc;

use serde_json::{Value, json};
use zyte_api::{ApiError, ApiResponse, FnTransport, SET_LOCATION, Transport, find_action};

pub fn respond(request: &Value) -> zyte_api::Result<ApiResponse> {
    let url = request["url"].as_str().unwrap_or_default();
    let host = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();

    if host == "forbidden.example" {
        return Err(ApiError::Request {
            status: 451,
            message: "Forbidden domain".into(),
        });
    }
    if request.get("browserHtml").is_some() && request.get("httpResponseBody").is_some() {
        return Err(ApiError::Request {
            status: 400,
            message: "browserHtml and httpResponseBody are mutually exclusive".into(),
        });
    }

    let mut actions = Vec::new();
    if let Some(action) = find_action(request, SET_LOCATION) {
        match host.as_str() {
            "no-location-support.example" => actions.push(json!({
                "action": SET_LOCATION,
                "status": "returned",
                "error": format!("Action setLocation not supported on {url}"),
            })),
            "postal-code-10001.example" => {
                if action["address"]["postalCode"] != "10001" {
                    return Err(ApiError::Request {
                        status: 400,
                        message: "unsupported postal code".into(),
                    });
                }
                actions.push(json!({"action": SET_LOCATION, "status": "success"}));
            }
            _ => actions.push(json!({"action": SET_LOCATION, "status": "success"})),
        }
    }

    let body_key = if request.get("browserHtml").is_some() {
        "browserHtml"
    } else {
        "httpResponseBody"
    };
    let mut raw = json!({
        "url": url,
        "statusCode": 200,
        "session": request.get("session").cloned().unwrap_or(Value::Null),
        "actions": actions,
    });
    raw[body_key] = json!("");
    Ok(ApiResponse::from_raw(raw))
}

pub fn transport() -> Arc<dyn Transport> {
    Arc::new(FnTransport::new(|request: Value| async move {
        // Let other crawl tasks run while a call is in flight.
        tokio::task::yield_now().await;
        respond(&request)
    }))
}

#[test]
fn mock_api_behaves_as_documented() {
    let ok = respond(&json!({"url": "https://example.com/", "session": {"id": "s"}})).unwrap();
    assert_eq!(ok.session_id(), Some("s"));
    assert!(ok.has_body());

    let forbidden = respond(&json!({"url": "https://forbidden.example"})).unwrap_err();
    assert_eq!(forbidden.status(), Some(451));

    for url in [
        "https://forbidden.example:8443/page",
        "http://user@forbidden.example/?q=1",
        "https://FORBIDDEN.example#top",
    ] {
        let err = respond(&json!({"url": url})).unwrap_err();
        assert_eq!(err.status(), Some(451), "{url}");
    }
    assert!(respond(&json!({"url": "https://forbidden.example.com/"})).is_ok());

    let both = respond(&json!({
        "url": "https://example.com/",
        "browserHtml": true,
        "httpResponseBody": true,
    }))
    .unwrap_err();
    assert_eq!(both.status(), Some(400));
}
