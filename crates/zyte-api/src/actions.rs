//! Browser action helpers
//!
//! Requests may carry an `actions` list; the API reports one result per action
//! in the response `actions` list, in order. The session layer only cares about
//! `setLocation`.

use serde_json::{Value, json};

/// Name of the action that sets the geolocation of a browser session.
pub const SET_LOCATION: &str = "setLocation";

/// Build a `setLocation` action for the given address object.
pub fn set_location_action(address: &Value) -> Value {
    json!({
        "action": SET_LOCATION,
        "address": address,
    })
}

/// Whether request parameters include an action with the given name.
pub fn has_action(params: &Value, name: &str) -> bool {
    find_action(params, name).is_some()
}

/// First entry named `name` in the `actions` list of a request or response body.
pub fn find_action<'a>(body: &'a Value, name: &str) -> Option<&'a Value> {
    body.get("actions")?
        .as_array()?
        .iter()
        .find(|action| action.get("action").and_then(Value::as_str) == Some(name))
}
