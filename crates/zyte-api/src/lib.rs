//! Client abstraction for the Zyte scraping API
//!
//! Defines the `Transport` trait that decouples session and crawl logic from
//! how API calls reach the network. `HttpTransport` talks to the real API over
//! reqwest; `FnTransport` answers from a closure, which is how embedders and
//! tests script API behavior without a server.
//!
//! Only the response fields the session layer inspects are modeled as typed
//! accessors (status, echoed session id, action results). Everything else stays
//! in the raw JSON body.

pub mod actions;
pub mod client;
pub mod error;
pub mod key;
pub mod transport;

pub use actions::{SET_LOCATION, find_action, has_action, set_location_action};
pub use client::{ClientConfig, HttpTransport};
pub use error::{ApiError, Result};
pub use key::ApiKey;
pub use transport::{ApiResponse, FnTransport, Transport};
