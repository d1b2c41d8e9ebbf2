//! Session pools for the Zyte API
//!
//! The API can keep server-side sessions (browser state, cookies, a set
//! location) alive across requests. This crate manages them per pool (by
//! default one pool per domain): it initializes sessions on demand, checks
//! every response for signs that a session went bad, evicts and replaces bad
//! sessions, and stops the crawl when a pool can no longer produce usable
//! sessions.
//!
//! The entry point is `SessionManager`. Call `assign` before sending a request
//! and `notify_result` once it completes.

pub mod checker;
pub mod close;
pub mod config;
pub mod error;
pub mod manager;
pub mod params;
pub mod pool;
pub mod request;
pub mod settings;
pub mod stats;

pub use checker::{
    CheckOutcome, CheckResult, Checker, CheckerAbort, CheckerRegistry, FnChecker, LocationChecker,
};
pub use close::{CloseHandle, CloseReason};
pub use config::{DefaultSessionConfig, SessionConfig, SessionConfigRegistry};
pub use error::{Error, Result};
pub use manager::{SessionManager, SessionManagerBuilder, Verdict};
pub use pool::{PoolSnapshot, PoolStatus};
pub use request::{Assignment, LocationOverride, Request, SessionMeta};
pub use settings::{Location, Params, PoolLimits, SessionSettings};
pub use stats::{MemoryStats, StatsSink, session_key};
