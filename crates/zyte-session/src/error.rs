//! Error types for session management

use crate::close::CloseReason;

/// Errors from session assignment and result handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("too many bad session initializations for pool {0}")]
    TooManyBadInits(String),

    #[error("setLocation is not supported for pool {0}")]
    UnsupportedLocation(String),

    #[error("session checker aborted the crawl: {0}")]
    CheckerAbort(String),

    #[error("unknown session checker: {0}")]
    UnknownChecker(String),

    #[error("invalid request URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("session manager closed")]
    Closed,
}

impl Error {
    /// Crawl close reason implied by this error, if it is terminal.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Error::TooManyBadInits(_) => Some(CloseReason::BadSessionInits),
            Error::UnsupportedLocation(_) => Some(CloseReason::UnsupportedSetLocation),
            Error::CheckerAbort(reason) => Some(CloseReason::from_reason(reason)),
            Error::UnknownChecker(_) | Error::InvalidUrl { .. } | Error::Closed => None,
        }
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
