//! Error types for API calls

/// Errors from a single API call.
///
/// `Request` means the API answered with an unsuccessful status; the other
/// variants mean no usable answer was obtained at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("API request failed with status {status}: {message}")]
    Request { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid API response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// HTTP status reported by the API, if it answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result alias for API calls.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_for_request_errors() {
        let err = ApiError::Request {
            status: 451,
            message: "forbidden domain".into(),
        };
        assert_eq!(err.status(), Some(451));
        assert_eq!(ApiError::Transport("reset".into()).status(), None);
        assert_eq!(ApiError::InvalidResponse("eof".into()).status(), None);
    }

    #[test]
    fn display_includes_status_and_message() {
        let err = ApiError::Request {
            status: 520,
            message: "website ban".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("520"), "got: {msg}");
        assert!(msg.contains("website ban"), "got: {msg}");
    }
}
