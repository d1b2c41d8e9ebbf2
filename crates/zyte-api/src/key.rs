//! API key wrapper

use std::fmt;

use zeroize::Zeroize;

/// Zyte API key - redacted in Debug/Display/logs, wiped on drop.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Expose the key for the Authorization header (use sparingly)
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Drop for ApiKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let key = ApiKey::new("zyte-secret-key");
        let debug = format!("{key:?}");
        let display = format!("{key}");
        assert!(!debug.contains("zyte-secret-key"));
        assert!(!display.contains("zyte-secret-key"));
        assert_eq!(display, "[REDACTED]");
    }

    #[test]
    fn expose_returns_value() {
        let key = ApiKey::new("abc123");
        assert_eq!(key.expose(), "abc123");
    }
}
