//! Crawl-wide session settings
//!
//! Deserialized once per crawl (the `[sessions]` table of the crawler config)
//! and shared read-only. `Option` fields keep "not configured" distinct from
//! an explicit `false` or empty value so precedence resolution can tell them
//! apart.

use std::collections::HashMap;

use serde::Deserialize;

/// JSON object of API parameters.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Address-like object passed to a `setLocation` action (e.g. `postalCode`).
pub type Location = serde_json::Map<String, serde_json::Value>;

pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_MAX_BAD_INITS: usize = 8;
pub const DEFAULT_MAX_ERRORS: usize = 1;

/// Global session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Whether requests use sessions unless they say otherwise.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Parameters for session initialization requests.
    #[serde(default)]
    pub params: Option<Params>,
    /// Location to set on new sessions when no params are configured.
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub pool_sizes: HashMap<String, usize>,
    #[serde(default = "default_max_bad_inits")]
    pub max_bad_inits: usize,
    #[serde(default)]
    pub max_bad_inits_per_pool: HashMap<String, usize>,
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
    #[serde(default)]
    pub max_errors_per_pool: HashMap<String, usize>,
    /// Name of a registered checker; the location checker when unset.
    #[serde(default)]
    pub checker: Option<String>,
    #[serde(default = "default_true")]
    pub checker_warn_on_no_body: bool,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_max_bad_inits() -> usize {
    DEFAULT_MAX_BAD_INITS
}

fn default_max_errors() -> usize {
    DEFAULT_MAX_ERRORS
}

fn default_true() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            enabled: None,
            params: None,
            location: None,
            pool_size: DEFAULT_POOL_SIZE,
            pool_sizes: HashMap::new(),
            max_bad_inits: DEFAULT_MAX_BAD_INITS,
            max_bad_inits_per_pool: HashMap::new(),
            max_errors: DEFAULT_MAX_ERRORS,
            max_errors_per_pool: HashMap::new(),
            checker: None,
            checker_warn_on_no_body: true,
        }
    }
}

/// Capacity and failure budgets of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_size: usize,
    pub max_bad_inits: usize,
    pub max_errors: usize,
}

impl SessionSettings {
    /// Limits for `pool`: per-pool override, else the global value. Values
    /// below 1 are raised to 1.
    pub fn limits_for(&self, pool: &str) -> PoolLimits {
        let pick = |overrides: &HashMap<String, usize>, global: usize| {
            overrides.get(pool).copied().unwrap_or(global).max(1)
        };
        PoolLimits {
            max_size: pick(&self.pool_sizes, self.pool_size),
            max_bad_inits: pick(&self.max_bad_inits_per_pool, self.max_bad_inits),
            max_errors: pick(&self.max_errors_per_pool, self.max_errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = SessionSettings::default();
        assert_eq!(
            settings.limits_for("example.com"),
            PoolLimits {
                max_size: 8,
                max_bad_inits: 8,
                max_errors: 1,
            }
        );
        assert!(settings.enabled.is_none());
        assert!(settings.checker_warn_on_no_body);
    }

    #[test]
    fn per_pool_override_beats_global() {
        let mut settings = SessionSettings {
            pool_size: 3,
            max_bad_inits: 5,
            ..Default::default()
        };
        settings.pool_sizes.insert("pool.example".into(), 1);
        settings.max_bad_inits_per_pool.insert("pool.example".into(), 2);
        settings.max_errors_per_pool.insert("pool.example".into(), 4);

        let pool = settings.limits_for("pool.example");
        assert_eq!(pool.max_size, 1);
        assert_eq!(pool.max_bad_inits, 2);
        assert_eq!(pool.max_errors, 4);

        let other = settings.limits_for("example.com");
        assert_eq!(other.max_size, 3);
        assert_eq!(other.max_bad_inits, 5);
        assert_eq!(other.max_errors, 1);
    }

    #[test]
    fn zero_limits_are_raised_to_one() {
        let mut settings = SessionSettings {
            pool_size: 0,
            max_bad_inits: 0,
            max_errors: 0,
            ..Default::default()
        };
        settings.max_bad_inits_per_pool.insert("pool.example".into(), 0);
        let limits = settings.limits_for("pool.example");
        assert_eq!(limits.max_size, 1);
        assert_eq!(limits.max_bad_inits, 1);
        assert_eq!(limits.max_errors, 1);
    }

    #[test]
    fn deserializes_from_toml_with_defaults() {
        let settings: SessionSettings = toml::from_str(
            r#"
enabled = true
max_bad_inits = 1
params = { browserHtml = true }
location = { postalCode = "10001" }

[pool_sizes]
"pool.example" = 2
"#,
        )
        .unwrap();
        assert_eq!(settings.enabled, Some(true));
        assert_eq!(settings.max_bad_inits, 1);
        assert_eq!(settings.pool_size, 8);
        assert_eq!(settings.params.unwrap()["browserHtml"], true);
        assert_eq!(settings.location.unwrap()["postalCode"], "10001");
        assert_eq!(settings.pool_sizes["pool.example"], 2);
    }
}
