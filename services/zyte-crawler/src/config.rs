//! Configuration types and loading
//!
//! Config path precedence: `--config` CLI arg > `CONFIG_PATH` env var >
//! `zyte-crawler.toml`. The API key is loaded from the `ZYTE_API_KEY` env var
//! or `api.key_file`, never stored in the TOML directly.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use zyte_api::ApiKey;
use zyte_session::{Params, Request, SessionMeta, SessionSettings};

use crate::error::{Error, Result};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub sessions: SessionSettings,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// API connection settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Path to a file containing the API key (alternative to ZYTE_API_KEY)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(skip)]
    pub key: Option<ApiKey>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            timeout_secs: default_timeout(),
            key_file: None,
            key: None,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What to crawl and how hard
#[derive(Debug, Deserialize)]
pub struct CrawlConfig {
    #[serde(default)]
    pub start_urls: Vec<String>,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    /// Stop after this many API requests. 0 means no limit.
    #[serde(default)]
    pub max_requests: u64,
}

/// A start request with its own API parameters or session overrides
#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    pub url: String,
    #[serde(default)]
    pub params: Option<Params>,
    #[serde(default)]
    pub session: SessionMeta,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

/// Crawl loop tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlOptions {
    pub concurrency: usize,
    pub retry_times: u32,
    pub max_requests: u64,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry_times: default_retry_times(),
            max_requests: 0,
        }
    }
}

fn default_api_url() -> String {
    "https://api.zyte.com/v1".into()
}

fn default_timeout() -> u64 {
    200
}

fn default_concurrency() -> usize {
    16
}

fn default_retry_times() -> u32 {
    2
}

impl CrawlConfig {
    pub fn options(&self) -> CrawlOptions {
        CrawlOptions {
            concurrency: self.concurrency,
            retry_times: self.retry_times,
            max_requests: self.max_requests,
        }
    }

    /// `start_urls` followed by `requests`, in file order.
    pub fn start_requests(&self) -> Result<Vec<Request>> {
        let plain = self.start_urls.iter().map(|url| RequestConfig {
            url: url.clone(),
            params: None,
            session: SessionMeta::default(),
        });
        plain
            .chain(self.requests.iter().cloned())
            .map(|start| {
                let mut request =
                    Request::new(&start.url).map_err(|e| Error::Config(e.to_string()))?;
                if let Some(params) = start.params {
                    request = request.with_params(params);
                }
                Ok(request.with_meta(start.session))
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order:
    /// 1. ZYTE_API_KEY env var
    /// 2. key_file path from config
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;

        if let Ok(key) = std::env::var("ZYTE_API_KEY") {
            if !key.trim().is_empty() {
                config.api.key = Some(ApiKey::new(key.trim()));
            }
        }
        if config.api.key.is_none() {
            if let Some(ref key_file) = config.api.key_file {
                let key = std::fs::read_to_string(key_file).map_err(|e| {
                    Error::Config(format!(
                        "failed to read key_file {}: {e}",
                        key_file.display()
                    ))
                })?;
                let key = key.trim();
                if !key.is_empty() {
                    config.api.key = Some(ApiKey::new(key));
                }
            }
        }

        Ok(config)
    }

    /// Parse and validate a TOML document. Does not read the environment.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;

        if !config.api.url.starts_with("http://") && !config.api.url.starts_with("https://") {
            return Err(Error::Config(format!(
                "api.url must start with http:// or https://, got: {}",
                config.api.url
            )));
        }

        if config.api.timeout_secs == 0 {
            return Err(Error::Config(
                "api.timeout_secs must be greater than 0".into(),
            ));
        }

        if config.crawl.concurrency == 0 {
            return Err(Error::Config(
                "crawl.concurrency must be greater than 0".into(),
            ));
        }

        // Surface bad start URLs at load time rather than mid-crawl.
        config.crawl.start_requests()?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("zyte-crawler.toml")
    }
}
