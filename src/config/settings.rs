use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::modules::proxy::{
    DEFAULT_PUBLIC_SOURCE_URL, ProxyError, PublicPoolConfig, SessionPoolConfig,
};
use crate::probe::ProbeParams;

pub const DEFAULT_SETTINGS_PATH: &str = "./scrapewatch.toml";

/// Fills an empty `api_secret`.
pub const ENV_API_SECRET: &str = "SCRAPEWATCH_API_SECRET";
/// Replaces the host (and port) of `api_url`, usually for testing.
pub const ENV_API_HOST: &str = "SCRAPEWATCH_API_HOST";
/// Supplies the session proxy range url.
pub const ENV_PROXY_URL: &str = "SCRAPEWATCH_PROXY_URL";

/// Replaced by the task name inside `api_key`.
pub const NAME_PLACEHOLDER: &str = "##NAME##";

const POLL_INTERVAL_BOUNDS: std::ops::RangeInclusive<u64> = 10..=86_400;

/// Errors raised while loading settings or configuring probes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
    #[error("could not find api secret in the settings file or $SCRAPEWATCH_API_SECRET")]
    MissingSecret,
    #[error("missing parameter: {0}")]
    MissingParam(String),
    #[error("invalid parameter {key}: {reason}")]
    InvalidParam { key: String, reason: String },
    #[error("unknown probe kind: {0}")]
    UnknownKind(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http client setup failed: {0}")]
    Client(#[from] reqwest::Error),
    #[error("proxy setup failed: {0}")]
    Proxy(#[from] ProxyError),
    #[error("{name}: {source}")]
    Task {
        name: String,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    pub fn invalid_param(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        ConfigError::InvalidParam {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn for_task(self, name: impl Into<String>) -> Self {
        ConfigError::Task {
            name: name.into(),
            source: Box::new(self),
        }
    }
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(<snip>)")
        }
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub debug: bool,
    /// Never talk to the upstream api.
    pub test_mode: bool,
    /// Seconds between probes of the same task.
    pub poll_interval: u64,
    /// Heartbeat: seconds between two pushes of an unchanged status.
    pub api_interval: u64,
    pub api_url: String,
    pub api_secret: Secret,
    pub error_warning_threshold: u32,
    /// Default appointment count at or below which `standard_regexp` reports Limited.
    pub limited_threshold: u32,
    pub notify_on_change: bool,
    pub notify_on_error: bool,
    pub dump_output: bool,
    pub dump_dir: PathBuf,
    pub push_retries: u32,
    pub push_backoff: u64,
    pub batch_retries: u32,
    pub retry_pause: u64,
    pub tick: u64,
    pub proxy: ProxySettings,
    pub tasks: BTreeMap<String, TaskSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            test_mode: false,
            poll_interval: 300,
            api_interval: 3600,
            api_url: String::new(),
            api_secret: Secret::default(),
            error_warning_threshold: 3,
            limited_threshold: 0,
            notify_on_change: false,
            notify_on_error: false,
            dump_output: false,
            dump_dir: PathBuf::from("./output"),
            push_retries: 3,
            push_backoff: 5,
            batch_retries: 3,
            retry_pause: 2,
            tick: 1,
            proxy: ProxySettings::default(),
            tasks: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Reads, overrides from the process environment, and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut settings = Self::from_toml_str(&raw)?;
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies environment overrides; `lookup` resolves a variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_API_HOST).filter(|value| !value.is_empty()) {
            self.api_url = replace_host(&self.api_url, &host)?;
        }

        if self.api_secret.is_empty() {
            match lookup(ENV_API_SECRET).filter(|value| !value.is_empty()) {
                Some(secret) => {
                    log::debug!("api secret found in ${ENV_API_SECRET}");
                    self.api_secret = Secret::new(secret);
                }
                None => log::debug!("api secret NOT found in ${ENV_API_SECRET}"),
            }
        }

        if let Some(range) = lookup(ENV_PROXY_URL).filter(|value| !value.is_empty()) {
            self.proxy
                .session
                .get_or_insert_with(SessionProxySettings::default)
                .range_url = Some(range);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !POLL_INTERVAL_BOUNDS.contains(&self.poll_interval) {
            return Err(ConfigError::Invalid(format!(
                "poll_interval must be between {} and {} seconds, configured: {}",
                POLL_INTERVAL_BOUNDS.start(),
                POLL_INTERVAL_BOUNDS.end(),
                self.poll_interval
            )));
        }

        if self.tick == 0 {
            return Err(ConfigError::Invalid("tick must be at least 1 second".into()));
        }

        if !self.test_mode {
            if self.api_secret.is_empty() {
                return Err(ConfigError::MissingSecret);
            }
            Url::parse(&self.api_url)?;
        }

        for (name, task) in &self.tasks {
            if task.kind.trim().is_empty() {
                return Err(ConfigError::MissingParam("kind".into()).for_task(name));
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.api_interval)
    }

    pub fn push_backoff(&self) -> Duration {
        Duration::from_secs(self.push_backoff)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_secs(self.retry_pause)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        if self.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}

/// Proxy pools made available to probes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub public: PublicProxySettings,
    pub session: Option<SessionProxySettings>,
    pub sticky: Option<StickySettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublicProxySettings {
    pub enabled: bool,
    pub source_url: String,
    pub refresh_interval: u64,
    pub reuse_interval: u64,
    pub blacklist_for: u64,
    /// Urls raced by the reachability check. Empty means the built-in pair.
    pub test_urls: Vec<String>,
    pub validate_timeout: u64,
}

impl Default for PublicProxySettings {
    fn default() -> Self {
        let pool = PublicPoolConfig::default();
        Self {
            enabled: false,
            source_url: DEFAULT_PUBLIC_SOURCE_URL.to_string(),
            refresh_interval: pool.refresh_interval.as_secs(),
            reuse_interval: pool.reuse_interval.as_secs(),
            blacklist_for: pool.blacklist_for.as_secs(),
            test_urls: Vec::new(),
            validate_timeout: 2,
        }
    }
}

impl PublicProxySettings {
    pub fn pool_config(&self) -> PublicPoolConfig {
        PublicPoolConfig {
            refresh_interval: Duration::from_secs(self.refresh_interval),
            reuse_interval: Duration::from_secs(self.reuse_interval),
            blacklist_for: Duration::from_secs(self.blacklist_for),
        }
    }

    pub fn source_url(&self) -> Result<Url, ConfigError> {
        Ok(Url::parse(&self.source_url)?)
    }

    pub fn test_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.test_urls
            .iter()
            .map(|raw| Url::parse(raw).map_err(ConfigError::from))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionProxySettings {
    /// `http(s)://user:pass@host:start-end`; may come from the environment.
    pub range_url: Option<String>,
    /// Sessions status feed, fetched through the range's first endpoint.
    pub status_url: String,
    pub release_url: Option<String>,
    pub country: Option<String>,
    pub random_draws: usize,
    pub active_refresh: u64,
    pub lease_margin: u64,
    pub reuse_interval: u64,
    pub blacklist_for: u64,
}

impl Default for SessionProxySettings {
    fn default() -> Self {
        let pool = SessionPoolConfig::default();
        Self {
            range_url: None,
            status_url: String::new(),
            release_url: None,
            country: pool.country,
            random_draws: pool.random_draws,
            active_refresh: pool.active_refresh.as_secs(),
            lease_margin: pool.lease_margin.as_secs(),
            reuse_interval: pool.reuse_interval.as_secs(),
            blacklist_for: pool.blacklist_for.as_secs(),
        }
    }
}

impl SessionProxySettings {
    pub fn pool_config(&self) -> Result<SessionPoolConfig, ConfigError> {
        let release_url = self
            .release_url
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .map(Url::parse)
            .transpose()?;

        Ok(SessionPoolConfig {
            reuse_interval: Duration::from_secs(self.reuse_interval),
            active_refresh: Duration::from_secs(self.active_refresh),
            lease_margin: Duration::from_secs(self.lease_margin),
            blacklist_for: Duration::from_secs(self.blacklist_for),
            random_draws: self.random_draws,
            country: self.country.clone(),
            release_url,
        })
    }
}

/// Sticky wrapper over another configured pool.
#[derive(Debug, Clone, Deserialize)]
pub struct StickySettings {
    /// Name of the wrapped pool: `public` or `session`.
    pub over: String,
    #[serde(default = "default_sticky_ttl")]
    pub ttl: u64,
}

fn default_sticky_ttl() -> u64 {
    crate::modules::proxy::DEFAULT_STICKY_TTL.as_secs()
}

impl StickySettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// One `[tasks.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSettings {
    pub kind: String,
    #[serde(default)]
    pub params: ProbeParams,
    #[serde(default)]
    pub api_key: String,
    /// Overrides `poll_interval` for this task when non-zero.
    #[serde(default)]
    pub min_scrape_interval: u64,
}

impl TaskSettings {
    pub fn api_key_for(&self, name: &str) -> String {
        self.api_key.replace(NAME_PLACEHOLDER, name)
    }

    pub fn min_interval(&self) -> Option<Duration> {
        (self.min_scrape_interval > 0).then(|| Duration::from_secs(self.min_scrape_interval))
    }
}

fn replace_host(original: &str, host: &str) -> Result<String, ConfigError> {
    let mut url = Url::parse(original)?;
    let replacement = Url::parse(&format!("http://{host}"))?;

    url.set_host(replacement.host_str())?;
    url.set_port(replacement.port())
        .map_err(|_| ConfigError::Invalid(format!("can't set port on {original}")))?;
    Ok(url.to_string())
}
