use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use url::Url;

use super::{
    DEFAULT_BLACKLIST_DURATION, DEFAULT_REUSE_INTERVAL, PoolError, ProxyEndpoint, ProxyError,
    ProxyPool, ProxyValidator,
};

const POOL_NAME: &str = "public";

/// Public `ip:port` list used when no source is configured.
pub const DEFAULT_PUBLIC_SOURCE_URL: &str = "https://api.proxyscrape.com/v2/?request=getproxies&protocol=http&timeout=2500&country=all&ssl=yes&anonymity=all&simplified=true";

/// Supplies the raw `ip:port` list.
#[async_trait]
pub trait ProxyListSource: Send + Sync {
    async fn fetch_list(&self) -> Result<String, ProxyError>;
}

/// Plaintext list served over HTTP.
#[derive(Debug, Clone)]
pub struct HttpListSource {
    url: Url,
    client: reqwest::Client,
}

impl HttpListSource {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProxyListSource for HttpListSource {
    async fn fetch_list(&self) -> Result<String, ProxyError> {
        let body = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

#[derive(Debug, Clone)]
pub struct PublicPoolConfig {
    /// How often the list is re-fetched.
    pub refresh_interval: Duration,
    pub reuse_interval: Duration,
    pub blacklist_for: Duration,
}

impl Default for PublicPoolConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            reuse_interval: DEFAULT_REUSE_INTERVAL,
            blacklist_for: DEFAULT_BLACKLIST_DURATION,
        }
    }
}

#[derive(Default)]
struct PublicState {
    endpoints: Vec<Arc<ProxyEndpoint>>,
    refreshed_at: Option<Instant>,
}

/// Pool of open proxies scraped from a public list.
pub struct PublicPool {
    config: PublicPoolConfig,
    source: Arc<dyn ProxyListSource>,
    validator: Arc<dyn ProxyValidator>,
    state: Mutex<PublicState>,
}

impl PublicPool {
    pub fn new(
        config: PublicPoolConfig,
        source: Arc<dyn ProxyListSource>,
        validator: Arc<dyn ProxyValidator>,
    ) -> Self {
        Self {
            config,
            source,
            validator,
            state: Mutex::new(PublicState::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.endpoints.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn refresh(&self, state: &mut PublicState) -> Result<(), PoolError> {
        let raw = self.source.fetch_list().await.map_err(|err| {
            log::error!("public proxy list fetch failed: {err}");
            PoolError::Source {
                pool: POOL_NAME,
                reason: err.to_string(),
            }
        })?;

        let endpoints = parse_proxy_list(&raw, &state.endpoints, self.config.blacklist_for);
        if endpoints.is_empty() {
            return Err(PoolError::Source {
                pool: POOL_NAME,
                reason: "source returned no proxies".into(),
            });
        }

        log::info!("found {} public proxies", endpoints.len());
        state.endpoints = endpoints;
        state.refreshed_at = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl ProxyPool for PublicPool {
    fn name(&self) -> &'static str {
        POOL_NAME
    }

    async fn get_proxy(&self) -> Result<Arc<ProxyEndpoint>, PoolError> {
        let mut state = self.state.lock().await;

        let refresh_due = state
            .refreshed_at
            .is_none_or(|at| at.elapsed() >= self.config.refresh_interval);
        if refresh_due {
            self.refresh(&mut state).await?;
        }

        state.endpoints.shuffle(&mut rand::thread_rng());
        let candidates = state.endpoints.clone();
        let total = candidates.len();

        log::debug!("finding a working public proxy...");
        for (attempt, endpoint) in candidates.into_iter().enumerate() {
            if endpoint.is_blacklisted() || endpoint.used_within(self.config.reuse_interval) {
                continue;
            }

            if self.validator.validate(&endpoint).await {
                endpoint.mark_used();
                log::debug!(
                    "found working proxy after {}/{} attempt(s): {}",
                    attempt + 1,
                    total,
                    endpoint.source()
                );
                return Ok(endpoint);
            }
            endpoint.blacklist().await;
        }

        Err(PoolError::Exhausted { pool: POOL_NAME })
    }
}

/// Parses `ip:port` lines, reusing endpoints from `previous` with the same
/// source line so blacklist and usage state survive a refresh.
pub fn parse_proxy_list(
    raw: &str,
    previous: &[Arc<ProxyEndpoint>],
    blacklist_for: Duration,
) -> Vec<Arc<ProxyEndpoint>> {
    let mut endpoints = Vec::new();

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((ip, port)) = line.split_once(':') else {
            continue;
        };

        let ip: Ipv4Addr = match ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                log::warn!("invalid proxy ip: {ip}");
                continue;
            }
        };
        let port: u16 = match port.parse() {
            Ok(port) if port > 0 => port,
            _ => {
                log::warn!("invalid proxy port: {port}");
                continue;
            }
        };

        if let Some(existing) = previous.iter().find(|endpoint| endpoint.source() == line) {
            endpoints.push(existing.clone());
            continue;
        }

        match ProxyEndpoint::bare(IpAddr::V4(ip), port, line, blacklist_for) {
            Ok(endpoint) => endpoints.push(Arc::new(endpoint)),
            Err(err) => log::warn!("{err}"),
        }
    }

    endpoints
}
