//! Shared services handed to every probe.
//!
//! Built once at startup and cloned into probes. Clones share the same
//! cache and pools.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::{ConfigError, Settings};
use crate::modules::cache::SingleFlightCache;
use crate::modules::proxy::{
    HttpListSource, HttpSessionFeed, ProxyPool, ProxyValidator, PublicPool,
    ReachabilityValidator, SessionPool, SessionRange, StickyPool,
};

#[derive(Clone)]
pub struct SharedContext {
    cache: Arc<SingleFlightCache<Bytes>>,
    pools: HashMap<&'static str, Arc<dyn ProxyPool>>,
    client: reqwest::Client,
    limited_threshold: u32,
}

impl SharedContext {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            cache: Arc::new(SingleFlightCache::new()),
            pools: HashMap::new(),
            client,
            limited_threshold: 0,
        }
    }

    /// Registers `pool` under its own name, replacing any previous one.
    pub fn with_pool(mut self, pool: Arc<dyn ProxyPool>) -> Self {
        self.pools.insert(pool.name(), pool);
        self
    }

    pub fn with_limited_threshold(mut self, threshold: u32) -> Self {
        self.limited_threshold = threshold;
        self
    }

    /// Builds the http client and every proxy pool the settings enable.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .build()?;
        let mut context = Self::new(client).with_limited_threshold(settings.limited_threshold);

        let public = &settings.proxy.public;
        let test_urls = public.test_urls()?;
        let validator: Arc<dyn ProxyValidator> = if test_urls.is_empty() {
            Arc::new(ReachabilityValidator::default())
        } else {
            Arc::new(ReachabilityValidator::new(
                test_urls,
                Duration::from_secs(public.validate_timeout),
            ))
        };

        if public.enabled {
            let source = Arc::new(HttpListSource::new(public.source_url()?));
            let pool = PublicPool::new(public.pool_config(), source, validator.clone());
            context = context.with_pool(Arc::new(pool));
            log::info!("public proxy pool enabled");
        }

        if let Some(session) = &settings.proxy.session
            && let Some(range_url) = session.range_url.as_deref()
        {
            let range: SessionRange = range_url.parse()?;
            let feed = HttpSessionFeed::for_range(url::Url::parse(&session.status_url)?, &range)?;
            let pool = SessionPool::new(session.pool_config()?, range, Arc::new(feed), validator)?;
            log::info!(
                "session proxy pool enabled with {} endpoints",
                pool.endpoints().len()
            );
            context = context.with_pool(Arc::new(pool));
        }

        if let Some(sticky) = &settings.proxy.sticky {
            let inner = context.pool(&sticky.over).ok_or_else(|| {
                ConfigError::Invalid(format!("sticky pool wraps unknown pool: {}", sticky.over))
            })?;
            context = context.with_pool(Arc::new(StickyPool::new(inner, sticky.ttl())));
        }

        Ok(context)
    }

    pub fn cache(&self) -> &Arc<SingleFlightCache<Bytes>> {
        &self.cache
    }

    pub fn pool(&self, name: &str) -> Option<Arc<dyn ProxyPool>> {
        self.pools.get(name).cloned()
    }

    pub fn pool_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.pools.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn limited_threshold(&self) -> u32 {
        self.limited_threshold
    }
}

impl fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContext")
            .field("cache", &self.cache)
            .field("pools", &self.pool_names())
            .field("limited_threshold", &self.limited_threshold)
            .finish()
    }
}
