use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{PoolError, ProxyEndpoint, ProxyPool};

/// Default time an endpoint stays pinned.
pub const DEFAULT_STICKY_TTL: Duration = Duration::from_secs(300);

struct Pinned {
    endpoint: Arc<ProxyEndpoint>,
    expires_at: Instant,
}

/// Keeps returning the same endpoint from the wrapped pool until its TTL
/// elapses or it gets blacklisted, so multi-step workflows stay on one
/// egress identity.
pub struct StickyPool {
    inner: Arc<dyn ProxyPool>,
    ttl: Duration,
    pinned: Mutex<Option<Pinned>>,
}

impl StickyPool {
    pub fn new(inner: Arc<dyn ProxyPool>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            pinned: Mutex::new(None),
        }
    }

    pub fn with_default_ttl(inner: Arc<dyn ProxyPool>) -> Self {
        Self::new(inner, DEFAULT_STICKY_TTL)
    }
}

#[async_trait]
impl ProxyPool for StickyPool {
    fn name(&self) -> &'static str {
        "sticky"
    }

    async fn get_proxy(&self) -> Result<Arc<ProxyEndpoint>, PoolError> {
        let mut pinned = self.pinned.lock().await;

        if let Some(current) = pinned.as_ref()
            && Instant::now() < current.expires_at
            && !current.endpoint.is_blacklisted()
        {
            return Ok(current.endpoint.clone());
        }

        let endpoint = self.inner.get_proxy().await?;
        *pinned = Some(Pinned {
            endpoint: endpoint.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(endpoint)
    }
}
