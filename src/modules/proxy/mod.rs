//! Egress identities and the pools that hand them out.
//!
//! A [`ProxyEndpoint`] is one network path a request can leave through. Pools
//! own their endpoints and lend them to callers as `Arc`s:
//!
//! - [`PublicPool`] rotates through a scraped list of open proxies.
//! - [`SessionPool`] addresses a credentialed port range backed by leased sessions.
//! - [`StickyPool`] wraps another pool and keeps handing out the same endpoint
//!   until it expires or gets blacklisted.
//!
//! Every candidate is checked with a [`ProxyValidator`] before it is returned.

mod endpoint;
mod public;
mod session;
mod sticky;
mod validator;

pub use endpoint::{EndpointKind, ProxyEndpoint, censor_url};
pub use public::{
    DEFAULT_PUBLIC_SOURCE_URL, HttpListSource, ProxyListSource, PublicPool, PublicPoolConfig,
    parse_proxy_list,
};
pub use session::{
    HttpSessionFeed, SessionExpiration, SessionFeed, SessionPool, SessionPoolConfig,
    SessionProxyInfo, SessionRange, SessionStatus,
};
pub use sticky::{DEFAULT_STICKY_TTL, StickyPool};
pub use validator::{ProxyValidator, ReachabilityValidator};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// How long a failed endpoint stays out of rotation.
pub const DEFAULT_BLACKLIST_DURATION: Duration = Duration::from_secs(600);

/// Minimum gap before the same endpoint is handed out again.
pub const DEFAULT_REUSE_INTERVAL: Duration = Duration::from_secs(900);

/// Failure to produce an endpoint. Always transient for the calling probe.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("{pool}: no usable proxy endpoint")]
    Exhausted { pool: &'static str },
    #[error("{pool}: proxy source unavailable: {reason}")]
    Source { pool: &'static str, reason: String },
}

/// Errors raised while building endpoints or talking to proxy sources.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed proxy range url, expected http(s)://user:pass@host:start-end")]
    MalformedRange,
    #[error("invalid session payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Strategy for selecting a healthy egress identity.
#[async_trait]
pub trait ProxyPool: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get_proxy(&self) -> Result<Arc<ProxyEndpoint>, PoolError>;
}
