use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use url::Url;

use super::ProxyError;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Endpoint flavour. Session endpoints may deregister upstream when blacklisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    Bare,
    Session { release_url: Option<Url> },
}

#[derive(Debug, Default)]
struct EndpointState {
    blacklisted_until: Option<Instant>,
    last_used: Option<Instant>,
    lease_expiry: Option<Instant>,
}

/// One egress identity, owned by the pool that created it.
#[derive(Debug)]
pub struct ProxyEndpoint {
    url: Url,
    source: String,
    kind: EndpointKind,
    blacklist_for: Duration,
    state: Mutex<EndpointState>,
}

impl ProxyEndpoint {
    /// Unauthenticated `http://ip:port` endpoint from a public list.
    pub fn bare(
        ip: IpAddr,
        port: u16,
        source: impl Into<String>,
        blacklist_for: Duration,
    ) -> Result<Self, ProxyError> {
        let host = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        let url = Url::parse(&format!("http://{host}:{port}"))?;
        Ok(Self::new(url, source.into(), EndpointKind::Bare, blacklist_for))
    }

    /// Credentialed endpoint; `url` carries the username and password.
    pub fn session(
        url: Url,
        source: impl Into<String>,
        release_url: Option<Url>,
        blacklist_for: Duration,
    ) -> Self {
        Self::new(
            url,
            source.into(),
            EndpointKind::Session { release_url },
            blacklist_for,
        )
    }

    fn new(url: Url, source: String, kind: EndpointKind, blacklist_for: Duration) -> Self {
        Self {
            url,
            source,
            kind,
            blacklist_for,
            state: Mutex::new(EndpointState::default()),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Raw string this endpoint was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    /// Endpoint URL with the password masked, safe for logs.
    pub fn censored(&self) -> String {
        censor_url(&self.url)
    }

    /// HTTP client whose every request leaves through this endpoint.
    pub fn client(&self, timeout: Duration) -> Result<reqwest::Client, ProxyError> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(self.url.as_str())?)
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(client)
    }

    /// Takes the endpoint out of rotation for the cool-down window. Session
    /// endpoints first ask the provider to release the lease; a failing
    /// release is logged and otherwise ignored.
    pub async fn blacklist(&self) {
        if let EndpointKind::Session {
            release_url: Some(release_url),
        } = &self.kind
        {
            log::debug!("rotating out proxy {}", self.censored());
            self.release(release_url).await;
        }

        let mut state = self.state.lock().expect("endpoint lock poisoned");
        let now = Instant::now();
        if state.blacklisted_until.is_none_or(|until| until <= now) {
            state.blacklisted_until = Some(now + self.blacklist_for);
        }
    }

    async fn release(&self, release_url: &Url) {
        let client = match self.client(CLIENT_TIMEOUT) {
            Ok(client) => client,
            Err(err) => {
                log::warn!("release {}: {err}", self.censored());
                return;
            }
        };

        match client.get(release_url.clone()).send().await {
            Ok(resp) => match resp.text().await {
                Ok(body) => log::debug!("release {}: {}", self.censored(), body.replace('\n', "")),
                Err(err) => log::warn!("release {}: {err}", self.censored()),
            },
            Err(err) => log::warn!("release {}: {err}", self.censored()),
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        let state = self.state.lock().expect("endpoint lock poisoned");
        state
            .blacklisted_until
            .is_some_and(|until| until > Instant::now())
    }

    pub(crate) fn used_within(&self, window: Duration) -> bool {
        let state = self.state.lock().expect("endpoint lock poisoned");
        state
            .last_used
            .is_some_and(|used| used.elapsed() < window)
    }

    pub(crate) fn mark_used(&self) {
        let mut state = self.state.lock().expect("endpoint lock poisoned");
        state.last_used = Some(Instant::now());
    }

    /// True when the lease runs out within `margin` or was never recorded.
    pub(crate) fn lease_expires_within(&self, margin: Duration) -> bool {
        let state = self.state.lock().expect("endpoint lock poisoned");
        state
            .lease_expiry
            .is_none_or(|expiry| expiry <= Instant::now() + margin)
    }

    pub(crate) fn set_lease(&self, remaining: Duration) {
        let mut state = self.state.lock().expect("endpoint lock poisoned");
        state.lease_expiry = Some(Instant::now() + remaining);
    }
}

/// Masks the password of a proxy URL: `http://user:<snip>@host:port`.
pub fn censor_url(url: &Url) -> String {
    if url.password().is_none() {
        return url.to_string();
    }

    let mut masked = url.clone();
    match masked.set_password(Some("<snip>")) {
        Ok(()) => masked.to_string(),
        Err(()) => "<malformed>".to_string(),
    }
}
