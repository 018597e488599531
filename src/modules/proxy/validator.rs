use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, select_ok};
use url::Url;

use super::ProxyEndpoint;

const DEFAULT_TEST_URLS: [&str; 2] = ["https://ipv4.icanhazip.com", "https://api.ipify.org"];
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Decides whether an endpoint is currently usable.
#[async_trait]
pub trait ProxyValidator: Send + Sync {
    async fn validate(&self, endpoint: &ProxyEndpoint) -> bool;
}

/// Races short-timeout requests to independent test URLs through the
/// endpoint. The first response wins and the remaining requests are dropped.
#[derive(Debug, Clone)]
pub struct ReachabilityValidator {
    test_urls: Vec<Url>,
    timeout: Duration,
}

impl ReachabilityValidator {
    pub fn new(test_urls: Vec<Url>, timeout: Duration) -> Self {
        Self { test_urls, timeout }
    }

    pub fn test_urls(&self) -> &[Url] {
        &self.test_urls
    }
}

impl Default for ReachabilityValidator {
    fn default() -> Self {
        let test_urls = DEFAULT_TEST_URLS
            .iter()
            .filter_map(|raw| Url::parse(raw).ok())
            .collect();
        Self::new(test_urls, DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl ProxyValidator for ReachabilityValidator {
    async fn validate(&self, endpoint: &ProxyEndpoint) -> bool {
        if self.test_urls.is_empty() {
            return false;
        }

        let client = match endpoint.client(self.timeout) {
            Ok(client) => client,
            Err(err) => {
                log::warn!("proxy {} unusable: {err}", endpoint.censored());
                return false;
            }
        };

        let attempts: Vec<BoxFuture<'_, Result<(), reqwest::Error>>> = self
            .test_urls
            .iter()
            .map(|url| {
                let request = client.get(url.clone());
                Box::pin(async move { request.send().await.map(|_| ()) })
                    as BoxFuture<'_, Result<(), reqwest::Error>>
            })
            .collect();

        match select_ok(attempts).await {
            Ok(_) => true,
            Err(err) => {
                log::warn!("proxy failed test: {}: {err}", endpoint.censored());
                false
            }
        }
    }
}
