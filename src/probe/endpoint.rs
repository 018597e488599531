use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use super::{ProbeError, ProbeParams, ProbeResult, optional_str, optional_u64, required_str};
use crate::config::ConfigError;
use crate::modules::cache::{Lookup, SingleFlightCache};
use crate::modules::proxy::ProxyPool;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);

const PLACEHOLDER_TIMESTAMP: &str = "##CURRENT_TIMESTAMP##";
const PLACEHOLDER_DATE: &str = "##CURRENT_DATE##";
const PLACEHOLDER_TOMORROW: &str = "##TOMORROW_DATE##";
const PLACEHOLDER_NEXT_WEEK: &str = "##NEXTWEEK_DATE##";
const PLACEHOLDER_NEXT_MONTH: &str = "##NEXTMONTH_DATE##";

/// How a request leaves the process.
#[derive(Clone, Copy)]
pub enum FetchRoute<'a> {
    Direct(&'a reqwest::Client),
    /// Through an endpoint drawn from the pool. Transport failures blacklist it.
    Proxied(&'a dyn ProxyPool),
}

/// One configured HTTP request.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    url: String,
    method: Method,
    body: Option<String>,
    headers: HeaderMap,
    allowed_status: Vec<u16>,
    timeout: Duration,
}

impl HttpEndpoint {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            body: None,
            headers: HeaderMap::new(),
            allowed_status: Vec::new(),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Accept a non-200 status as a successful fetch.
    pub fn with_allowed_status(mut self, status: u16) -> Self {
        self.allowed_status.push(status);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds an endpoint from an `endpoint` table: `url`, `method` (GET or
    /// POST), `body` (POST only), `headers`, `allowed_status_codes`, `timeout`.
    pub fn from_params(params: &ProbeParams) -> Result<Self, ConfigError> {
        let url = required_str(params, "url")?;
        Url::parse(&expand_placeholders(url, Utc::now()))?;

        let mut endpoint = match required_str(params, "method")? {
            "GET" => Self::get(url),
            "POST" => Self::post(url, required_str(params, "body")?),
            other => {
                return Err(ConfigError::invalid_param(
                    "method",
                    format!("unknown method: {other}"),
                ));
            }
        };

        if let Some(headers) = params.get("headers") {
            let Value::Object(headers) = headers else {
                return Err(ConfigError::invalid_param("headers", "expected a table"));
            };
            for (name, value) in headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|err| ConfigError::invalid_param("headers", err))?;
                let value = value
                    .as_str()
                    .ok_or_else(|| ConfigError::invalid_param("headers", "values must be strings"))
                    .and_then(|raw| {
                        HeaderValue::from_str(raw)
                            .map_err(|err| ConfigError::invalid_param("headers", err))
                    })?;
                endpoint.headers.append(name, value);
            }
        }

        if let Some(codes) = params.get("allowed_status_codes") {
            let Value::Array(codes) = codes else {
                return Err(ConfigError::invalid_param(
                    "allowed_status_codes",
                    "expected a list",
                ));
            };
            for code in codes {
                let code = code
                    .as_u64()
                    .and_then(|code| u16::try_from(code).ok())
                    .ok_or_else(|| {
                        ConfigError::invalid_param("allowed_status_codes", "expected status codes")
                    })?;
                endpoint.allowed_status.push(code);
            }
        }

        let timeout = optional_u64(params, "timeout", DEFAULT_FETCH_TIMEOUT.as_secs())?;
        endpoint.timeout = Duration::from_secs(timeout);

        if optional_str(params, "body")?.is_some() && endpoint.method == Method::GET {
            log::warn!("{url}: body ignored for GET endpoint");
        }

        Ok(endpoint)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `url|ttl` for GET, `url|sha256(body)|ttl` for POST.
    pub fn cache_key(&self, ttl: Duration) -> String {
        match &self.body {
            Some(body) if self.method == Method::POST => {
                let digest = hex::encode(Sha256::digest(body.as_bytes()));
                format!("{}|{}|{}", self.url, digest, ttl.as_secs())
            }
            _ => format!("{}|{}", self.url, ttl.as_secs()),
        }
    }

    pub async fn fetch(&self, route: FetchRoute<'_>) -> ProbeResult<Bytes> {
        match route {
            FetchRoute::Direct(client) => self.send(client).await,
            FetchRoute::Proxied(pool) => {
                let proxy = pool.get_proxy().await?;
                let client = proxy.client(self.timeout)?;
                match self.send(&client).await {
                    Err(ProbeError::Http(err)) => {
                        log::warn!("fetch through {} failed: {err}", proxy.censored());
                        proxy.blacklist().await;
                        Err(ProbeError::Http(err))
                    }
                    other => other,
                }
            }
        }
    }

    /// Single-flight fetch: concurrent callers for the same key wait for one
    /// network round trip. Returns the body and whether it was a cache miss.
    pub async fn fetch_cached(
        &self,
        cache: &SingleFlightCache<Bytes>,
        route: FetchRoute<'_>,
        ttl: Duration,
    ) -> ProbeResult<(Bytes, bool)> {
        match cache.get_or_lock(&self.cache_key(ttl)).await {
            Lookup::Hit(body) => Ok((body, false)),
            Lookup::Miss(miss) => {
                // an error drops the miss, which releases the key
                let body = self.fetch(route).await?;
                miss.put(body.clone(), ttl, 0);
                Ok((body, true))
            }
        }
    }

    async fn send(&self, client: &reqwest::Client) -> ProbeResult<Bytes> {
        let now = Utc::now();
        let url = expand_placeholders(&self.url, now);

        let mut request = client
            .request(self.method.clone(), url.as_str())
            .headers(self.headers.clone())
            .timeout(self.timeout);
        if let Some(body) = &self.body {
            request = request.body(expand_placeholders(body, now));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        log::debug!(
            "fetched {} bytes with status code {} from {}",
            body.len(),
            status.as_u16(),
            url
        );

        if status != StatusCode::OK && !self.allowed_status.contains(&status.as_u16()) {
            log::warn!("status code {} from {}", status.as_u16(), url);
            return Err(ProbeError::StatusCode {
                status: status.as_u16(),
            });
        }

        Ok(body)
    }
}

/// Replaces date and timestamp placeholders in urls and bodies.
pub fn expand_placeholders(input: &str, now: DateTime<Utc>) -> String {
    if !input.contains("##") {
        return input.to_string();
    }

    let today = now.date_naive();
    let day = |date: Option<NaiveDate>| date.unwrap_or(today).format("%Y-%m-%d").to_string();

    input
        .replace(PLACEHOLDER_TIMESTAMP, &now.timestamp().to_string())
        .replace(PLACEHOLDER_DATE, &day(Some(today)))
        .replace(PLACEHOLDER_TOMORROW, &day(today.checked_add_days(Days::new(1))))
        .replace(PLACEHOLDER_NEXT_WEEK, &day(today.checked_add_days(Days::new(7))))
        .replace(PLACEHOLDER_NEXT_MONTH, &day(today.checked_add_months(Months::new(1))))
}
