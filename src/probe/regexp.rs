//! `standard_regexp`: classify a single page by which patterns it matches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{
    DEFAULT_CACHE_TTL, FetchRoute, HttpEndpoint, Probe, ProbeError, ProbeFactory, ProbeOutcome,
    ProbeParams, Status, optional_pattern, optional_str, optional_u64, required_endpoint,
    required_pattern,
};
use crate::config::ConfigError;
use crate::context::SharedContext;
use crate::modules::proxy::ProxyPool;

const KIND: &str = "standard_regexp";

static NUMBER_LIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(?:[,\s]+\d+)*$").expect("invalid number list regex"));
static NUMBER_DELIMITER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[,\s]+").expect("invalid number delimiter regex"));

struct Rules {
    endpoint: HttpEndpoint,
    unavailable: Regex,
    available: Option<Regex>,
    error: Option<Regex>,
    available_status: Status,
    /// Zero disables the Limited classification.
    limited_threshold: u64,
    num_appts: Option<Regex>,
    num_appts_taken: Option<Regex>,
    cache_ttl: Duration,
    pool: Option<Arc<dyn ProxyPool>>,
}

/// Fetches one endpoint (through the shared cache) and classifies the body:
///
/// 1. `available_regexp` matches: `available_status`, or Limited when an
///    appointment count is configured and at or below `limited_threshold`
/// 2. `unavailable_regexp` matches: No
/// 3. `error_regexp` matches: Unknown with an error
/// 4. otherwise Possible
pub struct RegexProbe {
    name: String,
    context: SharedContext,
    rules: Option<Rules>,
}

impl RegexProbe {
    pub fn new(name: impl Into<String>, context: SharedContext) -> Self {
        Self {
            name: name.into(),
            context,
            rules: None,
        }
    }

    fn classify(&self, rules: &Rules, body: &str) -> ProbeOutcome {
        if rules.available.as_ref().is_some_and(|re| re.is_match(body)) {
            let status = match (&rules.num_appts, rules.limited_threshold) {
                (Some(num_appts), threshold) if threshold > 0 => {
                    let mut total = count_matches(&self.name, num_appts, body);
                    if let Some(taken) = &rules.num_appts_taken {
                        total = total.saturating_sub(count_matches(&self.name, taken, body));
                    }
                    log::debug!("{}: total appointments: {total}", self.name);

                    if total <= threshold {
                        Status::Limited
                    } else {
                        rules.available_status
                    }
                }
                _ => rules.available_status,
            };
            return ProbeOutcome::status(status);
        }

        if rules.unavailable.is_match(body) {
            return ProbeOutcome::status(Status::No);
        }

        if rules.error.as_ref().is_some_and(|re| re.is_match(body)) {
            return ProbeOutcome::failed(ProbeError::ErrorPattern);
        }

        ProbeOutcome::status(Status::Possible)
    }
}

#[async_trait]
impl Probe for RegexProbe {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, params: &ProbeParams) -> Result<(), ConfigError> {
        let available_status = match optional_str(params, "available_status")? {
            Some(raw) => raw
                .parse::<Status>()
                .map_err(|err| ConfigError::invalid_param("available_status", err))?,
            None => Status::Yes,
        };

        let pool = optional_str(params, "proxy")?
            .map(|name| {
                self.context.pool(name).ok_or_else(|| {
                    ConfigError::invalid_param("proxy", format!("no proxy pool named {name}"))
                })
            })
            .transpose()?;

        let cache_ttl = optional_u64(params, "cache_ttl", DEFAULT_CACHE_TTL.as_secs())?;

        self.rules = Some(Rules {
            endpoint: required_endpoint(params, "endpoint")?,
            unavailable: required_pattern(params, "unavailable_regexp")?,
            available: optional_pattern(params, "available_regexp")?,
            error: optional_pattern(params, "error_regexp")?,
            available_status,
            limited_threshold: optional_u64(
                params,
                "limited_threshold",
                u64::from(self.context.limited_threshold()),
            )?,
            num_appts: optional_pattern(params, "num_appts_regexp")?,
            num_appts_taken: optional_pattern(params, "num_appts_taken_regexp")?,
            cache_ttl: Duration::from_secs(cache_ttl),
            pool,
        });
        Ok(())
    }

    async fn execute(&self) -> ProbeOutcome {
        let Some(rules) = &self.rules else {
            return ProbeOutcome::failed(ProbeError::Other(format!(
                "{}: probe used before configure",
                self.name
            )));
        };

        let route = match &rules.pool {
            Some(pool) => FetchRoute::Proxied(pool.as_ref()),
            None => FetchRoute::Direct(self.context.client()),
        };

        let body = match rules
            .endpoint
            .fetch_cached(self.context.cache(), route, rules.cache_ttl)
            .await
        {
            Ok((body, _)) => body,
            Err(err) => return ProbeOutcome::failed(err),
        };

        let text = String::from_utf8_lossy(&body);
        self.classify(rules, &text).with_body(body.clone())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RegexProbeFactory;

impl ProbeFactory for RegexProbeFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn create(&self, name: &str, context: &SharedContext) -> Box<dyn Probe> {
        Box::new(RegexProbe::new(name, context.clone()))
    }
}

/// Counts appointments in `body`.
///
/// Without capture groups every match counts as one. With capture groups
/// each captured number, or comma/space separated list of numbers, is summed.
pub fn count_matches(name: &str, pattern: &Regex, body: &str) -> u64 {
    if pattern.captures_len() < 2 {
        return pattern.find_iter(body).count() as u64;
    }

    let mut total = 0u64;
    for caps in pattern.captures_iter(body) {
        for group in caps.iter().skip(1).flatten() {
            let text = group.as_str().trim();
            if !NUMBER_LIST_RE.is_match(text) {
                log::error!("{name}: could not match number or list of numbers: {text}");
                continue;
            }
            total += NUMBER_DELIMITER_RE
                .split(text)
                .filter_map(|n| n.parse::<u64>().ok())
                .sum::<u64>();
        }
    }
    total
}
