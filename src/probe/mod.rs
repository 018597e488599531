//! Probes: pluggable units of work that fetch a target and classify its state.
//!
//! A probe is configured once from its task's `params` table and then
//! executed repeatedly by the orchestrator. Execution never fails outright;
//! failures travel inside the [`ProbeOutcome`] alongside whatever status and
//! payload were gathered before the error.

mod endpoint;
mod params;
mod regexp;
mod registry;

pub use endpoint::{
    DEFAULT_CACHE_TTL, DEFAULT_FETCH_TIMEOUT, FetchRoute, HttpEndpoint, expand_placeholders,
};
pub use params::{
    ProbeParams, optional_pattern, optional_str, optional_u64, required_endpoint,
    required_pattern, required_str,
};
pub use regexp::{RegexProbe, RegexProbeFactory, count_matches};
pub use registry::{ProbeFactory, ProbeRegistry};

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::modules::proxy::{PoolError, ProxyError};

/// Classification reported for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    Yes,
    Limited,
    Call,
    #[serde(rename = "Waitlist")]
    WaitList,
    No,
    Possible,
    #[default]
    Unknown,
    /// Detected, but never pushed upstream.
    #[serde(rename = "APISkip")]
    ApiSkip,
    /// The status could not be delivered upstream.
    #[serde(rename = "APIFail")]
    ApiFail,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Yes,
        Status::Limited,
        Status::Call,
        Status::WaitList,
        Status::No,
        Status::Possible,
        Status::Unknown,
        Status::ApiSkip,
        Status::ApiFail,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Yes => "Yes",
            Status::Limited => "Limited",
            Status::Call => "Call",
            Status::WaitList => "Waitlist",
            Status::No => "No",
            Status::Possible => "Possible",
            Status::Unknown => "Unknown",
            Status::ApiSkip => "APISkip",
            Status::ApiFail => "APIFail",
        }
    }

    /// True for outcomes that count as failures in batch and filtered runs.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Unknown | Status::ApiFail)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Free-form labels attached to a status, sorted and deduplicated.
pub type TagSet = BTreeSet<String>;

/// Transient failure inside a probe execution.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status code: {status}")]
    StatusCode { status: u16 },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("error pattern matched")]
    ErrorPattern,
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Other(String),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Everything one execution produced.
#[derive(Debug, Default)]
pub struct ProbeOutcome {
    pub status: Status,
    pub tags: TagSet,
    pub body: Option<Bytes>,
    pub error: Option<ProbeError>,
}

impl ProbeOutcome {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Unknown status carrying `error`.
    pub fn failed(error: impl Into<ProbeError>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<ProbeError>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A configured unit of work bound to one task name.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Registry key this probe was built from.
    fn kind(&self) -> &'static str;
    fn name(&self) -> &str;
    fn configure(&mut self, params: &ProbeParams) -> Result<(), ConfigError>;
    async fn execute(&self) -> ProbeOutcome;
}
