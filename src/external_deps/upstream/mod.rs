//! Upstream status api integration.
//!
//! Every emitted status becomes one [`StatusUpdate`] pushed through a
//! [`StatusApi`]. The orchestrator owns retries and the silent-push rules.

mod client;

pub use client::HttpStatusApi;

use async_trait::async_trait;
use thiserror::Error;

use crate::probe::Status;

/// One status report for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub name: String,
    pub key: String,
    pub status: Status,
    pub tags: Vec<String>,
    /// Where the raw payload was archived, when it was.
    pub content_url: Option<String>,
}

impl StatusUpdate {
    pub fn new(name: impl Into<String>, key: impl Into<String>, status: Status) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            status,
            tags: Vec::new(),
            content_url: None,
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_content_url(mut self, url: Option<String>) -> Self {
        self.content_url = url;
        self
    }
}

/// Errors surfaced while pushing a status.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("status api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status api answered with status code {0}")]
    Status(u16),
}

/// Receiver of status updates.
#[async_trait]
pub trait StatusApi: Send + Sync {
    async fn push(&self, update: &StatusUpdate) -> Result<(), PushError>;
}
