use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use super::{PushError, StatusApi, StatusUpdate};
use crate::config::Secret;
use crate::probe::Status;

#[derive(Serialize)]
struct WireUpdate<'a> {
    key: &'a str,
    status: Status,
    secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_url: Option<&'a str>,
    #[serde(rename = "scraperTags")]
    scraper_tags: &'a [String],
}

/// Posts each update as JSON to a single url.
#[derive(Debug, Clone)]
pub struct HttpStatusApi {
    url: Url,
    secret: Secret,
    client: reqwest::Client,
}

impl HttpStatusApi {
    pub fn new(url: Url, secret: Secret) -> Self {
        Self {
            url,
            secret,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl StatusApi for HttpStatusApi {
    async fn push(&self, update: &StatusUpdate) -> Result<(), PushError> {
        let wire = WireUpdate {
            key: &update.key,
            status: update.status,
            secret: self.secret.expose(),
            content_url: update.content_url.as_deref(),
            scraper_tags: &update.tags,
        };

        let response = self.client.post(self.url.clone()).json(&wire).send().await?;
        let status = response.status();
        let reply = response.text().await?;

        log::debug!(
            "{}: pushed {} {:?}: {}",
            update.name,
            update.status,
            update.tags,
            reply
        );

        if status != reqwest::StatusCode::OK {
            log::error!("{}: api status code is {}!", update.name, status.as_u16());
            return Err(PushError::Status(status.as_u16()));
        }
        Ok(())
    }
}
