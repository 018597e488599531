//! Operator notifications for changes and repeated errors.
//!
//! Delivery is pluggable; the crate ships a notifier that writes to the log.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::probe::Status;

pub const DEFAULT_SUBJECT: &str = "scrapewatch alert";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Abstract `send(subject, body)` channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        log::warn!("[{subject}] {body}");
        Ok(())
    }
}

pub fn error_message(name: &str, error: &dyn fmt::Display) -> String {
    format!("Error during scrape: {name}: {error}")
}

pub fn change_message(name: &str, status: Status) -> String {
    format!("Detected change: {name}, new status: {status}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_formats() {
        assert_eq!(
            change_message("clinic", Status::WaitList),
            "Detected change: clinic, new status: Waitlist"
        );
        assert_eq!(
            error_message("clinic", &"status code: 503"),
            "Error during scrape: clinic: status code: 503"
        );
    }

    #[tokio::test]
    async fn log_notifier_always_delivers() {
        assert!(LogNotifier.send(DEFAULT_SUBJECT, "body").await.is_ok());
    }
}
