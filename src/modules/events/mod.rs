//! Event system for the probe lifecycle.
//!
//! Provides hooks for metrics, logging, and custom reactions around task
//! runs, status changes, and upstream pushes.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::probe::Status;

#[derive(Debug, Clone)]
pub struct StartedEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

/// A run that produced a concrete status without error.
#[derive(Debug, Clone)]
pub struct FinishedEvent {
    pub name: String,
    pub status: Status,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

/// A run that ended with an error. `status` is whatever the probe still
/// classified, usually Unknown.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub name: String,
    pub status: Status,
    pub error: String,
    pub error_count: u32,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChangedEvent {
    pub name: String,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PushEvent {
    pub name: String,
    pub status: Status,
    pub attempts: u32,
    /// Set when the push was answered locally without network io.
    pub silent: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryPassEvent {
    pub pass: u32,
    pub max_passes: u32,
    pub remaining: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ProbeEvent {
    Started(StartedEvent),
    Finished(FinishedEvent),
    Failed(FailedEvent),
    Changed(ChangedEvent),
    Pushed(PushEvent),
    PushFailed(PushEvent),
    RetryPass(RetryPassEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ProbeEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: ProbeEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ProbeEvent) {
        match event {
            ProbeEvent::Started(started) => {
                log::debug!("{}: probing", started.name);
            }
            ProbeEvent::Finished(finished) => {
                log::debug!(
                    "{}: {} ({:.2}s)",
                    finished.name,
                    finished.status,
                    finished.latency.as_secs_f64()
                );
            }
            ProbeEvent::Failed(failed) => {
                log::error!(
                    "{}: {} (consecutive errors: {})",
                    failed.name,
                    failed.error,
                    failed.error_count
                );
            }
            ProbeEvent::Changed(changed) => {
                log::info!("{}: status changed to {}", changed.name, changed.status);
            }
            ProbeEvent::Pushed(push) if push.silent => {
                log::debug!("(silent) {}: {}", push.name, push.status);
            }
            ProbeEvent::Pushed(push) => {
                log::info!(
                    "{}: pushed {} after {} attempt(s)",
                    push.name,
                    push.status,
                    push.attempts
                );
            }
            ProbeEvent::PushFailed(push) => {
                log::error!(
                    "{}: could not push {} after {} attempt(s)",
                    push.name,
                    push.status,
                    push.attempts
                );
            }
            ProbeEvent::RetryPass(retry) => {
                log::info!(
                    "retrying {} failed task(s) ({}/{})...",
                    retry.remaining,
                    retry.pass,
                    retry.max_passes
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &ProbeEvent) {
        match event {
            ProbeEvent::Finished(finished) => {
                self.metrics
                    .record_run(&finished.name, finished.status, false, finished.latency);
            }
            ProbeEvent::Failed(failed) => {
                self.metrics
                    .record_run(&failed.name, failed.status, true, failed.latency);
            }
            ProbeEvent::Pushed(push) => self.metrics.record_push(&push.name, true),
            ProbeEvent::PushFailed(push) => self.metrics.record_push(&push.name, false),
            _ => {}
        }
    }
}
