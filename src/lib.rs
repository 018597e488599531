//! # scrapewatch
//!
//! Repeatedly probes many independent remote targets, detects availability
//! changes, and propagates each change upstream exactly once.
//!
//! ## Features
//!
//! - Concurrent probe orchestration in continuous, batch-with-retry and
//!   filtered modes
//! - Single-flight TTL cache so concurrent probes share one fetch per key
//! - Public, session-range and sticky proxy pools with reachability checks
//! - Per-task change tracking with heartbeat re-emits and error thresholds
//! - Bounded-retry upstream pushes, change/error notifications and payload
//!   archival
//!
//! ## Example
//!
//! ```no_run
//! use scrapewatch::{Orchestrator, ProbeRegistry, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load("scrapewatch.toml")?;
//!     let orchestrator = Orchestrator::from_settings(&settings, &ProbeRegistry::with_builtin())?;
//!     let summary = orchestrator.run_batch().await?;
//!     println!("{} task(s) failed", summary.failed().count());
//!     Ok(())
//! }
//! ```

mod context;
mod orchestrator;

pub mod config;
pub mod external_deps;
pub mod modules;
pub mod probe;

#[cfg(test)]
mod test_support;

pub use crate::context::SharedContext;

pub use crate::orchestrator::{
    BatchSummary,
    FilteredSummary,
    Orchestrator,
    OrchestratorBuilder,
    OrchestratorConfig,
    OrchestratorError,
    OrchestratorResult,
    Task,
    TaskReport,
    task_filter,
};

pub use crate::config::{ConfigError, Secret, Settings, TaskSettings};

pub use crate::probe::{
    FetchRoute,
    HttpEndpoint,
    Probe,
    ProbeError,
    ProbeFactory,
    ProbeOutcome,
    ProbeParams,
    ProbeRegistry,
    ProbeResult,
    RegexProbe,
    Status,
    TagSet,
};

pub use crate::external_deps::{
    Archiver,
    FileArchiver,
    LogNotifier,
    Notifier,
    NotifyError,
    PushError,
    StatusApi,
    StatusUpdate,
};

pub use crate::modules::{
    ChangeTracker,
    EventHandler,
    MetricsCollector,
    MetricsSnapshot,
    PoolError,
    ProbeEvent,
    ProxyEndpoint,
    ProxyPool,
    SingleFlightCache,
    UpdateOutcome,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
