//! Cross-cutting services module
//!
//! Shared state behind the orchestrator: the single-flight cache, the
//! per-task change tracker, proxy pools, lifecycle events and metrics.

pub mod cache;
pub mod events;
pub mod metrics;
pub mod proxy;
pub mod tracker;

// Re-export commonly used types
pub use cache::{CacheMiss, Lookup, SingleFlightCache};
pub use events::{
    ChangedEvent, EventDispatcher, EventHandler, FailedEvent, FinishedEvent, LoggingHandler,
    MetricsHandler, ProbeEvent, PushEvent, RetryPassEvent, StartedEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, TaskStats};
pub use proxy::{
    EndpointKind, PoolError, ProxyEndpoint, ProxyError, ProxyPool, ProxyValidator, PublicPool,
    ReachabilityValidator, SessionPool, SessionRange, StickyPool,
};
pub use tracker::{ChangeTracker, TaskSnapshot, TrackerError, UpdateOutcome};
