//! High level probe orchestration.
//!
//! Wires the registered tasks to the change tracker, the shared cache, the
//! upstream status api and the notification and archival channels, and
//! drives them in one of three modes:
//!
//! - continuous: every tick, fire every task whose minimum interval elapsed
//! - batch: run everything once, re-running tasks that ended Unknown
//! - filtered: run the tasks whose names match a pattern, once
//!
//! Every task run is its own tokio task. Runs of the same task never overlap
//! because the tracker's run-lock is taken before the probe executes.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, sleep};
use url::Url;

use crate::config::{ConfigError, Settings};
use crate::context::SharedContext;
use crate::external_deps::archive::{ArchiveError, Archiver, FileArchiver, fingerprint};
use crate::external_deps::notify::{
    DEFAULT_SUBJECT, LogNotifier, Notifier, change_message, error_message,
};
use crate::external_deps::upstream::{HttpStatusApi, StatusApi, StatusUpdate};
use crate::modules::events::{
    ChangedEvent, EventDispatcher, EventHandler, FailedEvent, FinishedEvent, LoggingHandler,
    MetricsHandler, ProbeEvent, PushEvent, RetryPassEvent, StartedEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::tracker::{ChangeTracker, TrackerError};
use crate::probe::{Probe, ProbeRegistry, Status};

/// Result alias used across the orchestration layer.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Remaining-task count at which unreported tasks are logged as stragglers.
const STRAGGLER_WATERMARK: usize = 3;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A broken internal contract. Always fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("invalid task pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl From<TrackerError> for OrchestratorError {
    fn from(err: TrackerError) -> Self {
        OrchestratorError::InvariantViolation(err.to_string())
    }
}

/// Orchestrator-wide policy values.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Minimum gap between two runs of a task unless the task overrides it.
    pub poll_interval: Duration,
    /// Re-push an unchanged status after this long.
    pub heartbeat: Duration,
    /// Notify when a task's consecutive error count reaches this value.
    pub error_warning_threshold: u32,
    pub notify_on_change: bool,
    pub notify_on_error: bool,
    /// Answer every push locally.
    pub test_mode: bool,
    pub push_retries: u32,
    pub push_backoff: Duration,
    /// Extra passes for tasks that ended Unknown in batch mode.
    pub batch_retries: u32,
    pub retry_pause: Duration,
    pub tick: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for OrchestratorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            heartbeat: settings.heartbeat(),
            error_warning_threshold: settings.error_warning_threshold,
            notify_on_change: settings.notify_on_change,
            notify_on_error: settings.notify_on_error,
            test_mode: settings.test_mode,
            push_retries: settings.push_retries,
            push_backoff: settings.push_backoff(),
            batch_retries: settings.batch_retries,
            retry_pause: settings.retry_pause(),
            tick: settings.tick(),
        }
    }
}

/// Terminal state of one task run, or of the last run when this one was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub name: String,
    pub status: Status,
    pub tags: Vec<String>,
    /// The run was skipped: minimum interval not elapsed or already running.
    pub skipped: bool,
}

/// A probe bound to its upstream key and scheduling overrides.
pub struct Task {
    name: String,
    probe: Arc<dyn Probe>,
    api_key: String,
    min_interval: Option<Duration>,
    last: Mutex<(Status, Vec<String>)>,
}

impl Task {
    pub fn new(probe: impl Into<Arc<dyn Probe>>) -> Self {
        let probe = probe.into();
        Self {
            name: probe.name().to_string(),
            probe,
            api_key: String::new(),
            min_interval: None,
            last: Mutex::new((Status::Unknown, Vec::new())),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_min_interval(mut self, min_interval: Option<Duration>) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    fn record(&self, status: Status, tags: Vec<String>) -> TaskReport {
        *self.last.lock().expect("task lock poisoned") = (status, tags.clone());
        TaskReport {
            name: self.name.clone(),
            status,
            tags,
            skipped: false,
        }
    }

    fn skipped(&self) -> TaskReport {
        let (status, tags) = self.last.lock().expect("task lock poisoned").clone();
        TaskReport {
            name: self.name.clone(),
            status,
            tags,
            skipped: true,
        }
    }
}

/// Reports of a batch run, one per task, sorted by name.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub reports: Vec<TaskReport>,
    pub passes: u32,
}

impl BatchSummary {
    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.reports.iter().filter(|report| report.status.is_failure())
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed().next().is_some() { 2 } else { 0 }
    }
}

/// Reports of a filtered run.
#[derive(Debug, Clone)]
pub struct FilteredSummary {
    pub pattern: String,
    pub reports: Vec<TaskReport>,
    pub failures: usize,
}

impl FilteredSummary {
    /// 0 when at least one task matched and none failed, 2 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.reports.is_empty() || self.failures > 0 { 2 } else { 0 }
    }
}

/// Turns a shell-style name pattern into an anchored regex; `*` matches anything.
pub fn task_filter(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^{}$", pattern.replace('*', ".*")))
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    context: Option<SharedContext>,
    tasks: Vec<Task>,
    status_api: Option<Arc<dyn StatusApi>>,
    notifier: Arc<dyn Notifier>,
    archiver: Option<Arc<dyn Archiver>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    enable_metrics: bool,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            context: None,
            tasks: Vec::new(),
            status_api: None,
            notifier: Arc::new(LogNotifier),
            archiver: None,
            handlers: Vec::new(),
            enable_metrics: true,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_context(mut self, context: SharedContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn add_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_status_api(mut self, api: Arc<dyn StatusApi>) -> Self {
        self.status_api = Some(api);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Archive raw payloads of Possible and Unknown outcomes.
    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn disable_metrics(mut self) -> Self {
        self.enable_metrics = false;
        self
    }

    pub fn build(self) -> OrchestratorResult<Orchestrator> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate task name: {}", task.name)).into());
            }
        }

        if self.status_api.is_none() && !self.config.test_mode {
            return Err(ConfigError::Invalid("no status api configured".into()).into());
        }

        let context = match self.context {
            Some(context) => context,
            None => SharedContext::new(reqwest::Client::builder().build().map_err(ConfigError::from)?),
        };

        let tracker = ChangeTracker::new(
            self.tasks.iter().map(|task| task.name.clone()),
            self.config.heartbeat,
        );
        let metrics = self.enable_metrics.then(MetricsCollector::new);

        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        if let Some(ref collector) = metrics {
            events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
        }
        for handler in self.handlers {
            events.register_handler(handler);
        }

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                tasks: self.tasks.into_iter().map(Arc::new).collect(),
                tracker,
                context,
                status_api: self.status_api,
                notifier: self.notifier,
                archiver: self.archiver,
                events,
                metrics,
            }),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    config: OrchestratorConfig,
    tasks: Vec<Arc<Task>>,
    tracker: ChangeTracker,
    context: SharedContext,
    status_api: Option<Arc<dyn StatusApi>>,
    notifier: Arc<dyn Notifier>,
    archiver: Option<Arc<dyn Archiver>>,
    events: EventDispatcher,
    metrics: Option<MetricsCollector>,
}

impl Inner {
    /// Runs one task on its own tokio task. A panic anywhere in the run is
    /// turned into an Unknown report and the task's run-lock is released.
    async fn run_guarded(self: Arc<Self>, task: Arc<Task>, force: bool) -> OrchestratorResult<TaskReport> {
        let started = Instant::now();
        match AssertUnwindSafe(self.run_task(&task, force)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => self.recover(&task, &panic_message(panic.as_ref()), started.elapsed()),
        }
    }

    fn recover(&self, task: &Task, reason: &str, latency: Duration) -> OrchestratorResult<TaskReport> {
        let name = task.name();
        let error_count = self.tracker.error(name)?;
        self.tracker.update_and_unlock(name, Status::Unknown)?;
        self.events.dispatch(ProbeEvent::Failed(FailedEvent {
            name: name.to_string(),
            status: Status::Unknown,
            error: format!("run panicked: {reason}"),
            error_count,
            latency,
            timestamp: Utc::now(),
        }));
        Ok(task.record(Status::Unknown, Vec::new()))
    }

    async fn run_task(&self, task: &Task, force: bool) -> OrchestratorResult<TaskReport> {
        let name = task.name.as_str();
        let min_interval = task.min_interval.unwrap_or(self.config.poll_interval);

        if !force && let Some(last) = self.tracker.last_scrape(name) {
            let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
            if elapsed < min_interval {
                return Ok(task.skipped());
            }
        }

        if !self.tracker.lock(name) {
            log::debug!("{name}: already running, skipping");
            return Ok(task.skipped());
        }

        self.events.dispatch(ProbeEvent::Started(StartedEvent {
            name: name.to_string(),
            timestamp: Utc::now(),
        }));

        let started = Instant::now();
        let outcome = task.probe.execute().await;
        let latency = started.elapsed();
        let mut status = outcome.status;
        let tags: Vec<String> = outcome.tags.iter().cloned().collect();

        if let Some(err) = &outcome.error {
            let error_count = self.tracker.error(name)?;
            self.events.dispatch(ProbeEvent::Failed(FailedEvent {
                name: name.to_string(),
                status,
                error: err.to_string(),
                error_count,
                latency,
                timestamp: Utc::now(),
            }));

            if error_count == self.config.error_warning_threshold && self.config.notify_on_error {
                self.notify(error_message(name, err)).await;
            }
        } else if status == Status::Unknown {
            // release the run-lock before surfacing the violation
            self.tracker.update_and_unlock(name, Status::Unknown)?;
            return Err(OrchestratorError::InvariantViolation(format!(
                "{name}: probe returned Unknown status without an error"
            )));
        } else {
            self.events.dispatch(ProbeEvent::Finished(FinishedEvent {
                name: name.to_string(),
                status,
                latency,
                timestamp: Utc::now(),
            }));
        }

        let mut content_url = None;
        if let Some(body) = &outcome.body {
            let hash = fingerprint(body);
            log::debug!("{name}: payload {} bytes, sha256 {hash}", body.len());

            if matches!(status, Status::Possible | Status::Unknown)
                && let Some(archiver) = &self.archiver
            {
                match archiver.store(name, &hash, body).await {
                    Ok(url) => content_url = url,
                    Err(err) => log::warn!("{name}: {err}"),
                }
            }
        }

        let update = self.tracker.update_and_unlock(name, status)?;

        if update.did_change {
            self.events.dispatch(ProbeEvent::Changed(ChangedEvent {
                name: name.to_string(),
                status,
                timestamp: Utc::now(),
            }));
            if self.config.notify_on_change {
                self.notify(change_message(name, status)).await;
            }
        }

        if update.should_emit {
            let update = StatusUpdate::new(name, &task.api_key, status)
                .with_tags(tags.clone())
                .with_content_url(content_url);

            if !self.push(&update).await {
                self.notify(error_message(
                    name,
                    &"error(s) while sending updates to the status api",
                ))
                .await;
                status = Status::ApiFail;
            }
        }

        Ok(task.record(status, tags))
    }

    /// Pushes with bounded retries. Returns whether the update was delivered.
    async fn push(&self, update: &StatusUpdate) -> bool {
        if update.key.is_empty() || self.config.test_mode || update.status == Status::ApiSkip {
            self.events.dispatch(ProbeEvent::Pushed(PushEvent {
                name: update.name.clone(),
                status: update.status,
                attempts: 0,
                silent: true,
                timestamp: Utc::now(),
            }));
            return true;
        }

        let attempts = self.config.push_retries.max(1);
        let mut delivered = false;
        let mut made = 0;

        if let Some(api) = &self.status_api {
            for attempt in 1..=attempts {
                made = attempt;
                match api.push(update).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(err) => {
                        log::warn!("{}: push attempt {attempt}/{attempts} failed: {err}", update.name);
                        if attempt < attempts {
                            sleep(self.config.push_backoff).await;
                        }
                    }
                }
            }
        } else {
            log::error!("{}: no status api configured", update.name);
        }

        let event = PushEvent {
            name: update.name.clone(),
            status: update.status,
            attempts: made,
            silent: false,
            timestamp: Utc::now(),
        };
        self.events.dispatch(if delivered {
            ProbeEvent::Pushed(event)
        } else {
            ProbeEvent::PushFailed(event)
        });
        delivered
    }

    async fn notify(&self, body: String) {
        if let Err(err) = self.notifier.send(DEFAULT_SUBJECT, &body).await {
            log::error!("{err}");
        }
    }
}

/// Drives registered tasks against the shared services.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Builds the shared context, every configured task, and the external
    /// channels. Any failure aborts before a single task is registered.
    pub fn from_settings(settings: &Settings, registry: &ProbeRegistry) -> OrchestratorResult<Self> {
        let context = SharedContext::from_settings(settings)?;
        let mut builder = Self::builder()
            .with_config(OrchestratorConfig::from(settings))
            .with_context(context.clone());

        for (name, task) in &settings.tasks {
            let probe = registry.build(name, &task.kind, &task.params, &context)?;
            let api_key = task.api_key_for(name);
            log::info!("registering task: {name} - kind: {}, key: {api_key}", task.kind);
            builder = builder.add_task(
                Task::new(probe)
                    .with_api_key(api_key)
                    .with_min_interval(task.min_interval()),
            );
        }

        if !settings.test_mode {
            let url = Url::parse(&settings.api_url).map_err(ConfigError::from)?;
            let api = HttpStatusApi::new(url, settings.api_secret.clone())
                .with_client(context.client().clone());
            builder = builder.with_status_api(Arc::new(api));
        }

        if settings.dump_output {
            let archiver = FileArchiver::new(&settings.dump_dir);
            archiver.prepare()?;
            builder = builder.with_archiver(Arc::new(archiver));
        }

        builder.build()
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.inner.tasks.iter().map(|task| task.name()).collect()
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.inner.tracker
    }

    pub fn context(&self) -> &SharedContext {
        &self.inner.context
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.metrics.as_ref().map(MetricsCollector::snapshot)
    }

    /// Runs one task by name.
    pub async fn run_task(&self, name: &str, force: bool) -> OrchestratorResult<TaskReport> {
        let task = self
            .inner
            .tasks
            .iter()
            .find(|task| task.name == name)
            .ok_or_else(|| TrackerError::UnknownTask(name.to_string()))?;
        self.inner.run_task(task, force).await
    }

    /// Fires every task once per tick until an invariant violation occurs.
    pub async fn run_continuous(&self) -> OrchestratorResult<()> {
        log::info!("running {} task(s) continuously...", self.inner.tasks.len());

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let mut ticker = tokio::time::interval(self.inner.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for task in &self.inner.tasks {
                        let inner = self.inner.clone();
                        let task = task.clone();
                        let fatal = fatal_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = inner.run_guarded(task, false).await {
                                let _ = fatal.send(err);
                            }
                        });
                    }
                }
                Some(err) = fatal_rx.recv() => {
                    log::error!("{err}");
                    return Err(err);
                }
            }
        }
    }

    /// Runs every task once, then re-runs the ones that ended Unknown up to
    /// `batch_retries` more times. The shared cache is cleared before each
    /// retry pass and once at the end.
    pub async fn run_batch(&self) -> OrchestratorResult<BatchSummary> {
        let config = &self.inner.config;
        let mut pending = self.inner.tasks.clone();
        let mut reports = Vec::with_capacity(pending.len());
        let mut passes = 0;

        for pass in 0..=config.batch_retries {
            if pending.is_empty() {
                break;
            }

            if pass == 0 {
                log::info!("running {} task(s) once...", pending.len());
            } else {
                self.inner.context.cache().destroy();
                sleep(config.retry_pause).await;
                self.inner.events.dispatch(ProbeEvent::RetryPass(RetryPassEvent {
                    pass,
                    max_passes: config.batch_retries,
                    remaining: pending.len(),
                    timestamp: Utc::now(),
                }));
            }
            passes += 1;

            let results = self.fan_out(&pending, true).await?;
            let failed: HashSet<&str> = results
                .iter()
                .filter(|report| report.status == Status::Unknown)
                .map(|report| report.name.as_str())
                .collect();
            pending.retain(|task| failed.contains(task.name()));

            for report in results {
                reports.retain(|existing: &TaskReport| existing.name != report.name);
                reports.push(report);
            }
        }

        self.inner.context.cache().destroy();
        reports.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(metrics) = self.metrics() {
            log::info!(
                "batch finished: {} run(s), {} failure(s), {} push failure(s)",
                metrics.global.total_runs,
                metrics.global.failures,
                metrics.global.push_failures
            );
        }

        Ok(BatchSummary { reports, passes })
    }

    /// Runs the tasks whose names match `pattern` once, ignoring intervals.
    pub async fn run_filtered(&self, pattern: &str) -> OrchestratorResult<FilteredSummary> {
        let filter = task_filter(pattern)?;
        log::debug!("testing all tasks with names matching {filter}");

        let matched: Vec<_> = self
            .inner
            .tasks
            .iter()
            .filter(|task| filter.is_match(task.name()))
            .cloned()
            .collect();

        if matched.is_empty() {
            log::warn!("task not found: {pattern}");
        }

        let mut reports = self.fan_out(&matched, true).await?;
        reports.sort_by(|a, b| a.name.cmp(&b.name));

        let failures = reports
            .iter()
            .inspect(|report| log::info!("task {} returned a status of {}", report.name, report.status))
            .filter(|report| report.status.is_failure())
            .count();

        Ok(FilteredSummary {
            pattern: pattern.to_string(),
            reports,
            failures,
        })
    }

    /// Spawns one run per task and collects exactly one result from each.
    async fn fan_out(&self, tasks: &[Arc<Task>], force: bool) -> OrchestratorResult<Vec<TaskReport>> {
        let total = tasks.len();
        let (tx, mut rx) = mpsc::channel(total.max(1));

        for task in tasks {
            let inner = self.inner.clone();
            let task = task.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = inner.run_guarded(task, force).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut reports = Vec::with_capacity(total);
        let mut fatal = None;

        while let Some(result) = rx.recv().await {
            match result {
                Ok(report) => {
                    let left = total - reports.len() - 1;
                    log::info!(
                        "task '{}' finished with status {}, waiting on {} more...",
                        report.name,
                        report.status,
                        left
                    );
                    reports.push(report);

                    if left == STRAGGLER_WATERMARK {
                        for task in tasks {
                            if !reports.iter().any(|done| done.name == task.name) {
                                log::warn!("possible long-running task: '{}'", task.name);
                            }
                        }
                    }
                }
                Err(err) => {
                    log::error!("{err}");
                    fatal.get_or_insert(err);
                }
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
