use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scrapewatch::{
    ConfigError, Notifier, NotifyError, Orchestrator, OrchestratorConfig, OrchestratorError,
    Probe, ProbeError, ProbeOutcome, ProbeParams, ProbeRegistry, PushError, Settings, Status,
    StatusApi, StatusUpdate, Task,
};

#[derive(Debug, Clone, Copy)]
enum Step {
    Report(Status),
    Fail,
}

/// Plays back a fixed script; the last step repeats forever.
struct ScriptedProbe {
    name: String,
    script: Vec<Step>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn new(name: &str, script: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: script.to_vec(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, _params: &ProbeParams) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn execute(&self) -> ProbeOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script[call.min(self.script.len() - 1)];
        match step {
            Step::Report(status) => ProbeOutcome::status(status).with_tag("scripted"),
            Step::Fail => ProbeOutcome::failed(ProbeError::Other("status code: 503".into())),
        }
    }
}

#[derive(Default)]
struct RecordingApi {
    pushed: Mutex<Vec<StatusUpdate>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingApi {
    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    fn pushed(&self) -> Vec<StatusUpdate> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusApi for RecordingApi {
    async fn push(&self, update: &StatusUpdate) -> Result<(), PushError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PushError::Status(500));
        }
        self.pushed.lock().unwrap().push(update.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, _subject: &str, body: &str) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(body.to_string());
        Ok(())
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        push_backoff: Duration::ZERO,
        retry_pause: Duration::ZERO,
        ..OrchestratorConfig::default()
    }
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        test_mode: true,
        ..config()
    }
}

fn task(probe: &Arc<ScriptedProbe>, key: &str) -> Task {
    let probe: Arc<dyn Probe> = probe.clone();
    Task::new(probe).with_api_key(key)
}

#[tokio::test]
async fn batch_retries_only_unknown_tasks() {
    let good: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| ScriptedProbe::new(name, &[Step::Report(Status::Yes)]))
        .collect();
    let bad: Vec<_> = ["d", "e"]
        .iter()
        .map(|name| ScriptedProbe::new(name, &[Step::Fail]))
        .collect();

    let mut builder = Orchestrator::builder().with_config(OrchestratorConfig {
        batch_retries: 2,
        ..test_config()
    });
    for probe in good.iter().chain(bad.iter()) {
        builder = builder.add_task(task(probe, "key"));
    }
    let orchestrator = builder.build().unwrap();

    let summary = orchestrator.run_batch().await.unwrap();

    let failed: Vec<_> = summary.failed().map(|report| report.name.as_str()).collect();
    assert_eq!(failed, vec!["d", "e"]);
    assert_eq!(summary.reports.len(), 5);
    assert_eq!(summary.passes, 3);
    assert_eq!(summary.exit_code(), 2);

    for probe in &good {
        assert_eq!(probe.calls(), 1);
    }
    for probe in &bad {
        assert_eq!(probe.calls(), 3);
    }

    // once before each retry pass, once at the end
    assert_eq!(orchestrator.context().cache().generation(), 3);

    let metrics = orchestrator.metrics().unwrap();
    assert_eq!(metrics.global.total_runs, 9);
    assert_eq!(metrics.task("d").unwrap().consecutive_failures, 3);
}

#[tokio::test]
async fn batch_without_failures_exits_cleanly() {
    let probe = ScriptedProbe::new("clinic", &[Step::Report(Status::No)]);
    let orchestrator = Orchestrator::builder()
        .with_config(test_config())
        .add_task(task(&probe, "key"))
        .build()
        .unwrap();

    let summary = orchestrator.run_batch().await.unwrap();
    assert_eq!(summary.passes, 1);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(orchestrator.context().cache().generation(), 1);
}

#[tokio::test]
async fn filtered_run_exit_codes() {
    let one = ScriptedProbe::new("alpha_one", &[Step::Report(Status::Yes)]);
    let two = ScriptedProbe::new("alpha_two", &[Step::Report(Status::No)]);
    let beta = ScriptedProbe::new("beta", &[Step::Fail]);
    let orchestrator = Orchestrator::builder()
        .with_config(test_config())
        .add_task(task(&one, "key"))
        .add_task(task(&two, "key"))
        .add_task(task(&beta, "key"))
        .build()
        .unwrap();

    let summary = orchestrator.run_filtered("alpha_*").await.unwrap();
    assert_eq!(summary.reports.len(), 2);
    assert_eq!(summary.failures, 0);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(beta.calls(), 0);

    let summary = orchestrator.run_filtered("gamma").await.unwrap();
    assert!(summary.reports.is_empty());
    assert_eq!(summary.exit_code(), 2);

    let summary = orchestrator.run_filtered("beta").await.unwrap();
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.exit_code(), 2);
}

#[tokio::test]
async fn minimum_interval_skips_unless_forced() {
    let probe = ScriptedProbe::new("clinic", &[Step::Report(Status::Yes), Step::Report(Status::No)]);
    let orchestrator = Orchestrator::builder()
        .with_config(test_config())
        .add_task(task(&probe, "key"))
        .build()
        .unwrap();

    let first = orchestrator.run_task("clinic", false).await.unwrap();
    assert_eq!(first.status, Status::Yes);
    assert!(!first.skipped);

    // default poll interval has not elapsed; the prior result is reported
    let second = orchestrator.run_task("clinic", false).await.unwrap();
    assert!(second.skipped);
    assert_eq!(second.status, Status::Yes);
    assert_eq!(second.tags, vec!["scripted".to_string()]);
    assert_eq!(probe.calls(), 1);

    let forced = orchestrator.run_task("clinic", true).await.unwrap();
    assert_eq!(forced.status, Status::No);
    assert_eq!(probe.calls(), 2);
}

#[tokio::test]
async fn per_task_interval_overrides_poll_interval() {
    let probe = ScriptedProbe::new("clinic", &[Step::Report(Status::Yes)]);
    let dyn_probe: Arc<dyn Probe> = probe.clone();
    let orchestrator = Orchestrator::builder()
        .with_config(test_config())
        .add_task(Task::new(dyn_probe).with_min_interval(Some(Duration::ZERO)))
        .build()
        .unwrap();

    orchestrator.run_task("clinic", false).await.unwrap();
    let again = orchestrator.run_task("clinic", false).await.unwrap();
    assert!(!again.skipped);
    assert_eq!(probe.calls(), 2);
}

#[tokio::test]
async fn error_notification_fires_once_at_threshold() {
    let probe = ScriptedProbe::new("clinic", &[Step::Fail]);
    let notifier = Arc::new(RecordingNotifier::default());
    let orchestrator = Orchestrator::builder()
        .with_config(OrchestratorConfig {
            error_warning_threshold: 2,
            notify_on_error: true,
            ..test_config()
        })
        .add_task(task(&probe, "key"))
        .with_notifier(notifier.clone())
        .build()
        .unwrap();

    for _ in 0..4 {
        let report = orchestrator.run_task("clinic", true).await.unwrap();
        assert_eq!(report.status, Status::Unknown);
    }

    assert_eq!(
        notifier.sent(),
        vec!["Error during scrape: clinic: status code: 503".to_string()]
    );
    assert_eq!(orchestrator.tracker().snapshot("clinic").unwrap().error_count, 4);
}

#[tokio::test]
async fn failed_push_turns_into_api_fail() {
    let probe = ScriptedProbe::new("clinic", &[Step::Report(Status::Yes)]);
    let api = RecordingApi::failing();
    let notifier = Arc::new(RecordingNotifier::default());
    let orchestrator = Orchestrator::builder()
        .with_config(OrchestratorConfig {
            push_retries: 3,
            ..config()
        })
        .add_task(task(&probe, "key"))
        .with_status_api(api.clone())
        .with_notifier(notifier.clone())
        .build()
        .unwrap();

    let report = orchestrator.run_task("clinic", true).await.unwrap();
    assert_eq!(report.status, Status::ApiFail);
    assert_eq!(api.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(notifier.sent().len(), 1);

    // the tracker keeps the detected status, not the push failure
    assert_eq!(orchestrator.tracker().snapshot("clinic").unwrap().last_status, Status::Yes);
    assert_eq!(orchestrator.metrics().unwrap().global.push_failures, 1);
}

#[tokio::test]
async fn changes_are_pushed_and_notified() {
    let probe = ScriptedProbe::new(
        "clinic",
        &[
            Step::Report(Status::Yes),
            Step::Report(Status::Yes),
            Step::Report(Status::No),
        ],
    );
    let api = Arc::new(RecordingApi::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let orchestrator = Orchestrator::builder()
        .with_config(OrchestratorConfig {
            notify_on_change: true,
            ..config()
        })
        .add_task(task(&probe, "key-clinic"))
        .with_status_api(api.clone())
        .with_notifier(notifier.clone())
        .build()
        .unwrap();

    for _ in 0..3 {
        orchestrator.run_task("clinic", true).await.unwrap();
    }

    // initial classification and the change; the repeat falls inside the heartbeat
    let pushed = api.pushed();
    assert_eq!(pushed.len(), 2);
    assert_eq!(pushed[0].status, Status::Yes);
    assert_eq!(pushed[1].status, Status::No);
    assert_eq!(pushed[1].key, "key-clinic");
    assert_eq!(pushed[1].tags, vec!["scripted".to_string()]);

    assert_eq!(
        notifier.sent(),
        vec!["Detected change: clinic, new status: No".to_string()]
    );
}

#[tokio::test]
async fn silent_pushes_skip_the_api() {
    let keyless = ScriptedProbe::new("keyless", &[Step::Report(Status::Yes)]);
    let skipped = ScriptedProbe::new("skipped", &[Step::Report(Status::ApiSkip)]);
    let api = Arc::new(RecordingApi::default());
    let orchestrator = Orchestrator::builder()
        .with_config(config())
        .add_task(task(&keyless, ""))
        .add_task(task(&skipped, "key"))
        .with_status_api(api.clone())
        .build()
        .unwrap();

    assert_eq!(orchestrator.run_task("keyless", true).await.unwrap().status, Status::Yes);
    assert_eq!(orchestrator.run_task("skipped", true).await.unwrap().status, Status::ApiSkip);
    assert_eq!(api.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_without_error_is_an_invariant_violation() {
    let probe = ScriptedProbe::new("clinic", &[Step::Report(Status::Unknown)]);
    let orchestrator = Orchestrator::builder()
        .with_config(test_config())
        .add_task(task(&probe, "key"))
        .build()
        .unwrap();

    let err = orchestrator.run_task("clinic", true).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvariantViolation(_)));

    // the run-lock was released on the way out
    assert!(orchestrator.tracker().lock("clinic"));
    orchestrator
        .tracker()
        .update_and_unlock("clinic", Status::Unknown)
        .unwrap();

    let err = orchestrator.run_filtered("clinic*").await;
    assert!(matches!(err, Err(OrchestratorError::InvariantViolation(_))));
}

#[tokio::test]
async fn unknown_task_names_are_rejected() {
    let orchestrator = Orchestrator::builder()
        .with_config(test_config())
        .build()
        .unwrap();
    assert!(matches!(
        orchestrator.run_task("ghost", true).await,
        Err(OrchestratorError::InvariantViolation(_))
    ));
}

#[test]
fn builder_rejects_duplicate_names() {
    let a = ScriptedProbe::new("clinic", &[Step::Report(Status::Yes)]);
    let b = ScriptedProbe::new("clinic", &[Step::Report(Status::No)]);
    let result = Orchestrator::builder()
        .with_config(test_config())
        .add_task(task(&a, "key"))
        .add_task(task(&b, "key"))
        .build();
    assert!(matches!(result, Err(OrchestratorError::Config(ConfigError::Invalid(_)))));
}

const SETTINGS: &str = r#"
test_mode = true
dump_output = true

[tasks.clinic_one]
kind = "standard_regexp"

[tasks.clinic_one.params]
unavailable_regexp = "no appointments"

[tasks.clinic_one.params.endpoint]
url = "http://127.0.0.1:9/book"
method = "GET"
"#;

#[tokio::test]
async fn builds_from_settings() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::from_toml_str(SETTINGS).unwrap();
    settings.dump_dir = dir.path().join("out");
    settings.validate().unwrap();

    let orchestrator = Orchestrator::from_settings(&settings, &ProbeRegistry::with_builtin()).unwrap();
    assert_eq!(orchestrator.task_names(), vec!["clinic_one"]);
    assert!(settings.dump_dir.is_dir());
}

#[tokio::test]
async fn unknown_kind_aborts_bring_up() {
    let raw = SETTINGS.replace("standard_regexp", "does_not_exist");
    let mut settings = Settings::from_toml_str(&raw).unwrap();
    settings.dump_output = false;

    let result = Orchestrator::from_settings(&settings, &ProbeRegistry::with_builtin());
    assert!(matches!(result, Err(OrchestratorError::Config(_))));
}

#[tokio::test]
async fn missing_endpoint_method_names_the_task() {
    let raw = SETTINGS.replace("method = \"GET\"\n", "");
    let mut settings = Settings::from_toml_str(&raw).unwrap();
    settings.dump_output = false;

    match Orchestrator::from_settings(&settings, &ProbeRegistry::with_builtin()) {
        Err(OrchestratorError::Config(ConfigError::Task { name, source })) => {
            assert_eq!(name, "clinic_one");
            assert!(
                matches!(*source, ConfigError::InvalidParam { ref key, .. } if key == "endpoint"),
                "unexpected cause: {source}"
            );
        }
        other => panic!("expected a task config error, got {:?}", other.err()),
    }
}

/// Panics on every run.
struct PanickingProbe {
    name: String,
    calls: AtomicUsize,
}

impl PanickingProbe {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Probe for PanickingProbe {
    fn kind(&self) -> &'static str {
        "panicking"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, _params: &ProbeParams) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn execute(&self) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("parser blew up");
    }
}

#[tokio::test]
async fn panicking_run_is_reported_and_unlocked() {
    let good = ScriptedProbe::new("a", &[Step::Report(Status::Yes)]);
    let boom = PanickingProbe::new("boom");
    let boom_probe: Arc<dyn Probe> = boom.clone();
    let orchestrator = Orchestrator::builder()
        .with_config(OrchestratorConfig {
            batch_retries: 1,
            ..test_config()
        })
        .add_task(task(&good, "key"))
        .add_task(Task::new(boom_probe).with_api_key("key"))
        .build()
        .unwrap();

    let summary = orchestrator.run_batch().await.unwrap();

    assert_eq!(summary.reports.len(), 2);
    let failed: Vec<_> = summary.failed().map(|report| report.name.as_str()).collect();
    assert_eq!(failed, vec!["boom"]);
    let report = summary.reports.iter().find(|report| report.name == "boom").unwrap();
    assert_eq!(report.status, Status::Unknown);
    assert!(!report.skipped);
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(boom.calls.load(Ordering::SeqCst), 2);

    let snapshot = orchestrator.tracker().snapshot("boom").unwrap();
    assert!(!snapshot.locked);
    assert_eq!(snapshot.error_count, 2);

    // not wedged: a forced run executes again instead of being skipped
    let report = orchestrator.run_task("boom", true).await.unwrap();
    assert!(!report.skipped);
    assert_eq!(boom.calls.load(Ordering::SeqCst), 3);

    let metrics = orchestrator.metrics().unwrap();
    assert_eq!(metrics.task("boom").unwrap().failures, 3);
}

/// Sleeps through each run and records how many runs overlap.
struct SlowProbe {
    name: String,
    pause: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    most_running: AtomicUsize,
}

impl SlowProbe {
    fn new(name: &str, pause: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            pause,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            most_running: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Probe for SlowProbe {
    fn kind(&self) -> &'static str {
        "slow"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, _params: &ProbeParams) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn execute(&self) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.most_running.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.pause).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        ProbeOutcome::status(Status::No)
    }
}

fn continuous_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::ZERO,
        tick: Duration::from_secs(1),
        ..test_config()
    }
}

#[tokio::test(start_paused = true)]
async fn continuous_runs_every_task_each_tick_and_skips_running_ones() {
    let steady = ScriptedProbe::new("steady", &[Step::Report(Status::Yes)]);
    let slow = SlowProbe::new("slow", Duration::from_millis(2500));
    let slow_probe: Arc<dyn Probe> = slow.clone();
    let orchestrator = Orchestrator::builder()
        .with_config(continuous_config())
        .add_task(task(&steady, "key"))
        .add_task(Task::new(slow_probe).with_api_key("key"))
        .build()
        .unwrap();

    // ticks at 0s..=5s
    let outcome =
        tokio::time::timeout(Duration::from_millis(5500), orchestrator.run_continuous()).await;
    assert!(outcome.is_err(), "loop ended early");

    assert!(steady.calls() >= 5, "steady ran {} times", steady.calls());
    // started at 0s and 3s; ticks 1s, 2s, 4s and 5s found it still running
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    assert_eq!(slow.most_running.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn continuous_keeps_running_a_task_that_panics() {
    let boom = PanickingProbe::new("boom");
    let boom_probe: Arc<dyn Probe> = boom.clone();
    let orchestrator = Orchestrator::builder()
        .with_config(continuous_config())
        .add_task(Task::new(boom_probe).with_api_key("key"))
        .build()
        .unwrap();

    let outcome =
        tokio::time::timeout(Duration::from_millis(3500), orchestrator.run_continuous()).await;
    assert!(outcome.is_err(), "loop ended early");
    assert!(boom.calls.load(Ordering::SeqCst) >= 3);
    assert!(!orchestrator.tracker().snapshot("boom").unwrap().locked);
}

#[tokio::test(start_paused = true)]
async fn continuous_stops_on_invariant_violation() {
    let probe = ScriptedProbe::new(
        "clinic",
        &[
            Step::Report(Status::Yes),
            Step::Report(Status::Yes),
            Step::Report(Status::Unknown),
        ],
    );
    let orchestrator = Orchestrator::builder()
        .with_config(continuous_config())
        .add_task(task(&probe, "key"))
        .build()
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(60), orchestrator.run_continuous())
        .await
        .expect("loop should stop on its own");
    assert!(matches!(outcome, Err(OrchestratorError::InvariantViolation(_))));
    assert_eq!(probe.calls(), 3);
    assert!(!orchestrator.tracker().snapshot("clinic").unwrap().locked);
}
