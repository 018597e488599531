//! Probe run metrics.
//!
//! Counts runs, failures and pushes per task, tallies the statuses each task
//! reported, and remembers when a task last moved to a different status.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::probe::Status;

/// Aggregated metrics across all tasks.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub pushes: u64,
    pub push_failures: u64,
    /// Sum of probe execution time over every run.
    pub busy_time: Duration,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_runs: 0,
            successes: 0,
            failures: 0,
            pushes: 0,
            push_failures: 0,
            busy_time: Duration::ZERO,
        }
    }
}

impl GlobalStats {
    pub fn mean_run_time(&self) -> Option<Duration> {
        mean(self.busy_time, self.total_runs)
    }
}

/// Task-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct TaskStats {
    pub name: String,
    pub total_runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub push_failures: u64,
    pub consecutive_failures: u32,
    pub last_status: Option<Status>,
    /// When the task last reported a status different from the one before.
    pub last_change: Option<DateTime<Utc>>,
    pub last_run_time: Option<Duration>,
    pub slowest_run: Option<Duration>,
    pub mean_run_time: Option<Duration>,
    /// Runs per reported status, in [`Status::ALL`] order, zero counts omitted.
    pub status_counts: Vec<(Status, u64)>,
}

impl TaskStats {
    pub fn count(&self, status: Status) -> u64 {
        self.status_counts
            .iter()
            .find(|(counted, _)| *counted == status)
            .map_or(0, |(_, count)| *count)
    }

    /// Time since the last status change, measured at `now`.
    pub fn since_change(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_change
            .map(|changed| (now - changed).to_std().unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub tasks: Vec<TaskStats>,
}

impl MetricsSnapshot {
    pub fn task(&self, name: &str) -> Option<&TaskStats> {
        self.tasks.iter().find(|task| task.name == name)
    }
}

#[derive(Debug, Default)]
struct TaskRecord {
    total_runs: u64,
    successes: u64,
    failures: u64,
    push_failures: u64,
    consecutive_failures: u32,
    last_status: Option<Status>,
    last_change: Option<DateTime<Utc>>,
    last_run_time: Option<Duration>,
    slowest_run: Option<Duration>,
    busy_time: Duration,
    per_status: HashMap<Status, u64>,
}

impl TaskRecord {
    fn record(&mut self, status: Status, failed: bool, run_time: Duration, at: DateTime<Utc>) {
        self.total_runs += 1;
        *self.per_status.entry(status).or_default() += 1;

        if failed {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        } else {
            self.successes += 1;
            self.consecutive_failures = 0;
        }

        if self.last_status != Some(status) {
            self.last_change = Some(at);
        }
        self.last_status = Some(status);

        self.busy_time += run_time;
        self.last_run_time = Some(run_time);
        self.slowest_run = self.slowest_run.max(Some(run_time));
    }

    fn stats(&self, name: &str) -> TaskStats {
        let status_counts = Status::ALL
            .iter()
            .filter_map(|status| {
                self.per_status
                    .get(status)
                    .map(|count| (*status, *count))
            })
            .collect();

        TaskStats {
            name: name.to_string(),
            total_runs: self.total_runs,
            successes: self.successes,
            failures: self.failures,
            push_failures: self.push_failures,
            consecutive_failures: self.consecutive_failures,
            last_status: self.last_status,
            last_change: self.last_change,
            last_run_time: self.last_run_time,
            slowest_run: self.slowest_run,
            mean_run_time: mean(self.busy_time, self.total_runs),
            status_counts,
        }
    }
}

fn mean(total: Duration, runs: u64) -> Option<Duration> {
    u32::try_from(runs)
        .ok()
        .filter(|runs| *runs > 0)
        .map(|runs| total / runs)
}

#[derive(Debug, Default)]
struct MetricsState {
    global: GlobalStats,
    tasks: HashMap<String, TaskRecord>,
}

/// Thread-safe metrics collector shared by the orchestrator and its handlers.
#[derive(Clone, Debug, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one finished probe run. `failed` marks runs that produced an error.
    pub fn record_run(&self, name: &str, status: Status, failed: bool, run_time: Duration) {
        self.record_run_at(name, status, failed, run_time, Utc::now());
    }

    fn record_run_at(
        &self,
        name: &str,
        status: Status,
        failed: bool,
        run_time: Duration,
        at: DateTime<Utc>,
    ) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.total_runs += 1;
        guard.global.busy_time += run_time;
        if failed {
            guard.global.failures += 1;
        } else {
            guard.global.successes += 1;
        }

        guard
            .tasks
            .entry(name.to_string())
            .or_default()
            .record(status, failed, run_time, at);
    }

    pub fn record_push(&self, name: &str, delivered: bool) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.pushes += 1;
        if !delivered {
            guard.global.push_failures += 1;
            guard.tasks.entry(name.to_string()).or_default().push_failures += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let mut tasks: Vec<_> = guard
            .tasks
            .iter()
            .map(|(name, record)| record.stats(name))
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        MetricsSnapshot {
            global: guard.global.clone(),
            tasks,
        }
    }
}
