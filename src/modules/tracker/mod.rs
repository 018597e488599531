//! Per-task run-lock and status history.
//!
//! Every task name is registered once at startup. A task is either idle or
//! locked by exactly one in-flight probe; finishing the probe reports the new
//! status, unlocks the task and yields whether the result should be pushed
//! upstream and whether it counts as a change.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::probe::Status;

/// Raised when an operation names a task that was never registered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("task not registered with change tracker: {0}")]
    UnknownTask(String),
}

/// What the caller should do with a finished probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    /// Push the status upstream.
    pub should_emit: bool,
    /// The status moved from one concrete value to another.
    pub did_change: bool,
}

impl UpdateOutcome {
    const fn new(should_emit: bool, did_change: bool) -> Self {
        Self {
            should_emit,
            did_change,
        }
    }
}

#[derive(Debug, Clone)]
struct TaskEntry {
    locked: bool,
    last_status: Status,
    last_emit: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
    error_count: u32,
}

impl Default for TaskEntry {
    fn default() -> Self {
        Self {
            locked: false,
            last_status: Status::Unknown,
            last_emit: None,
            last_attempt: None,
            error_count: 0,
        }
    }
}

/// Read-only copy of one task's tracked state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub locked: bool,
    pub last_status: Status,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error_count: u32,
}

#[derive(Debug)]
pub struct ChangeTracker {
    heartbeat: Duration,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl ChangeTracker {
    /// Registers every task name up front; the set never changes afterwards.
    pub fn new<I, S>(names: I, heartbeat: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tasks = names
            .into_iter()
            .map(|name| (name.into(), TaskEntry::default()))
            .collect();

        Self {
            heartbeat,
            tasks: Mutex::new(tasks),
        }
    }

    /// Idle → Locked. Returns `false` for unknown or already locked tasks.
    pub fn lock(&self, name: &str) -> bool {
        let mut guard = self.tasks.lock().expect("tracker lock poisoned");
        match guard.get_mut(name) {
            Some(entry) if !entry.locked => {
                entry.locked = true;
                true
            }
            _ => false,
        }
    }

    /// Locked → Idle, recording the attempt and the reported status.
    pub fn update_and_unlock(
        &self,
        name: &str,
        status: Status,
    ) -> Result<UpdateOutcome, TrackerError> {
        let mut guard = self.tasks.lock().expect("tracker lock poisoned");
        let entry = guard
            .get_mut(name)
            .ok_or_else(|| TrackerError::UnknownTask(name.to_string()))?;

        let now = Utc::now();
        entry.locked = false;
        entry.last_attempt = Some(now);

        if status == Status::Unknown {
            return Ok(UpdateOutcome::default());
        }

        entry.error_count = 0;

        if status != entry.last_status {
            let previous = std::mem::replace(&mut entry.last_status, status);
            entry.last_emit = Some(now);
            return Ok(UpdateOutcome::new(true, previous != Status::Unknown));
        }

        let heartbeat_due = entry.last_emit.is_none_or(|last| {
            (now - last).to_std().unwrap_or(Duration::ZERO) >= self.heartbeat
        });
        if heartbeat_due {
            entry.last_emit = Some(now);
            return Ok(UpdateOutcome::new(true, false));
        }

        Ok(UpdateOutcome::default())
    }

    /// Counts a failed attempt and returns the consecutive error count.
    pub fn error(&self, name: &str) -> Result<u32, TrackerError> {
        let mut guard = self.tasks.lock().expect("tracker lock poisoned");
        let entry = guard
            .get_mut(name)
            .ok_or_else(|| TrackerError::UnknownTask(name.to_string()))?;

        entry.last_attempt = Some(Utc::now());
        entry.error_count = entry.error_count.saturating_add(1);
        Ok(entry.error_count)
    }

    /// Timestamp of the last attempt, `None` if the task never ran.
    pub fn last_scrape(&self, name: &str) -> Option<DateTime<Utc>> {
        let guard = self.tasks.lock().expect("tracker lock poisoned");
        guard.get(name).and_then(|entry| entry.last_attempt)
    }

    pub fn snapshot(&self, name: &str) -> Option<TaskSnapshot> {
        let guard = self.tasks.lock().expect("tracker lock poisoned");
        guard.get(name).map(|entry| TaskSnapshot {
            locked: entry.locked,
            last_status: entry.last_status,
            last_attempt: entry.last_attempt,
            error_count: entry.error_count,
        })
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }
}
