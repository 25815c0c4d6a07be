//! Worker status, activity log and run history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How many error messages a run summary spells out before collapsing.
const MAX_LISTED_ERRORS: usize = 3;

/// Status row for one worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub instance: String,
    pub is_running: bool,
    /// The coordinator is sitting in its paused state.
    pub is_paused: bool,
    /// An operator asked this instance to pause. Written only through the
    /// pause registry; ignored by status upserts.
    pub pause_requested: bool,
    pub current_activity: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_run_start: Option<DateTime<Utc>>,
    pub last_run_finish: Option<DateTime<Utc>>,
    pub last_run_error: Option<String>,
    pub total_questions_generated: i64,
    pub total_runs: i64,
}

impl WorkerStatus {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            is_running: false,
            is_paused: false,
            pause_requested: false,
            current_activity: "idle".to_string(),
            last_heartbeat: None,
            last_run_start: None,
            last_run_finish: None,
            last_run_error: None,
            total_questions_generated: 0,
            total_runs: 0,
        }
    }

    /// A heartbeat within `stale_after` of `now`.
    pub fn is_healthy(&self, now: DateTime<Utc>, stale_after: std::time::Duration) -> bool {
        let Some(beat) = self.last_heartbeat else {
            return false;
        };
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(beat) <= stale_after
    }
}

/// Severity of an activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityLevel {
    Info,
    Warn,
    Error,
}

impl ActivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "WARN" => Self::Warn,
            "ERROR" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// One append-only activity log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub instance: String,
    pub level: ActivityLevel,
    pub message: String,
    pub user_id: Option<i64>,
}

impl ActivityEntry {
    pub fn new(instance: &str, level: ActivityLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            instance: instance.to_string(),
            level,
            message: message.into(),
            user_id: None,
        }
    }

    pub fn info(instance: &str, message: impl Into<String>) -> Self {
        Self::new(instance, ActivityLevel::Info, message)
    }

    pub fn warn(instance: &str, message: impl Into<String>) -> Self {
        Self::new(instance, ActivityLevel::Warn, message)
    }

    pub fn error(instance: &str, message: impl Into<String>) -> Self {
        Self::new(instance, ActivityLevel::Error, message)
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Persisted summary of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub instance: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub generated: i64,
    pub failed: i64,
    pub skipped: i64,
    pub deferred: i64,
    pub incomplete: i64,
    pub details: String,
}

/// Health of one instance as seen by observers.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    #[serde(flatten)]
    pub status: WorkerStatus,
    pub healthy: bool,
}

/// System-wide worker health.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub global_paused: bool,
    pub instances: Vec<InstanceHealth>,
    pub total_count: usize,
    pub healthy_count: usize,
}

impl WorkerHealth {
    pub fn from_statuses(
        statuses: Vec<WorkerStatus>,
        global_paused: bool,
        now: DateTime<Utc>,
        stale_after: std::time::Duration,
    ) -> Self {
        let instances: Vec<InstanceHealth> = statuses
            .into_iter()
            .map(|status| {
                let healthy = status.is_healthy(now, stale_after);
                InstanceHealth { status, healthy }
            })
            .collect();
        let healthy_count = instances.iter().filter(|i| i.healthy).count();
        Self {
            global_paused,
            total_count: instances.len(),
            healthy_count,
            instances,
        }
    }
}

/// Collapse a list of error messages into one `last_run_error` string.
pub fn summarize_errors(errors: &[String]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    let mut summary = errors
        .iter()
        .take(MAX_LISTED_ERRORS)
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");
    if errors.len() > MAX_LISTED_ERRORS {
        summary.push_str(&format!(
            " (and {} more errors)",
            errors.len() - MAX_LISTED_ERRORS
        ));
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn health_depends_on_heartbeat_age() {
        let now = Utc::now();
        let mut status = WorkerStatus::new("w1");
        assert!(!status.is_healthy(now, Duration::from_secs(300)));

        status.last_heartbeat = Some(now - chrono::Duration::seconds(60));
        assert!(status.is_healthy(now, Duration::from_secs(300)));

        status.last_heartbeat = Some(now - chrono::Duration::seconds(301));
        assert!(!status.is_healthy(now, Duration::from_secs(300)));
    }

    #[test]
    fn health_summary_counts() {
        let now = Utc::now();
        let mut alive = WorkerStatus::new("a");
        alive.last_heartbeat = Some(now);
        let dead = WorkerStatus::new("b");

        let health =
            WorkerHealth::from_statuses(vec![alive, dead], true, now, Duration::from_secs(300));
        assert!(health.global_paused);
        assert_eq!(health.total_count, 2);
        assert_eq!(health.healthy_count, 1);
    }

    #[test]
    fn error_summary_caps_listed_messages() {
        assert_eq!(summarize_errors(&[]), None);
        assert_eq!(summarize_errors(&["one".to_string()]).unwrap(), "one");

        let errors: Vec<String> = (1..=5).map(|i| format!("e{i}")).collect();
        assert_eq!(
            summarize_errors(&errors).unwrap(),
            "e1; e2; e3 (and 2 more errors)"
        );
    }

    #[test]
    fn activity_level_round_trip() {
        for level in [ActivityLevel::Info, ActivityLevel::Warn, ActivityLevel::Error] {
            assert_eq!(ActivityLevel::parse(level.as_str()), level);
        }
        let entry = ActivityEntry::warn("w1", "slow provider").with_user(4);
        assert_eq!(entry.user_id, Some(4));
        assert_eq!(serde_json::to_value(entry.level).unwrap(), "WARN");
    }
}
