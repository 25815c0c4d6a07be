//! Domain types shared by the scorer, dispatcher and coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ai::{ProviderConfig, ProviderKind, QuestionType};
use crate::error::ErrorKind;

/// Why a topic made it into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonTag {
    WeakArea,
    ReviewDue,
    Fresh,
}

/// One (user, topic) candidate for generation in the current cycle.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub user_id: i64,
    pub language: String,
    pub level: String,
    pub topic: String,
    pub question_type: QuestionType,
    pub score: f64,
    pub reasons: Vec<ReasonTag>,
    pub provider: ProviderConfig,
}

impl WorkItem {
    pub fn has_reason(&self, tag: ReasonTag) -> bool {
        self.reasons.contains(&tag)
    }

    pub fn is_fresh(&self) -> bool {
        self.has_reason(ReasonTag::Fresh)
    }
}

/// Per-user learning preferences, read-only to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningPreferences {
    pub daily_goal: i64,
    pub focus_on_weak_areas: bool,
    pub fresh_question_ratio: f64,
    pub known_question_penalty: f64,
    pub review_interval_days: i64,
    pub weak_area_boost: f64,
    pub daily_reminder_enabled: bool,
}

impl Default for LearningPreferences {
    fn default() -> Self {
        Self {
            daily_goal: 10,
            focus_on_weak_areas: true,
            fresh_question_ratio: 0.3,
            known_question_penalty: 0.1,
            review_interval_days: 3,
            weak_area_boost: 1.0,
            daily_reminder_enabled: false,
        }
    }
}

impl LearningPreferences {
    /// Check every field against its documented range.
    pub fn validate(&self) -> Result<(), String> {
        if self.daily_goal < 0 {
            return Err(format!("daily_goal {} is negative", self.daily_goal));
        }
        if !(0.0..=1.0).contains(&self.fresh_question_ratio) {
            return Err(format!(
                "fresh_question_ratio {} outside [0, 1]",
                self.fresh_question_ratio
            ));
        }
        if !(0.0..=1.0).contains(&self.known_question_penalty) {
            return Err(format!(
                "known_question_penalty {} outside [0, 1]",
                self.known_question_penalty
            ));
        }
        if self.review_interval_days < 0 {
            return Err(format!(
                "review_interval_days {} is negative",
                self.review_interval_days
            ));
        }
        if !self.weak_area_boost.is_finite() || self.weak_area_boost < 1.0 {
            return Err(format!("weak_area_boost {} below 1.0", self.weak_area_boost));
        }
        Ok(())
    }
}

/// Historical performance for one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicHistory {
    pub topic: String,
    /// Fraction of correct answers in [0, 1].
    pub accuracy: f64,
    pub attempts: i64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Why an item was skipped without calling a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    GlobalPause,
    UserPaused,
    ProviderExhausted,
    QuotaBudget,
    Shutdown,
}

/// Final state of one work item in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Skipped(SkipReason),
    /// No concurrency slot within the bounded wait; picked up next cycle.
    Deferred,
    /// Cancelled mid-flight by the cycle watchdog.
    Incomplete,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped(reason) => write!(f, "skipped ({reason:?})"),
            Self::Deferred => write!(f, "deferred"),
            Self::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// Result of dispatching one work item.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub item: WorkItem,
    pub status: OutcomeStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    /// Duration of the final provider call only.
    pub duration_ms: u64,
    pub provider_used: ProviderKind,
    pub attempts: u32,
    pub question_id: Option<i64>,
}

impl GenerationOutcome {
    /// Outcome for an item that never reached a provider.
    pub fn not_attempted(item: WorkItem, status: OutcomeStatus) -> Self {
        let provider_used = item.provider.kind;
        Self {
            item,
            status,
            error_kind: None,
            error_message: None,
            duration_ms: 0,
            provider_used,
            attempts: 0,
            question_id: None,
        }
    }

    pub fn success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}
