//! Unified `Database` trait: single async interface for all persistence.
//!
//! The worker owns the status, activity, run and pause tables. Learner,
//! question and usage tables belong to the quiz application; the worker
//! only touches them through the methods in their sections below.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ai::{GeneratedQuestion, ProviderKind, QuestionType};
use crate::error::DatabaseError;
use crate::worker::model::{LearningPreferences, TopicHistory};
use crate::worker::status::{ActivityEntry, RunRecord, WorkerStatus};

/// A learner as stored by the quiz application. Provider fields are
/// unvalidated strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerProfile {
    pub user_id: i64,
    pub username: String,
    pub language: String,
    pub level: String,
    pub ai_provider: String,
    pub ai_model: String,
    #[serde(skip_serializing)]
    pub ai_api_key: Option<String>,
}

/// Provider usage for one calendar month.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub provider: String,
    /// `YYYY-MM`.
    pub month: String,
    pub requests: u64,
    pub characters: u64,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    async fn delete_setting(&self, user_id: &str, key: &str) -> Result<bool, DatabaseError>;

    /// All (user_id, value) pairs stored under `key`.
    async fn list_settings_by_key(
        &self,
        key: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, DatabaseError>;

    // ── Worker status ───────────────────────────────────────────────

    /// Upsert everything except `last_heartbeat` and `pause_requested`.
    async fn upsert_worker_status(&self, status: &WorkerStatus) -> Result<(), DatabaseError>;

    async fn get_worker_status(&self, instance: &str)
    -> Result<Option<WorkerStatus>, DatabaseError>;

    async fn list_worker_statuses(&self) -> Result<Vec<WorkerStatus>, DatabaseError>;

    /// Move the heartbeat forward. An older timestamp never overwrites a newer one.
    async fn touch_heartbeat(&self, instance: &str, at: DateTime<Utc>)
    -> Result<(), DatabaseError>;

    async fn set_instance_pause(&self, instance: &str, paused: bool) -> Result<(), DatabaseError>;

    // ── Activity & run history ──────────────────────────────────────

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError>;

    /// Newest first.
    async fn list_activity(
        &self,
        instance: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>, DatabaseError>;

    async fn insert_run(&self, run: &RunRecord) -> Result<(), DatabaseError>;

    /// Newest first.
    async fn list_runs(&self, instance: &str, limit: usize)
    -> Result<Vec<RunRecord>, DatabaseError>;

    /// Keep the newest `keep` activity entries of `instance`; returns rows deleted.
    async fn prune_activity(&self, instance: &str, keep: usize) -> Result<u64, DatabaseError>;

    /// Keep the newest `keep` runs of `instance`; returns rows deleted.
    async fn prune_runs(&self, instance: &str, keep: usize) -> Result<u64, DatabaseError>;

    // ── Learners ────────────────────────────────────────────────────

    /// Active, non-deleted users in ascending id order.
    async fn get_active_users(&self) -> Result<Vec<i64>, DatabaseError>;

    async fn get_learner_profile(&self, user_id: i64)
    -> Result<Option<LearnerProfile>, DatabaseError>;

    async fn get_learning_preferences(
        &self,
        user_id: i64,
    ) -> Result<Option<LearningPreferences>, DatabaseError>;

    /// Topics with accuracy below `threshold`, worst first.
    async fn get_weak_areas(
        &self,
        user_id: i64,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError>;

    async fn get_topic_history(
        &self,
        user_id: i64,
        language: &str,
        level: &str,
    ) -> Result<Vec<TopicHistory>, DatabaseError>;

    async fn list_topics(&self, language: &str, level: &str) -> Result<Vec<String>, DatabaseError>;

    /// Questions assigned to the user on the given UTC day.
    async fn get_daily_assigned_count(
        &self,
        user_id: i64,
        date: NaiveDate,
    ) -> Result<i64, DatabaseError>;

    async fn upsert_learner(
        &self,
        profile: &LearnerProfile,
        preferences: &LearningPreferences,
        active: bool,
    ) -> Result<(), DatabaseError>;

    async fn record_topic_attempt(
        &self,
        user_id: i64,
        language: &str,
        level: &str,
        topic: &str,
        correct: bool,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn add_topic(&self, language: &str, level: &str, topic: &str)
    -> Result<(), DatabaseError>;

    // ── Questions ───────────────────────────────────────────────────

    /// Persist a generated question and return its id.
    async fn save_question(&self, question: &GeneratedQuestion) -> Result<i64, DatabaseError>;

    async fn assign_to_user(&self, question_id: i64, user_id: i64) -> Result<(), DatabaseError>;

    // ── Generation hints ────────────────────────────────────────────

    /// Create or extend a hint asking for more questions of `question_type`.
    async fn set_generation_hint(
        &self,
        user_id: i64,
        question_type: QuestionType,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Unexpired hints for the user, oldest first.
    async fn get_active_hints(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<QuestionType>, DatabaseError>;

    async fn clear_generation_hint(
        &self,
        user_id: i64,
        question_type: QuestionType,
    ) -> Result<bool, DatabaseError>;

    // ── Usage ───────────────────────────────────────────────────────

    async fn get_monthly_usage(
        &self,
        provider: ProviderKind,
        month: &str,
    ) -> Result<UsageStats, DatabaseError>;

    async fn record_usage(
        &self,
        provider: ProviderKind,
        month: &str,
        requests: u64,
        characters: u64,
    ) -> Result<(), DatabaseError>;
}
