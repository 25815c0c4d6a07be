//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC strings so they compare correctly as text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::{GeneratedQuestion, ProviderKind, QuestionType};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, LearnerProfile, UsageStats};
use crate::worker::model::{LearningPreferences, TopicHistory};
use crate::worker::status::{ActivityEntry, ActivityLevel, RunRecord, RunStatus, WorkerStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for every column we write.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

const STATUS_COLUMNS: &str = "instance, is_running, is_paused, pause_requested, current_activity, \
     last_heartbeat, last_run_start, last_run_finish, last_run_error, \
     total_questions_generated, total_runs";

fn row_to_status(row: &libsql::Row) -> Result<WorkerStatus, libsql::Error> {
    Ok(WorkerStatus {
        instance: row.get(0)?,
        is_running: row.get::<i64>(1)? != 0,
        is_paused: row.get::<i64>(2)? != 0,
        pause_requested: row.get::<i64>(3)? != 0,
        current_activity: row.get(4)?,
        last_heartbeat: parse_optional_datetime(row.get::<String>(5).ok()),
        last_run_start: parse_optional_datetime(row.get::<String>(6).ok()),
        last_run_finish: parse_optional_datetime(row.get::<String>(7).ok()),
        last_run_error: row.get::<String>(8).ok(),
        total_questions_generated: row.get(9)?,
        total_runs: row.get(10)?,
    })
}

fn row_to_activity(row: &libsql::Row) -> Result<ActivityEntry, libsql::Error> {
    let timestamp: String = row.get(0)?;
    let level: String = row.get(2)?;
    Ok(ActivityEntry {
        timestamp: parse_datetime(&timestamp),
        instance: row.get(1)?,
        level: ActivityLevel::parse(&level),
        message: row.get(3)?,
        user_id: row.get::<i64>(4).ok(),
    })
}

fn row_to_run(row: &libsql::Row) -> Result<RunRecord, libsql::Error> {
    let id: String = row.get(0)?;
    let started: String = row.get(2)?;
    let finished: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(RunRecord {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        instance: row.get(1)?,
        started_at: parse_datetime(&started),
        finished_at: parse_datetime(&finished),
        duration_ms: row.get(4)?,
        status: if status == "success" {
            RunStatus::Success
        } else {
            RunStatus::Failure
        },
        generated: row.get(6)?,
        failed: row.get(7)?,
        skipped: row.get(8)?,
        deferred: row.get(9)?,
        incomplete: row.get(10)?,
        details: row.get(11)?,
    })
}

fn day_bounds(date: NaiveDate) -> (String, String) {
    let start = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    let end = start + chrono::Duration::days(1);
    (ts(start), ts(end))
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT value FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = ts(Utc::now());
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO settings (user_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
            params![user_id, key, value_str, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }

    async fn delete_setting(&self, user_id: &str, key: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let deleted = conn
            .execute(
                "DELETE FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_setting: {e}")))?;
        Ok(deleted > 0)
    }

    async fn list_settings_by_key(
        &self,
        key: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT user_id, value FROM settings WHERE key = ?1 ORDER BY user_id",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_settings_by_key: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_settings_by_key: {e}")))?
        {
            let user_id: String = row.get(0).unwrap_or_default();
            let value_str: String = row.get(1).unwrap_or_else(|_| "null".to_string());
            let value = serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
            out.push((user_id, value));
        }
        Ok(out)
    }

    // ── Worker status ───────────────────────────────────────────────

    async fn upsert_worker_status(&self, status: &WorkerStatus) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO worker_status (instance, is_running, is_paused, current_activity,
                 last_run_start, last_run_finish, last_run_error,
                 total_questions_generated, total_runs, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (instance) DO UPDATE SET
                 is_running = ?2, is_paused = ?3, current_activity = ?4,
                 last_run_start = ?5, last_run_finish = ?6, last_run_error = ?7,
                 total_questions_generated = ?8, total_runs = ?9, updated_at = ?10",
            params![
                status.instance.as_str(),
                status.is_running as i64,
                status.is_paused as i64,
                status.current_activity.as_str(),
                opt_ts(status.last_run_start),
                opt_ts(status.last_run_finish),
                opt_text(status.last_run_error.as_deref()),
                status.total_questions_generated,
                status.total_runs,
                now
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_worker_status: {e}")))?;
        Ok(())
    }

    async fn get_worker_status(
        &self,
        instance: &str,
    ) -> Result<Option<WorkerStatus>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {STATUS_COLUMNS} FROM worker_status WHERE instance = ?1"),
                params![instance],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_worker_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_status(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_worker_status: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_worker_status: {e}"))),
        }
    }

    async fn list_worker_statuses(&self) -> Result<Vec<WorkerStatus>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {STATUS_COLUMNS} FROM worker_status ORDER BY instance"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_worker_statuses: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_worker_statuses: {e}")))?
        {
            out.push(
                row_to_status(&row)
                    .map_err(|e| DatabaseError::Query(format!("list_worker_statuses: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn touch_heartbeat(
        &self,
        instance: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO worker_status (instance, last_heartbeat, updated_at) VALUES (?1, ?2, ?2)
             ON CONFLICT (instance) DO UPDATE SET
                 last_heartbeat = CASE
                     WHEN last_heartbeat IS NULL OR last_heartbeat < ?2 THEN ?2
                     ELSE last_heartbeat
                 END,
                 updated_at = ?2",
            params![instance, ts(at)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("touch_heartbeat: {e}")))?;
        Ok(())
    }

    async fn set_instance_pause(&self, instance: &str, paused: bool) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO worker_status (instance, pause_requested, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (instance) DO UPDATE SET pause_requested = ?2, updated_at = ?3",
            params![instance, paused as i64, ts(Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_instance_pause: {e}")))?;
        Ok(())
    }

    // ── Activity & run history ──────────────────────────────────────

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO worker_activity (instance, timestamp, level, message, user_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.instance.as_str(),
                ts(entry.timestamp),
                entry.level.as_str(),
                entry.message.as_str(),
                opt_int(entry.user_id)
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_activity: {e}")))?;
        Ok(())
    }

    async fn list_activity(
        &self,
        instance: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT timestamp, instance, level, message, user_id FROM worker_activity
                 WHERE ?1 IS NULL OR instance = ?1
                 ORDER BY id DESC LIMIT ?2",
                params![opt_text(instance), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_activity: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_activity: {e}")))?
        {
            out.push(
                row_to_activity(&row)
                    .map_err(|e| DatabaseError::Query(format!("list_activity: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn insert_run(&self, run: &RunRecord) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO worker_runs (id, instance, started_at, finished_at, duration_ms, status,
                 generated, failed, skipped, deferred, incomplete, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.id.to_string(),
                run.instance.as_str(),
                ts(run.started_at),
                ts(run.finished_at),
                run.duration_ms,
                run.status.as_str(),
                run.generated,
                run.failed,
                run.skipped,
                run.deferred,
                run.incomplete,
                run.details.as_str()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_run: {e}")))?;
        Ok(())
    }

    async fn list_runs(
        &self,
        instance: &str,
        limit: usize,
    ) -> Result<Vec<RunRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, instance, started_at, finished_at, duration_ms, status,
                        generated, failed, skipped, deferred, incomplete, details
                 FROM worker_runs WHERE instance = ?1
                 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
                params![instance, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_runs: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_runs: {e}")))?
        {
            out.push(row_to_run(&row).map_err(|e| DatabaseError::Query(format!("list_runs: {e}")))?);
        }
        Ok(out)
    }

    async fn prune_activity(&self, instance: &str, keep: usize) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM worker_activity WHERE instance = ?1 AND id NOT IN (
                 SELECT id FROM worker_activity WHERE instance = ?1
                 ORDER BY id DESC LIMIT ?2)",
            params![instance, keep as i64],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("prune_activity: {e}")))
    }

    async fn prune_runs(&self, instance: &str, keep: usize) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM worker_runs WHERE instance = ?1 AND rowid NOT IN (
                 SELECT rowid FROM worker_runs WHERE instance = ?1
                 ORDER BY started_at DESC, rowid DESC LIMIT ?2)",
            params![instance, keep as i64],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("prune_runs: {e}")))
    }

    // ── Learners ────────────────────────────────────────────────────

    async fn get_active_users(&self) -> Result<Vec<i64>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT user_id FROM learners WHERE active = 1 AND deleted_at IS NULL
                 ORDER BY user_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_users: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_users: {e}")))?
        {
            out.push(
                row.get::<i64>(0)
                    .map_err(|e| DatabaseError::Query(format!("get_active_users: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn get_learner_profile(
        &self,
        user_id: i64,
    ) -> Result<Option<LearnerProfile>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT user_id, username, language, level, ai_provider, ai_model, ai_api_key
                 FROM learners WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_learner_profile: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(LearnerProfile {
                user_id: row.get(0).unwrap_or(user_id),
                username: row.get(1).unwrap_or_default(),
                language: row.get(2).unwrap_or_default(),
                level: row.get(3).unwrap_or_default(),
                ai_provider: row.get(4).unwrap_or_default(),
                ai_model: row.get(5).unwrap_or_default(),
                ai_api_key: row.get::<String>(6).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_learner_profile: {e}"))),
        }
    }

    async fn get_learning_preferences(
        &self,
        user_id: i64,
    ) -> Result<Option<LearningPreferences>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT daily_goal, focus_on_weak_areas, fresh_question_ratio,
                        known_question_penalty, review_interval_days, weak_area_boost,
                        daily_reminder_enabled
                 FROM learning_preferences WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_learning_preferences: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_learning_preferences: {e}"))),
        };

        let prefs = (|| -> Result<LearningPreferences, libsql::Error> {
            Ok(LearningPreferences {
                daily_goal: row.get(0)?,
                focus_on_weak_areas: row.get::<i64>(1)? != 0,
                fresh_question_ratio: row.get(2)?,
                known_question_penalty: row.get(3)?,
                review_interval_days: row.get(4)?,
                weak_area_boost: row.get(5)?,
                daily_reminder_enabled: row.get::<i64>(6)? != 0,
            })
        })()
        .map_err(|e| DatabaseError::Serialization(format!("learning_preferences: {e}")))?;
        Ok(Some(prefs))
    }

    async fn get_weak_areas(
        &self,
        user_id: i64,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT topic FROM topic_performance
                 WHERE user_id = ?1 AND attempts > 0
                   AND CAST(correct AS REAL) / attempts < ?2
                 ORDER BY CAST(correct AS REAL) / attempts ASC, attempts DESC, topic ASC
                 LIMIT ?3",
                params![user_id, threshold, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_weak_areas: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_weak_areas: {e}")))?
        {
            out.push(row.get::<String>(0).unwrap_or_default());
        }
        Ok(out)
    }

    async fn get_topic_history(
        &self,
        user_id: i64,
        language: &str,
        level: &str,
    ) -> Result<Vec<TopicHistory>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT topic, attempts, correct, last_seen FROM topic_performance
                 WHERE user_id = ?1 AND language = ?2 AND level = ?3
                 ORDER BY topic",
                params![user_id, language, level],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_topic_history: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_topic_history: {e}")))?
        {
            let attempts: i64 = row.get(1).unwrap_or(0);
            let correct: i64 = row.get(2).unwrap_or(0);
            out.push(TopicHistory {
                topic: row.get(0).unwrap_or_default(),
                accuracy: if attempts > 0 {
                    correct as f64 / attempts as f64
                } else {
                    0.0
                },
                attempts,
                last_seen: parse_optional_datetime(row.get::<String>(3).ok()),
            });
        }
        Ok(out)
    }

    async fn list_topics(&self, language: &str, level: &str) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT topic FROM topics WHERE language = ?1 AND level = ?2 ORDER BY topic",
                params![language, level],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_topics: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_topics: {e}")))?
        {
            out.push(row.get::<String>(0).unwrap_or_default());
        }
        Ok(out)
    }

    async fn get_daily_assigned_count(
        &self,
        user_id: i64,
        date: NaiveDate,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let (start, end) = day_bounds(date);
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM user_questions
                 WHERE user_id = ?1 AND assigned_at >= ?2 AND assigned_at < ?3",
                params![user_id, start, end],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_daily_assigned_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("get_daily_assigned_count: {e}"))),
        }
    }

    async fn upsert_learner(
        &self,
        profile: &LearnerProfile,
        preferences: &LearningPreferences,
        active: bool,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO learners (user_id, username, language, level, ai_provider, ai_model,
                 ai_api_key, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (user_id) DO UPDATE SET
                 username = ?2, language = ?3, level = ?4, ai_provider = ?5,
                 ai_model = ?6, ai_api_key = ?7, active = ?8",
            params![
                profile.user_id,
                profile.username.as_str(),
                profile.language.as_str(),
                profile.level.as_str(),
                profile.ai_provider.as_str(),
                profile.ai_model.as_str(),
                opt_text(profile.ai_api_key.as_deref()),
                active as i64
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_learner: {e}")))?;

        conn.execute(
            "INSERT INTO learning_preferences (user_id, daily_goal, focus_on_weak_areas,
                 fresh_question_ratio, known_question_penalty, review_interval_days,
                 weak_area_boost, daily_reminder_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (user_id) DO UPDATE SET
                 daily_goal = ?2, focus_on_weak_areas = ?3, fresh_question_ratio = ?4,
                 known_question_penalty = ?5, review_interval_days = ?6,
                 weak_area_boost = ?7, daily_reminder_enabled = ?8",
            params![
                profile.user_id,
                preferences.daily_goal,
                preferences.focus_on_weak_areas as i64,
                preferences.fresh_question_ratio,
                preferences.known_question_penalty,
                preferences.review_interval_days,
                preferences.weak_area_boost,
                preferences.daily_reminder_enabled as i64
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_learner preferences: {e}")))?;
        Ok(())
    }

    async fn record_topic_attempt(
        &self,
        user_id: i64,
        language: &str,
        level: &str,
        topic: &str,
        correct: bool,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO topic_performance (user_id, language, level, topic, attempts, correct, last_seen)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
             ON CONFLICT (user_id, language, level, topic) DO UPDATE SET
                 attempts = attempts + 1,
                 correct = correct + ?5,
                 last_seen = CASE
                     WHEN last_seen IS NULL OR last_seen < ?6 THEN ?6
                     ELSE last_seen
                 END",
            params![user_id, language, level, topic, correct as i64, ts(at)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_topic_attempt: {e}")))?;
        Ok(())
    }

    async fn add_topic(&self, language: &str, level: &str, topic: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO topics (language, level, topic) VALUES (?1, ?2, ?3)",
            params![language, level, topic],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_topic: {e}")))?;
        Ok(())
    }

    // ── Questions ───────────────────────────────────────────────────

    async fn save_question(&self, question: &GeneratedQuestion) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let content = serde_json::to_string(&question.content)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let mut rows = conn
            .query(
                "INSERT INTO questions (language, level, topic, question_type, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id",
                params![
                    question.language.as_str(),
                    question.level.as_str(),
                    question.topic.as_str(),
                    question.question_type.as_str(),
                    content,
                    ts(Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_question: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("save_question: {e}"))),
            Ok(None) => Err(DatabaseError::Query(
                "save_question: no id returned".to_string(),
            )),
            Err(e) => Err(DatabaseError::Query(format!("save_question: {e}"))),
        }
    }

    async fn assign_to_user(&self, question_id: i64, user_id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO user_questions (user_id, question_id, assigned_at)
                 VALUES (?1, ?2, ?3)",
                params![user_id, question_id, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("assign_to_user: {e}")))?;
        if inserted == 0 {
            return Err(DatabaseError::Constraint(format!(
                "question {question_id} already assigned to user {user_id}"
            )));
        }
        Ok(())
    }

    // ── Generation hints ────────────────────────────────────────────

    async fn set_generation_hint(
        &self,
        user_id: i64,
        question_type: QuestionType,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO generation_hints (user_id, question_type, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, question_type) DO UPDATE SET
                 expires_at = MAX(expires_at, excluded.expires_at)",
            params![user_id, question_type.as_str(), ts(expires_at), ts(Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_generation_hint: {e}")))?;
        Ok(())
    }

    async fn get_active_hints(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<QuestionType>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT question_type FROM generation_hints
                 WHERE user_id = ?1 AND expires_at > ?2
                 ORDER BY created_at, question_type",
                params![user_id, ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_hints: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_hints: {e}")))?
        {
            let raw: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("get_active_hints: {e}")))?;
            match raw.parse::<QuestionType>() {
                Ok(qt) => out.push(qt),
                Err(_) => warn!(user_id, question_type = %raw, "Ignoring hint with unknown question type"),
            }
        }
        Ok(out)
    }

    async fn clear_generation_hint(
        &self,
        user_id: i64,
        question_type: QuestionType,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let deleted = conn
            .execute(
                "DELETE FROM generation_hints WHERE user_id = ?1 AND question_type = ?2",
                params![user_id, question_type.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_generation_hint: {e}")))?;
        Ok(deleted > 0)
    }

    // ── Usage ───────────────────────────────────────────────────────

    async fn get_monthly_usage(
        &self,
        provider: ProviderKind,
        month: &str,
    ) -> Result<UsageStats, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT requests, characters FROM usage_stats WHERE provider = ?1 AND month = ?2",
                params![provider.as_str(), month],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_monthly_usage: {e}")))?;

        let (requests, characters) = match rows.next().await {
            Ok(Some(row)) => (
                row.get::<i64>(0).unwrap_or(0).max(0) as u64,
                row.get::<i64>(1).unwrap_or(0).max(0) as u64,
            ),
            Ok(None) => (0, 0),
            Err(e) => return Err(DatabaseError::Query(format!("get_monthly_usage: {e}"))),
        };
        Ok(UsageStats {
            provider: provider.as_str().to_string(),
            month: month.to_string(),
            requests,
            characters,
        })
    }

    async fn record_usage(
        &self,
        provider: ProviderKind,
        month: &str,
        requests: u64,
        characters: u64,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO usage_stats (provider, month, requests, characters, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (provider, month) DO UPDATE SET
                 requests = requests + ?3,
                 characters = characters + ?4,
                 updated_at = ?5",
            params![
                provider.as_str(),
                month,
                requests as i64,
                characters as i64,
                ts(Utc::now())
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_usage: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn profile(user_id: i64) -> LearnerProfile {
        LearnerProfile {
            user_id,
            username: format!("user{user_id}"),
            language: "italian".to_string(),
            level: "A2".to_string(),
            ai_provider: "ollama".to_string(),
            ai_model: String::new(),
            ai_api_key: None,
        }
    }

    // ── Settings ────────────────────────────────────────────────────

    #[tokio::test]
    async fn settings_round_trip_and_list_by_key() {
        let db = test_db().await;
        db.set_setting("system", "global_pause", &serde_json::json!(true))
            .await
            .unwrap();
        db.set_setting("7", "worker_paused", &serde_json::json!(true))
            .await
            .unwrap();
        db.set_setting("9", "worker_paused", &serde_json::json!(false))
            .await
            .unwrap();

        let value = db.get_setting("system", "global_pause").await.unwrap();
        assert_eq!(value, Some(serde_json::json!(true)));

        let paused = db.list_settings_by_key("worker_paused").await.unwrap();
        assert_eq!(paused.len(), 2);
        assert_eq!(paused[0], ("7".to_string(), serde_json::json!(true)));

        assert!(db.delete_setting("7", "worker_paused").await.unwrap());
        assert!(!db.delete_setting("7", "worker_paused").await.unwrap());
    }

    // ── Worker status ───────────────────────────────────────────────

    #[tokio::test]
    async fn status_upsert_preserves_heartbeat_and_pause_request() {
        let db = test_db().await;
        let beat = Utc::now();
        db.touch_heartbeat("w1", beat).await.unwrap();
        db.set_instance_pause("w1", true).await.unwrap();

        let mut status = WorkerStatus::new("w1");
        status.is_running = true;
        status.total_runs = 3;
        status.last_run_error = Some("boom".to_string());
        db.upsert_worker_status(&status).await.unwrap();

        let stored = db.get_worker_status("w1").await.unwrap().unwrap();
        assert!(stored.is_running);
        assert!(stored.pause_requested);
        assert_eq!(stored.total_runs, 3);
        assert_eq!(stored.last_run_error.as_deref(), Some("boom"));
        let stored_beat = stored.last_heartbeat.unwrap();
        assert!((stored_beat - beat).num_milliseconds().abs() < 1);
    }

    #[tokio::test]
    async fn heartbeat_never_moves_backwards() {
        let db = test_db().await;
        let now = Utc::now();
        db.touch_heartbeat("w1", now).await.unwrap();
        db.touch_heartbeat("w1", now - Duration::minutes(10)).await.unwrap();

        let stored = db.get_worker_status("w1").await.unwrap().unwrap();
        assert!(stored.last_heartbeat.unwrap() >= now - Duration::milliseconds(1));

        db.touch_heartbeat("w1", now + Duration::seconds(30)).await.unwrap();
        let stored = db.get_worker_status("w1").await.unwrap().unwrap();
        assert!(stored.last_heartbeat.unwrap() > now);
    }

    #[tokio::test]
    async fn list_statuses_sorted_by_instance() {
        let db = test_db().await;
        db.upsert_worker_status(&WorkerStatus::new("b")).await.unwrap();
        db.upsert_worker_status(&WorkerStatus::new("a")).await.unwrap();
        let all = db.list_worker_statuses().await.unwrap();
        let names: Vec<&str> = all.iter().map(|s| s.instance.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    // ── Activity & runs ─────────────────────────────────────────────

    #[tokio::test]
    async fn activity_newest_first_and_filtered() {
        let db = test_db().await;
        db.append_activity(&ActivityEntry::info("w1", "first")).await.unwrap();
        db.append_activity(&ActivityEntry::warn("w2", "other")).await.unwrap();
        db.append_activity(&ActivityEntry::error("w1", "second").with_user(5))
            .await
            .unwrap();

        let w1 = db.list_activity(Some("w1"), 10).await.unwrap();
        assert_eq!(w1.len(), 2);
        assert_eq!(w1[0].message, "second");
        assert_eq!(w1[0].level, ActivityLevel::Error);
        assert_eq!(w1[0].user_id, Some(5));
        assert_eq!(w1[1].user_id, None);

        let all = db.list_activity(None, 2).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn runs_round_trip() {
        let db = test_db().await;
        let started = Utc::now() - Duration::seconds(5);
        let run = RunRecord {
            id: Uuid::new_v4(),
            instance: "w1".to_string(),
            started_at: started,
            finished_at: Utc::now(),
            duration_ms: 5000,
            status: RunStatus::Failure,
            generated: 2,
            failed: 1,
            skipped: 0,
            deferred: 1,
            incomplete: 0,
            details: "openai quota_exceeded".to_string(),
        };
        db.insert_run(&run).await.unwrap();

        let runs = db.list_runs("w1", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run.id);
        assert_eq!(runs[0].status, RunStatus::Failure);
        assert_eq!(runs[0].deferred, 1);
        assert!(db.list_runs("w2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pruning_keeps_newest_per_instance() {
        let db = test_db().await;
        for i in 0..5 {
            db.append_activity(&ActivityEntry::info("w1", format!("entry {i}")))
                .await
                .unwrap();
        }
        db.append_activity(&ActivityEntry::info("w2", "untouched")).await.unwrap();

        assert_eq!(db.prune_activity("w1", 2).await.unwrap(), 3);
        let kept = db.list_activity(Some("w1"), 10).await.unwrap();
        let messages: Vec<&str> = kept.iter().map(|a| a.message.as_str()).collect();
        assert_eq!(messages, vec!["entry 4", "entry 3"]);
        assert_eq!(db.list_activity(Some("w2"), 10).await.unwrap().len(), 1);
        assert_eq!(db.prune_activity("w1", 2).await.unwrap(), 0);

        let base = Utc::now() - Duration::hours(1);
        for i in 0..4 {
            let started = base + Duration::minutes(i);
            db.insert_run(&RunRecord {
                id: Uuid::new_v4(),
                instance: "w1".to_string(),
                started_at: started,
                finished_at: started + Duration::seconds(1),
                duration_ms: 1000,
                status: RunStatus::Success,
                generated: i,
                failed: 0,
                skipped: 0,
                deferred: 0,
                incomplete: 0,
                details: String::new(),
            })
            .await
            .unwrap();
        }
        assert_eq!(db.prune_runs("w1", 3).await.unwrap(), 1);
        let runs = db.list_runs("w1", 10).await.unwrap();
        let generated: Vec<i64> = runs.iter().map(|r| r.generated).collect();
        assert_eq!(generated, vec![3, 2, 1]);
    }

    // ── Learners ────────────────────────────────────────────────────

    #[tokio::test]
    async fn active_users_exclude_inactive() {
        let db = test_db().await;
        let prefs = LearningPreferences::default();
        db.upsert_learner(&profile(3), &prefs, true).await.unwrap();
        db.upsert_learner(&profile(1), &prefs, true).await.unwrap();
        db.upsert_learner(&profile(2), &prefs, false).await.unwrap();

        assert_eq!(db.get_active_users().await.unwrap(), vec![1, 3]);
        let loaded = db.get_learning_preferences(1).await.unwrap().unwrap();
        assert_eq!(loaded, prefs);
        assert!(db.get_learning_preferences(99).await.unwrap().is_none());
        assert_eq!(db.get_learner_profile(3).await.unwrap().unwrap().username, "user3");
    }

    #[tokio::test]
    async fn weak_areas_and_history_from_attempts() {
        let db = test_db().await;
        let at = Utc::now() - Duration::days(2);
        for correct in [true, false, false] {
            db.record_topic_attempt(1, "italian", "A2", "verbs", correct, at)
                .await
                .unwrap();
        }
        for correct in [true, true, true, false] {
            db.record_topic_attempt(1, "italian", "A2", "food", correct, at)
                .await
                .unwrap();
        }

        let weak = db.get_weak_areas(1, 0.6, 5).await.unwrap();
        assert_eq!(weak, vec!["verbs".to_string()]);

        let history = db.get_topic_history(1, "italian", "A2").await.unwrap();
        assert_eq!(history.len(), 2);
        let food = history.iter().find(|h| h.topic == "food").unwrap();
        assert_eq!(food.attempts, 4);
        assert!((food.accuracy - 0.75).abs() < 1e-9);
        assert!(food.last_seen.is_some());
    }

    #[tokio::test]
    async fn daily_count_tracks_assignments() {
        let db = test_db().await;
        let question = GeneratedQuestion {
            language: "italian".to_string(),
            level: "A2".to_string(),
            topic: "food".to_string(),
            question_type: QuestionType::QuestionAnswer,
            content: serde_json::json!({"question": "?"}),
        };
        let id = db.save_question(&question).await.unwrap();
        db.assign_to_user(id, 1).await.unwrap();
        assert!(db.assign_to_user(id, 1).await.is_err());

        let today = Utc::now().date_naive();
        assert_eq!(db.get_daily_assigned_count(1, today).await.unwrap(), 1);
        assert_eq!(
            db.get_daily_assigned_count(1, today - Duration::days(1))
                .await
                .unwrap(),
            0
        );
        assert_eq!(db.get_daily_assigned_count(2, today).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn topics_catalog() {
        let db = test_db().await;
        db.add_topic("italian", "A2", "travel").await.unwrap();
        db.add_topic("italian", "A2", "food").await.unwrap();
        db.add_topic("italian", "A2", "food").await.unwrap();
        db.add_topic("spanish", "A2", "food").await.unwrap();
        assert_eq!(
            db.list_topics("italian", "A2").await.unwrap(),
            vec!["food".to_string(), "travel".to_string()]
        );
    }

    // ── Generation hints ────────────────────────────────────────────

    #[tokio::test]
    async fn hints_expire_and_clear() {
        let db = test_db().await;
        let now = Utc::now();
        db.set_generation_hint(1, QuestionType::ReadingComprehension, now + Duration::hours(1))
            .await
            .unwrap();
        db.set_generation_hint(1, QuestionType::FillInBlank, now - Duration::minutes(1))
            .await
            .unwrap();
        db.set_generation_hint(2, QuestionType::Vocabulary, now + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(
            db.get_active_hints(1, now).await.unwrap(),
            vec![QuestionType::ReadingComprehension]
        );

        // Refreshing an expired hint revives it; a shorter expiry never shortens one.
        db.set_generation_hint(1, QuestionType::FillInBlank, now + Duration::hours(2))
            .await
            .unwrap();
        db.set_generation_hint(1, QuestionType::ReadingComprehension, now)
            .await
            .unwrap();
        assert_eq!(db.get_active_hints(1, now).await.unwrap().len(), 2);

        assert!(db
            .clear_generation_hint(1, QuestionType::FillInBlank)
            .await
            .unwrap());
        assert!(!db
            .clear_generation_hint(1, QuestionType::FillInBlank)
            .await
            .unwrap());
        assert_eq!(
            db.get_active_hints(1, now).await.unwrap(),
            vec![QuestionType::ReadingComprehension]
        );
    }

    // ── Usage ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn usage_accumulates_per_month() {
        let db = test_db().await;
        db.record_usage(ProviderKind::Google, "2026-03", 1, 120).await.unwrap();
        db.record_usage(ProviderKind::Google, "2026-03", 2, 80).await.unwrap();
        db.record_usage(ProviderKind::Google, "2026-04", 1, 10).await.unwrap();

        let march = db.get_monthly_usage(ProviderKind::Google, "2026-03").await.unwrap();
        assert_eq!((march.requests, march.characters), (3, 200));
        let none = db.get_monthly_usage(ProviderKind::OpenAi, "2026-03").await.unwrap();
        assert_eq!(none.requests, 0);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("worker.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.set_setting("system", "global_pause", &serde_json::json!(true))
                .await
                .unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(
            db.get_setting("system", "global_pause").await.unwrap(),
            Some(serde_json::json!(true))
        );
    }
}
