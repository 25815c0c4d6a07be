//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "worker_state",
        sql: r#"
            CREATE TABLE IF NOT EXISTS settings (
                user_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (user_id, key)
            );
            CREATE INDEX IF NOT EXISTS idx_settings_key ON settings(key);

            CREATE TABLE IF NOT EXISTS worker_status (
                instance TEXT PRIMARY KEY,
                is_running INTEGER NOT NULL DEFAULT 0,
                is_paused INTEGER NOT NULL DEFAULT 0,
                pause_requested INTEGER NOT NULL DEFAULT 0,
                current_activity TEXT NOT NULL DEFAULT 'idle',
                last_heartbeat TEXT,
                last_run_start TEXT,
                last_run_finish TEXT,
                last_run_error TEXT,
                total_questions_generated INTEGER NOT NULL DEFAULT 0,
                total_runs INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS worker_activity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                user_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_worker_activity_instance
                ON worker_activity(instance, timestamp);

            CREATE TABLE IF NOT EXISTS worker_runs (
                id TEXT PRIMARY KEY,
                instance TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                generated INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                deferred INTEGER NOT NULL DEFAULT 0,
                incomplete INTEGER NOT NULL DEFAULT 0,
                details TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_worker_runs_instance ON worker_runs(instance, started_at);
        "#,
    },
    Migration {
        version: 2,
        name: "learner_collaborators",
        sql: r#"
            CREATE TABLE IF NOT EXISTS learners (
                user_id INTEGER PRIMARY KEY,
                username TEXT NOT NULL,
                language TEXT NOT NULL,
                level TEXT NOT NULL,
                ai_provider TEXT NOT NULL DEFAULT '',
                ai_model TEXT NOT NULL DEFAULT '',
                ai_api_key TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS learning_preferences (
                user_id INTEGER PRIMARY KEY REFERENCES learners(user_id) ON DELETE CASCADE,
                daily_goal INTEGER NOT NULL,
                focus_on_weak_areas INTEGER NOT NULL,
                fresh_question_ratio REAL NOT NULL,
                known_question_penalty REAL NOT NULL,
                review_interval_days INTEGER NOT NULL,
                weak_area_boost REAL NOT NULL,
                daily_reminder_enabled INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS topic_performance (
                user_id INTEGER NOT NULL,
                language TEXT NOT NULL,
                level TEXT NOT NULL,
                topic TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                correct INTEGER NOT NULL DEFAULT 0,
                last_seen TEXT,
                PRIMARY KEY (user_id, language, level, topic)
            );

            CREATE TABLE IF NOT EXISTS topics (
                language TEXT NOT NULL,
                level TEXT NOT NULL,
                topic TEXT NOT NULL,
                PRIMARY KEY (language, level, topic)
            );

            CREATE TABLE IF NOT EXISTS questions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                language TEXT NOT NULL,
                level TEXT NOT NULL,
                topic TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_questions (
                user_id INTEGER NOT NULL,
                question_id INTEGER NOT NULL REFERENCES questions(id) ON DELETE CASCADE,
                assigned_at TEXT NOT NULL,
                PRIMARY KEY (user_id, question_id)
            );
            CREATE INDEX IF NOT EXISTS idx_user_questions_assigned
                ON user_questions(user_id, assigned_at);

            CREATE TABLE IF NOT EXISTS usage_stats (
                provider TEXT NOT NULL,
                month TEXT NOT NULL,
                requests INTEGER NOT NULL DEFAULT 0,
                characters INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (provider, month)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "question_types_and_hints",
        sql: r#"
            ALTER TABLE questions ADD COLUMN question_type TEXT NOT NULL DEFAULT 'vocabulary';

            CREATE TABLE IF NOT EXISTS generation_hints (
                user_id INTEGER NOT NULL,
                question_type TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, question_type)
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "settings",
            "worker_status",
            "worker_activity",
            "worker_runs",
            "learners",
            "learning_preferences",
            "topic_performance",
            "topics",
            "questions",
            "user_questions",
            "usage_stats",
            "generation_hints",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn migration_future_can_be_spawned() {
        let conn = test_conn().await;
        let fut = run_migrations(&conn);
        assert_send(&fut);
        fut.await.unwrap();

        let conn = test_conn().await;
        tokio::spawn(async move { run_migrations(&conn).await })
            .await
            .unwrap()
            .unwrap();
    }
}
