//! Durable pause flags: global, per-user and per-instance.
//!
//! Global and per-user flags live in the `settings` table; the instance
//! flag lives on the instance's status row. The registry keeps a cache that
//! the coordinator refreshes at the start of every cycle. Writes made through
//! the registry go to the store first and then update the cache, so they are
//! visible to a dispatch already in progress.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::WorkerError;
use crate::store::Database;

/// Settings owner used for system-wide flags.
pub const SYSTEM_SETTINGS_USER: &str = "system";
/// Settings key for the global pause flag.
pub const GLOBAL_PAUSE_KEY: &str = "global_pause";
/// Settings key for a per-user pause flag (owner = user id).
pub const USER_PAUSE_KEY: &str = "worker_paused";

/// Snapshot of every pause flag relevant to one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PauseState {
    pub global_paused: bool,
    pub paused_users: BTreeSet<i64>,
    pub instance_paused: bool,
}

pub struct PauseRegistry {
    db: Arc<dyn Database>,
    instance: String,
    state: RwLock<PauseState>,
}

fn flag_set(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        serde_json::Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

impl PauseRegistry {
    pub fn new(db: Arc<dyn Database>, instance: impl Into<String>) -> Self {
        Self {
            db,
            instance: instance.into(),
            state: RwLock::new(PauseState::default()),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Reload every flag from the store. Failure leaves the cache untouched.
    pub async fn refresh(&self) -> Result<PauseState, WorkerError> {
        let global = self
            .db
            .get_setting(SYSTEM_SETTINGS_USER, GLOBAL_PAUSE_KEY)
            .await
            .map_err(|e| WorkerError::Pause(e.to_string()))?;

        let users = self
            .db
            .list_settings_by_key(USER_PAUSE_KEY)
            .await
            .map_err(|e| WorkerError::Pause(e.to_string()))?;

        let instance_paused = self
            .db
            .get_worker_status(&self.instance)
            .await
            .map_err(|e| WorkerError::Pause(e.to_string()))?
            .is_some_and(|s| s.pause_requested);

        let paused_users = users
            .into_iter()
            .filter(|(_, value)| flag_set(value))
            .filter_map(|(owner, _)| owner.parse::<i64>().ok())
            .collect();

        let fresh = PauseState {
            global_paused: global.as_ref().is_some_and(flag_set),
            paused_users,
            instance_paused,
        };
        *self.state.write().await = fresh.clone();
        Ok(fresh)
    }

    pub async fn snapshot(&self) -> PauseState {
        self.state.read().await.clone()
    }

    pub async fn is_globally_paused(&self) -> bool {
        self.state.read().await.global_paused
    }

    pub async fn is_user_paused(&self, user_id: i64) -> bool {
        self.state.read().await.paused_users.contains(&user_id)
    }

    pub async fn is_instance_paused(&self) -> bool {
        self.state.read().await.instance_paused
    }

    // ── Global ──────────────────────────────────────────────────────

    pub async fn pause_global(&self) -> Result<(), WorkerError> {
        self.set_global(true).await
    }

    pub async fn resume_global(&self) -> Result<(), WorkerError> {
        self.set_global(false).await
    }

    async fn set_global(&self, paused: bool) -> Result<(), WorkerError> {
        self.db
            .set_setting(
                SYSTEM_SETTINGS_USER,
                GLOBAL_PAUSE_KEY,
                &serde_json::Value::Bool(paused),
            )
            .await?;
        self.state.write().await.global_paused = paused;
        info!(paused, "Global pause updated");
        Ok(())
    }

    // ── Per user ────────────────────────────────────────────────────

    pub async fn pause_user(&self, user_id: i64) -> Result<(), WorkerError> {
        self.db
            .set_setting(
                &user_id.to_string(),
                USER_PAUSE_KEY,
                &serde_json::Value::Bool(true),
            )
            .await?;
        self.state.write().await.paused_users.insert(user_id);
        info!(user_id, "User generation paused");
        Ok(())
    }

    pub async fn resume_user(&self, user_id: i64) -> Result<(), WorkerError> {
        self.db
            .delete_setting(&user_id.to_string(), USER_PAUSE_KEY)
            .await?;
        self.state.write().await.paused_users.remove(&user_id);
        info!(user_id, "User generation resumed");
        Ok(())
    }

    // ── Instance ────────────────────────────────────────────────────

    pub async fn pause_instance(&self) -> Result<(), WorkerError> {
        self.set_instance(true).await
    }

    pub async fn resume_instance(&self) -> Result<(), WorkerError> {
        self.set_instance(false).await
    }

    async fn set_instance(&self, paused: bool) -> Result<(), WorkerError> {
        self.db.set_instance_pause(&self.instance, paused).await?;
        self.state.write().await.instance_paused = paused;
        info!(instance = %self.instance, paused, "Instance pause updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn registry() -> (Arc<dyn Database>, PauseRegistry) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = PauseRegistry::new(Arc::clone(&db), "w1");
        (db, registry)
    }

    #[tokio::test]
    async fn writes_update_cache_immediately() {
        let (_db, registry) = registry().await;
        assert!(!registry.is_globally_paused().await);

        registry.pause_global().await.unwrap();
        registry.pause_user(42).await.unwrap();
        registry.pause_instance().await.unwrap();
        assert!(registry.is_globally_paused().await);
        assert!(registry.is_user_paused(42).await);
        assert!(!registry.is_user_paused(7).await);
        assert!(registry.is_instance_paused().await);

        registry.resume_user(42).await.unwrap();
        registry.resume_global().await.unwrap();
        assert!(!registry.is_user_paused(42).await);
        assert!(!registry.is_globally_paused().await);
    }

    #[tokio::test]
    async fn flags_survive_a_new_registry() {
        let (db, registry) = registry().await;
        registry.pause_global().await.unwrap();
        registry.pause_user(3).await.unwrap();
        registry.pause_instance().await.unwrap();

        let reopened = PauseRegistry::new(db, "w1");
        assert_eq!(reopened.snapshot().await, PauseState::default());
        let state = reopened.refresh().await.unwrap();
        assert!(state.global_paused);
        assert!(state.instance_paused);
        assert_eq!(state.paused_users.into_iter().collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn instance_flag_is_per_instance() {
        let (db, registry) = registry().await;
        registry.pause_instance().await.unwrap();

        let other = PauseRegistry::new(db, "w2");
        assert!(!other.refresh().await.unwrap().instance_paused);
    }

    #[tokio::test]
    async fn refresh_picks_up_external_writes() {
        let (db, registry) = registry().await;
        db.set_setting("9", USER_PAUSE_KEY, &serde_json::json!("true"))
            .await
            .unwrap();
        db.set_setting("10", USER_PAUSE_KEY, &serde_json::json!(false))
            .await
            .unwrap();
        db.set_setting("not-a-user", USER_PAUSE_KEY, &serde_json::json!(true))
            .await
            .unwrap();

        let state = registry.refresh().await.unwrap();
        assert!(state.paused_users.contains(&9));
        assert!(!state.paused_users.contains(&10));
        assert_eq!(state.paused_users.len(), 1);
    }
}
