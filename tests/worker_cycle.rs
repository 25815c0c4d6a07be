//! End-to-end cycles against an in-memory store.
//!
//! Each test seeds learners and topics, runs one or more coordinator cycles
//! with a stub generator, and checks outcomes, persisted questions and the
//! operator-facing records.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use quizgen_worker::ai::{GeneratedQuestion, GenerationRequest, ProviderKind, QuestionGenerator};
use quizgen_worker::config::WorkerConfig;
use quizgen_worker::error::{ErrorKind, GenerationError};
use quizgen_worker::store::{Database, LearnerProfile, LibSqlBackend};
use quizgen_worker::worker::model::{LearningPreferences, OutcomeStatus, SkipReason};
use quizgen_worker::worker::status::ActivityLevel;
use quizgen_worker::worker::{CoordinatorState, CycleResult, DispatchReport, WorkerCoordinator, WorkerHandle};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const TOPICS: [&str; 4] = ["greetings", "numbers", "past tense", "weather"];

fn question(request: &GenerationRequest) -> GeneratedQuestion {
    GeneratedQuestion {
        language: request.language.clone(),
        level: request.level.clone(),
        topic: request.topic.clone(),
        question_type: request.question_type,
        content: serde_json::json!({
            "question": format!("Quiz about {}", request.topic),
            "answer": "42",
        }),
    }
}

/// OpenAI reports an exhausted account; every other provider succeeds.
#[derive(Default)]
struct QuotaLimitedGenerator {
    calls: Mutex<HashMap<ProviderKind, usize>>,
}

impl QuotaLimitedGenerator {
    fn calls(&self, provider: ProviderKind) -> usize {
        self.calls.lock().unwrap().get(&provider).copied().unwrap_or(0)
    }
}

#[async_trait]
impl QuestionGenerator for QuotaLimitedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedQuestion, GenerationError> {
        let provider = request.provider.kind;
        *self.calls.lock().unwrap().entry(provider).or_default() += 1;
        if provider == ProviderKind::OpenAi {
            return Err(GenerationError::new(
                provider,
                ErrorKind::QuotaExceeded,
                "insufficient_quota",
            ));
        }
        Ok(question(request))
    }
}

/// Rate-limits the first attempt for every topic.
#[derive(Default)]
struct FlakyGenerator {
    seen: Mutex<HashSet<(i64, String)>>,
    calls: Mutex<usize>,
}

#[async_trait]
impl QuestionGenerator for FlakyGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedQuestion, GenerationError> {
        *self.calls.lock().unwrap() += 1;
        let first = self
            .seen
            .lock()
            .unwrap()
            .insert((request.user_id, request.topic.clone()));
        if first {
            return Err(GenerationError::new(
                request.provider.kind,
                ErrorKind::RateLimited,
                "429 too many requests",
            ));
        }
        Ok(question(request))
    }
}

/// Pauses one learner through the admin handle on its first call.
struct PausingGenerator {
    handle: OnceLock<WorkerHandle>,
    pause_user: i64,
}

#[async_trait]
impl QuestionGenerator for PausingGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedQuestion, GenerationError> {
        if let Some(handle) = self.handle.get() {
            if !handle.pause().is_user_paused(self.pause_user).await {
                handle
                    .pause()
                    .pause_user(self.pause_user)
                    .await
                    .expect("pause user");
            }
        }
        Ok(question(request))
    }
}

fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig {
        instance: "it-worker".to_string(),
        cycle_interval: Duration::from_secs(3600),
        heartbeat_interval: Duration::from_millis(50),
        admin_port: None,
        ..Default::default()
    };
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config.retry.jitter = 0.0;
    config
}

async fn seed_store() -> Arc<dyn Database> {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    for topic in TOPICS {
        db.add_topic("german", "A1", topic).await.unwrap();
    }
    db
}

async fn seed_learner(db: &dyn Database, user_id: i64, provider: &str, daily_goal: i64) {
    let profile = LearnerProfile {
        user_id,
        username: format!("learner{user_id}"),
        language: "german".to_string(),
        level: "A1".to_string(),
        ai_provider: provider.to_string(),
        ai_model: String::new(),
        ai_api_key: (provider != "ollama").then(|| "sk-test".to_string()),
    };
    let preferences = LearningPreferences {
        daily_goal,
        ..Default::default()
    };
    db.upsert_learner(&profile, &preferences, true).await.unwrap();
}

fn completed(result: CycleResult) -> DispatchReport {
    match result {
        CycleResult::Completed(report) => report,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

fn statuses_for(report: &DispatchReport, user_id: i64) -> Vec<OutcomeStatus> {
    report
        .outcomes
        .iter()
        .filter(|o| o.item.user_id == user_id)
        .map(|o| o.status)
        .collect()
}

#[tokio::test]
async fn quota_exhaustion_stops_one_provider_only() {
    timeout(TEST_TIMEOUT, async {
        let db = seed_store().await;
        seed_learner(db.as_ref(), 1, "openai", 3).await;
        seed_learner(db.as_ref(), 2, "ollama", 3).await;

        let mut config = test_config();
        config.limiter.max_per_provider.insert(ProviderKind::OpenAi, 1);
        let generator = Arc::new(QuotaLimitedGenerator::default());
        let coordinator = WorkerCoordinator::new(config, Arc::clone(&db), generator.clone())
            .await
            .unwrap();

        let report = completed(coordinator.run_cycle(&CancellationToken::new()).await);

        // One OpenAI call discovers the quota; the rest never reach the provider.
        assert_eq!(generator.calls(ProviderKind::OpenAi), 1);
        let openai = statuses_for(&report, 1);
        assert_eq!(openai.len(), 3);
        assert_eq!(openai.iter().filter(|s| **s == OutcomeStatus::Failed).count(), 1);
        assert_eq!(
            openai
                .iter()
                .filter(|s| **s == OutcomeStatus::Skipped(SkipReason::ProviderExhausted))
                .count(),
            2
        );
        let failed = report
            .outcomes
            .iter()
            .find(|o| o.status == OutcomeStatus::Failed)
            .unwrap();
        assert_eq!(failed.error_kind, Some(ErrorKind::QuotaExceeded));

        assert_eq!(statuses_for(&report, 2), vec![OutcomeStatus::Succeeded; 3]);
        assert_eq!(report.counters.succeeded, 3);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.skipped, 2);

        let today = Utc::now().date_naive();
        assert_eq!(db.get_daily_assigned_count(2, today).await.unwrap(), 3);
        assert_eq!(db.get_daily_assigned_count(1, today).await.unwrap(), 0);

        let month = Utc::now().format("%Y-%m").to_string();
        let usage = db.get_monthly_usage(ProviderKind::Ollama, &month).await.unwrap();
        assert_eq!(usage.requests, 3);

        let handle = coordinator.handle();
        let status = handle.status().await.unwrap();
        assert_eq!(status.total_questions_generated, 3);
        assert_eq!(status.total_runs, 1);
        assert!(status.last_run_error.is_some());

        let runs = handle.runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].generated, 3);
        assert_eq!(runs[0].failed, 1);

        let activity = handle.activity(50).await.unwrap();
        assert!(
            activity
                .iter()
                .any(|e| e.level == ActivityLevel::Error && e.user_id == Some(1))
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn transient_failures_are_retried_within_the_cycle() {
    timeout(TEST_TIMEOUT, async {
        let db = seed_store().await;
        seed_learner(db.as_ref(), 7, "ollama", 2).await;

        let generator = Arc::new(FlakyGenerator::default());
        let coordinator = WorkerCoordinator::new(test_config(), Arc::clone(&db), generator.clone())
            .await
            .unwrap();

        let report = completed(coordinator.run_cycle(&CancellationToken::new()).await);
        assert_eq!(report.counters.succeeded, 2);
        assert_eq!(report.counters.failed, 0);
        assert!(report.outcomes.iter().all(|o| o.attempts == 2));
        assert_eq!(*generator.calls.lock().unwrap(), 4);

        let activity = coordinator.handle().activity(50).await.unwrap();
        assert!(
            activity
                .iter()
                .any(|e| e.level == ActivityLevel::Warn && e.message.contains("Retrying"))
        );

        // The daily goal is met, so the next cycle has nothing to do.
        let report = completed(coordinator.run_cycle(&CancellationToken::new()).await);
        assert_eq!(report.counters.total(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn global_pause_holds_until_resumed() {
    timeout(TEST_TIMEOUT, async {
        let db = seed_store().await;
        seed_learner(db.as_ref(), 3, "ollama", 2).await;

        let generator = Arc::new(QuotaLimitedGenerator::default());
        let coordinator = WorkerCoordinator::new(test_config(), Arc::clone(&db), generator.clone())
            .await
            .unwrap();
        let handle = coordinator.handle();

        handle.pause().pause_global().await.unwrap();
        let result = coordinator.run_cycle(&CancellationToken::new()).await;
        assert!(matches!(result, CycleResult::Paused));
        assert_eq!(handle.state().await, CoordinatorState::Paused);
        assert_eq!(generator.calls(ProviderKind::Ollama), 0);
        assert!(handle.status().await.unwrap().is_paused);

        handle.pause().resume_global().await.unwrap();
        let report = completed(coordinator.run_cycle(&CancellationToken::new()).await);
        assert_eq!(report.counters.succeeded, 2);
        assert_eq!(handle.state().await, CoordinatorState::Idle);
        assert!(!handle.status().await.unwrap().is_paused);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn user_paused_mid_cycle_gets_no_new_items() {
    timeout(TEST_TIMEOUT, async {
        let db = seed_store().await;
        seed_learner(db.as_ref(), 1, "ollama", 3).await;
        seed_learner(db.as_ref(), 2, "ollama", 3).await;

        // One call at a time, so the pause lands between launches.
        let mut config = test_config();
        config.limiter.max_total = 1;
        let generator = Arc::new(PausingGenerator {
            handle: OnceLock::new(),
            pause_user: 2,
        });
        let coordinator = WorkerCoordinator::new(config, Arc::clone(&db), generator.clone())
            .await
            .unwrap();
        let handle = coordinator.handle();
        assert!(generator.handle.set(handle.clone()).is_ok());

        let report = completed(coordinator.run_cycle(&CancellationToken::new()).await);

        assert_eq!(statuses_for(&report, 1), vec![OutcomeStatus::Succeeded; 3]);
        let paused = statuses_for(&report, 2);
        let succeeded = paused
            .iter()
            .filter(|s| **s == OutcomeStatus::Succeeded)
            .count();
        let skipped = paused
            .iter()
            .filter(|s| **s == OutcomeStatus::Skipped(SkipReason::UserPaused))
            .count();
        assert!(succeeded <= 1);
        assert_eq!(succeeded + skipped, 3);

        // The flag is durable and still set for the next cycle.
        assert_eq!(
            db.get_setting("2", "worker_paused").await.unwrap(),
            Some(serde_json::json!(true))
        );
        let report = completed(coordinator.run_cycle(&CancellationToken::new()).await);
        assert!(report.outcomes.iter().all(|o| o.item.user_id != 2));
    })
    .await
    .expect("test timed out");
}
