//! Worker coordinator: the control loop of one worker instance.
//!
//! Wakes on a fixed ticker or a manual trigger, checks the pause flags,
//! builds a ranked queue for every active user and hands it to the
//! dispatcher. A separate heartbeat task proves the instance is alive
//! whether or not a cycle is running. Status writes for the instance go
//! through a single mutex so concurrent updates cannot lose each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ai::{ProviderConfig, QuestionGenerator, QuestionType};
use crate::config::{UserBackoffConfig, WorkerConfig};
use crate::error::{ConfigError, DatabaseError, WorkerError};
use crate::store::{Database, LearnerProfile};
use crate::worker::dispatcher::{DispatchCounters, DispatchReport, GenerationDispatcher};
use crate::worker::limiter::{AiConcurrencyLimiter, LimiterSnapshot};
use crate::worker::model::{
    GenerationOutcome, LearningPreferences, OutcomeStatus, ReasonTag, TopicHistory, WorkItem,
};
use crate::worker::pause::{PauseRegistry, PauseState};
use crate::worker::priority::{
    PriorityDistribution, PriorityScorer, ScoringInput, WeakArea, distribution, rank_queue,
};
use crate::worker::quota::{ProviderUsage, QuotaGuard};
use crate::worker::state::{CoordinatorState, StateMachine, StateTransition};
use crate::worker::status::{
    ActivityEntry, RunRecord, RunStatus, WorkerHealth, WorkerStatus, summarize_errors,
};

/// Answer to a manual "run now" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAck {
    /// A cycle will start as soon as the loop wakes.
    Accepted,
    /// Folded into the running cycle or an already pending trigger.
    Coalesced,
    /// The coordinator has stopped.
    Rejected,
}

/// What one call to [`WorkerCoordinator::run_cycle`] did.
#[derive(Debug)]
pub enum CycleResult {
    /// A pause flag was set; nothing was dispatched.
    Paused,
    Completed(DispatchReport),
    /// Cycle-fatal error, already recorded in status and run history.
    Failed(String),
}

/// Why a user's queue could not be built.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("user {0} not found")]
    UnknownUser(i64),

    #[error("invalid provider settings: {0}")]
    InvalidProvider(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Everything the scorer saw for one user, plus its output.
#[derive(Debug, Clone)]
pub struct UserPlan {
    pub profile: LearnerProfile,
    pub preferences: LearningPreferences,
    pub weak_areas: Vec<String>,
    pub history: Vec<TopicHistory>,
    pub assigned_today: i64,
    /// Unexpired generation hints, oldest first.
    pub hints: Vec<QuestionType>,
    pub items: Vec<WorkItem>,
}

/// Load a user's inputs and score them.
pub async fn plan_user(
    db: &dyn Database,
    scorer: &PriorityScorer,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<UserPlan, PlanError> {
    let profile = db
        .get_learner_profile(user_id)
        .await?
        .ok_or(PlanError::UnknownUser(user_id))?;
    let provider = ProviderConfig::parse(
        &profile.ai_provider,
        &profile.ai_model,
        profile.ai_api_key.as_deref(),
    )?;

    let preferences = db
        .get_learning_preferences(user_id)
        .await?
        .unwrap_or_default();
    let scoring = scorer.config();
    let weak_areas = db
        .get_weak_areas(user_id, scoring.weak_accuracy_threshold, scoring.weak_area_limit)
        .await?;
    let history = db
        .get_topic_history(user_id, &profile.language, &profile.level)
        .await?;
    let catalog = db.list_topics(&profile.language, &profile.level).await?;
    let assigned_today = db
        .get_daily_assigned_count(user_id, now.date_naive())
        .await?;
    let hints = db.get_active_hints(user_id, now).await?;
    let question_types = QuestionType::ordered_with_hints(&hints);

    let items = scorer.score_user(
        &ScoringInput {
            user_id,
            language: &profile.language,
            level: &profile.level,
            provider: &provider,
            preferences: &preferences,
            weak_areas: &weak_areas,
            history: &history,
            catalog: &catalog,
            assigned_today,
            question_types: &question_types,
        },
        now,
    );

    Ok(UserPlan {
        profile,
        preferences,
        weak_areas,
        history,
        assigned_today,
        hints,
        items,
    })
}

/// One entry of a user's queue, as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedTopic {
    pub topic: String,
    pub question_type: QuestionType,
    pub score: f64,
    pub reasons: Vec<ReasonTag>,
}

/// Priority analytics for one user.
#[derive(Debug, Clone, Serialize)]
pub struct UserPriorityReport {
    pub user_id: i64,
    pub paused: bool,
    pub daily_goal: i64,
    pub assigned_today: i64,
    pub hints: Vec<QuestionType>,
    /// Set while failed cycles keep the user out of planning.
    pub backoff_until: Option<DateTime<Utc>>,
    pub queue: Vec<QueuedTopic>,
    pub distribution: PriorityDistribution,
    pub weak_areas: Vec<WeakArea>,
}

/// Consecutive failed cycles for one user.
#[derive(Debug, Clone, Copy)]
struct UserFailure {
    consecutive: u32,
    next_retry: DateTime<Utc>,
}

/// Users whose last cycles failed, with the time they may be planned again.
struct FailureTracker {
    config: UserBackoffConfig,
    users: Mutex<HashMap<i64, UserFailure>>,
}

impl FailureTracker {
    fn new(config: UserBackoffConfig) -> Self {
        Self {
            config,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// The failure record if the user is still backing off at `now`.
    async fn blocking(&self, user_id: i64, now: DateTime<Utc>) -> Option<UserFailure> {
        self.users
            .lock()
            .await
            .get(&user_id)
            .filter(|f| f.next_retry > now)
            .copied()
    }

    async fn record_failure(&self, user_id: i64, now: DateTime<Utc>) -> UserFailure {
        let mut users = self.users.lock().await;
        let entry = users.entry(user_id).or_insert(UserFailure {
            consecutive: 0,
            next_retry: now,
        });
        entry.consecutive = entry.consecutive.saturating_add(1);
        let delay = self.config.delay_for(entry.consecutive);
        entry.next_retry = later(now, delay);
        *entry
    }

    /// Forget the user's failures; returns how many there were.
    async fn reset(&self, user_id: i64) -> u32 {
        self.users
            .lock()
            .await
            .remove(&user_id)
            .map(|f| f.consecutive)
            .unwrap_or(0)
    }
}

/// What planning produced for one cycle.
#[derive(Default)]
struct CyclePlan {
    queue: Vec<WorkItem>,
    errors: Vec<String>,
    hints: HashMap<i64, Vec<QuestionType>>,
    /// Users whose planning hit a database error.
    failed_users: HashSet<i64>,
}

/// State shared between the loop, the heartbeat task and handles.
struct Shared {
    instance: String,
    db: Arc<dyn Database>,
    pause: Arc<PauseRegistry>,
    limiter: Arc<AiConcurrencyLimiter>,
    quota: Arc<QuotaGuard>,
    failures: FailureTracker,
    scorer: PriorityScorer,
    heartbeat_stale_after: Duration,
    machine: Mutex<StateMachine>,
    status: Mutex<WorkerStatus>,
    trigger: Notify,
    trigger_pending: AtomicBool,
}

impl Shared {
    async fn transition(&self, target: CoordinatorState, reason: &str) -> Result<(), WorkerError> {
        let mut machine = self.machine.lock().await;
        let from = machine.state();
        machine.transition_to(target, Some(reason.to_string()))?;
        debug!(instance = %self.instance, %from, to = %target, reason, "State transition");
        Ok(())
    }

    /// Apply `f` to the status row and persist it while holding the lock.
    async fn update_status(&self, f: impl FnOnce(&mut WorkerStatus)) -> WorkerStatus {
        let mut status = self.status.lock().await;
        f(&mut status);
        if let Err(e) = self.db.upsert_worker_status(&status).await {
            warn!(instance = %self.instance, error = %e, "Failed to persist worker status");
        }
        status.clone()
    }

    async fn log_activity(&self, entry: ActivityEntry) {
        if let Err(e) = self.db.append_activity(&entry).await {
            warn!(error = %e, "Failed to append activity entry");
        }
    }
}

pub struct WorkerCoordinator {
    config: WorkerConfig,
    shared: Arc<Shared>,
    dispatcher: GenerationDispatcher,
}

impl WorkerCoordinator {
    /// Build a coordinator. Counters carry over from the instance's
    /// existing status row.
    pub async fn new(
        config: WorkerConfig,
        db: Arc<dyn Database>,
        generator: Arc<dyn QuestionGenerator>,
    ) -> Result<Self, WorkerError> {
        let limiter = Arc::new(AiConcurrencyLimiter::new(&config.limiter)?);
        let pause = Arc::new(PauseRegistry::new(Arc::clone(&db), config.instance.clone()));
        let quota = Arc::new(QuotaGuard::new(config.quota.clone(), Arc::clone(&db)));
        let dispatcher = GenerationDispatcher::new(
            generator,
            Arc::clone(&limiter),
            Arc::clone(&pause),
            Arc::clone(&quota),
            Arc::clone(&db),
            config.retry.clone(),
            config.call_timeout,
            config.instance.clone(),
        );

        let mut status = db
            .get_worker_status(&config.instance)
            .await?
            .unwrap_or_else(|| WorkerStatus::new(config.instance.clone()));
        status.is_running = false;
        status.is_paused = false;
        status.current_activity = "idle".to_string();

        let shared = Arc::new(Shared {
            instance: config.instance.clone(),
            db,
            pause,
            limiter,
            quota,
            failures: FailureTracker::new(config.user_backoff.clone()),
            scorer: PriorityScorer::new(config.scoring.clone()),
            heartbeat_stale_after: config.heartbeat_stale_after,
            machine: Mutex::new(StateMachine::new()),
            status: Mutex::new(status),
            trigger: Notify::new(),
            trigger_pending: AtomicBool::new(false),
        });

        Ok(Self {
            config,
            shared,
            dispatcher,
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The first cycle starts immediately. A cycle in progress when shutdown
    /// arrives finishes its in-flight calls before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let shared = &self.shared;

        if self.config.start_paused {
            shared.pause.pause_global().await?;
            shared
                .log_activity(ActivityEntry::info(
                    &shared.instance,
                    "Started with generation paused",
                ))
                .await;
        }

        shared
            .update_status(|s| {
                s.is_running = true;
                s.current_activity = "idle".to_string();
            })
            .await;
        if let Err(e) = shared.db.touch_heartbeat(&shared.instance, Utc::now()).await {
            warn!(error = %e, "Initial heartbeat failed");
        }
        shared
            .log_activity(ActivityEntry::info(&shared.instance, "Worker started"))
            .await;
        info!(
            instance = %shared.instance,
            cycle_interval = ?self.config.cycle_interval,
            heartbeat_interval = ?self.config.heartbeat_interval,
            "Worker coordinator started"
        );

        // Outlives `shutdown` so the instance stays healthy while
        // in-flight calls drain.
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = spawn_heartbeat(
            Arc::clone(shared),
            self.config.heartbeat_interval,
            heartbeat_stop.clone(),
        );

        let mut ticker = tokio::time::interval(self.config.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => debug!("Cycle tick"),
                _ = shared.trigger.notified() => info!("Manual trigger"),
            }
            self.run_cycle(&shutdown).await;
        }

        let stopped = self.stop().await;
        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
        stopped
    }

    /// Run one cycle from Idle or Paused.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> CycleResult {
        let shared = &self.shared;
        // This cycle serves any pending trigger. Drop its stored permit
        // too, in case the loop woke on the ticker instead.
        if shared.trigger_pending.swap(false, Ordering::SeqCst) {
            let _ = shared.trigger.notified().now_or_never();
        }

        if let Err(e) = shared
            .transition(CoordinatorState::Running, "cycle start")
            .await
        {
            warn!(error = %e, "Cycle not started");
            return CycleResult::Failed(e.to_string());
        }
        let started = Utc::now();

        let pause = match shared.pause.refresh().await {
            Ok(pause) => pause,
            Err(e) => return self.fail_cycle(started, e).await,
        };
        if pause.global_paused || pause.instance_paused {
            self.enter_paused(&pause).await;
            return CycleResult::Paused;
        }

        shared
            .update_status(|s| {
                s.is_paused = false;
                s.current_activity = "planning".to_string();
                s.last_run_start = Some(started);
            })
            .await;

        let cycle = CancellationToken::new();
        spawn_watchdog(cycle.clone(), self.config.max_cycle_duration);

        let CyclePlan {
            queue,
            mut errors,
            hints,
            failed_users,
        } = match self.build_queue(&cycle).await {
            Ok(built) => built,
            Err(e) => {
                cycle.cancel();
                return self.fail_cycle(started, e).await;
            }
        };

        let queued = queue.len();
        shared
            .update_status(|s| s.current_activity = format!("generating {queued} item(s)"))
            .await;

        let report = self.dispatcher.dispatch(queue, shutdown, &cycle).await;
        let watchdog_fired = cycle.is_cancelled();
        cycle.cancel();
        self.settle_users(&report.outcomes, &hints, &failed_users).await;

        errors.extend(report.terminal_errors.iter().cloned());
        if watchdog_fired {
            let err = WorkerError::Watchdog(self.config.max_cycle_duration);
            error!(instance = %shared.instance, error = %err, "Cycle watchdog fired");
            shared
                .log_activity(ActivityEntry::error(&shared.instance, err.to_string()))
                .await;
            errors.push(err.to_string());
        }

        let finished = Utc::now();
        let counters = report.counters;
        let last_error = summarize_errors(&errors);
        shared
            .update_status(|s| {
                s.last_run_finish = Some(finished);
                s.total_runs += 1;
                s.total_questions_generated += counters.succeeded as i64;
                s.last_run_error = last_error.clone();
                s.current_activity = "idle".to_string();
            })
            .await;

        let summary = format!(
            "Cycle finished: {} queued, {} generated, {} failed, {} skipped, {} deferred, {} incomplete",
            queued,
            counters.succeeded,
            counters.failed,
            counters.skipped,
            counters.deferred,
            counters.incomplete
        );
        let run_status = if watchdog_fired {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };
        let details = match &last_error {
            Some(err) => format!("{summary}. Errors: {err}"),
            None => summary.clone(),
        };
        shared
            .log_activity(ActivityEntry::info(&shared.instance, summary))
            .await;
        self.record_run(started, finished, run_status, &counters, details)
            .await;
        info!(
            instance = %shared.instance,
            queued,
            generated = counters.succeeded,
            failed = counters.failed,
            "Cycle complete"
        );

        if let Err(e) = shared.transition(CoordinatorState::Idle, "cycle done").await {
            warn!(error = %e, "Unexpected state after cycle");
        }
        CycleResult::Completed(report)
    }

    /// Ranked queue across all active, unpaused users that are not backing
    /// off. Per-user problems are logged and returned as error messages;
    /// only losing the user list is fatal.
    async fn build_queue(&self, cycle: &CancellationToken) -> Result<CyclePlan, WorkerError> {
        let shared = &self.shared;
        let users = shared.db.get_active_users().await?;
        let now = Utc::now();
        let mut plan = CyclePlan::default();

        for user_id in users {
            if cycle.is_cancelled() {
                break;
            }
            if shared.pause.is_user_paused(user_id).await {
                debug!(user_id, "User paused, not planning");
                continue;
            }
            if let Some(failure) = shared.failures.blocking(user_id, now).await {
                let wait = failure.next_retry.signed_duration_since(now).num_seconds().max(1);
                debug!(user_id, failures = failure.consecutive, wait_secs = wait, "User backing off");
                shared
                    .log_activity(
                        ActivityEntry::info(
                            &shared.instance,
                            format!(
                                "Skipping due to backoff (failure #{}, retry in {wait}s)",
                                failure.consecutive
                            ),
                        )
                        .with_user(user_id),
                    )
                    .await;
                continue;
            }

            match plan_user(shared.db.as_ref(), &shared.scorer, user_id, now).await {
                Ok(user_plan) => {
                    debug!(user_id, items = user_plan.items.len(), "User planned");
                    if !user_plan.hints.is_empty() {
                        plan.hints.insert(user_id, user_plan.hints);
                    }
                    plan.queue.extend(user_plan.items);
                }
                Err(PlanError::UnknownUser(_)) => {
                    debug!(user_id, "Active user has no learner profile");
                }
                Err(PlanError::InvalidProvider(e)) => {
                    warn!(user_id, error = %e, "Skipping user with invalid provider settings");
                    shared
                        .log_activity(
                            ActivityEntry::warn(
                                &shared.instance,
                                format!("Skipped: invalid AI provider settings ({e})"),
                            )
                            .with_user(user_id),
                        )
                        .await;
                }
                Err(PlanError::Database(e)) => {
                    warn!(user_id, error = %e, "Failed to load user for planning");
                    plan.errors.push(format!("user {user_id}: {e}"));
                    plan.failed_users.insert(user_id);
                }
            }
        }

        rank_queue(&mut plan.queue);
        Ok(plan)
    }

    /// Per-user bookkeeping after dispatch: reset or extend failure backoff
    /// and clear hints whose question type was generated.
    async fn settle_users(
        &self,
        outcomes: &[GenerationOutcome],
        hints: &HashMap<i64, Vec<QuestionType>>,
        failed_users: &HashSet<i64>,
    ) {
        let shared = &self.shared;
        let mut succeeded: HashSet<i64> = HashSet::new();
        let mut failed: HashSet<i64> = failed_users.clone();
        let mut fulfilled: HashSet<(i64, QuestionType)> = HashSet::new();
        for outcome in outcomes {
            let user_id = outcome.item.user_id;
            match outcome.status {
                OutcomeStatus::Succeeded => {
                    succeeded.insert(user_id);
                    if hints
                        .get(&user_id)
                        .is_some_and(|h| h.contains(&outcome.item.question_type))
                    {
                        fulfilled.insert((user_id, outcome.item.question_type));
                    }
                }
                OutcomeStatus::Failed => {
                    failed.insert(user_id);
                }
                _ => {}
            }
        }

        for user_id in &succeeded {
            let previous = shared.failures.reset(*user_id).await;
            if previous > 0 {
                info!(user_id, previous_failures = previous, "User succeeded after failures, backoff reset");
            }
        }
        let now = Utc::now();
        for user_id in &failed {
            let failure = shared.failures.record_failure(*user_id, now).await;
            info!(
                user_id,
                failures = failure.consecutive,
                retry_at = %failure.next_retry,
                "User failure recorded"
            );
        }
        for (user_id, question_type) in fulfilled {
            match shared.db.clear_generation_hint(user_id, question_type).await {
                Ok(_) => debug!(user_id, %question_type, "Generation hint fulfilled"),
                Err(e) => warn!(user_id, %question_type, error = %e, "Failed to clear generation hint"),
            }
        }
    }

    async fn enter_paused(&self, pause: &PauseState) {
        let shared = &self.shared;
        let scope = if pause.global_paused {
            "global"
        } else {
            "instance"
        };
        let mut was_paused = false;
        shared
            .update_status(|s| {
                was_paused = s.is_paused;
                s.is_paused = true;
                s.current_activity = "paused".to_string();
            })
            .await;
        if !was_paused {
            info!(instance = %shared.instance, scope, "Generation paused");
            shared
                .log_activity(ActivityEntry::info(
                    &shared.instance,
                    format!("Generation paused ({scope})"),
                ))
                .await;
        }
        if let Err(e) = shared.transition(CoordinatorState::Paused, scope).await {
            warn!(error = %e, "Unexpected state while pausing");
        }
    }

    async fn fail_cycle(&self, started: DateTime<Utc>, err: WorkerError) -> CycleResult {
        let shared = &self.shared;
        let message = err.to_string();
        error!(instance = %shared.instance, error = %message, "Cycle failed");

        let finished = Utc::now();
        shared
            .update_status(|s| {
                s.last_run_start = Some(started);
                s.last_run_finish = Some(finished);
                s.total_runs += 1;
                s.last_run_error = Some(message.clone());
                s.current_activity = "idle".to_string();
            })
            .await;
        shared
            .log_activity(ActivityEntry::error(
                &shared.instance,
                format!("Cycle failed: {message}"),
            ))
            .await;
        self.record_run(
            started,
            finished,
            RunStatus::Failure,
            &DispatchCounters::default(),
            message.clone(),
        )
        .await;

        if let Err(e) = shared.transition(CoordinatorState::Idle, "cycle failed").await {
            warn!(error = %e, "Unexpected state after failed cycle");
        }
        CycleResult::Failed(message)
    }

    async fn record_run(
        &self,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        status: RunStatus,
        counters: &DispatchCounters,
        details: String,
    ) {
        let run = RunRecord {
            id: Uuid::new_v4(),
            instance: self.shared.instance.clone(),
            started_at: started,
            finished_at: finished,
            duration_ms: finished.signed_duration_since(started).num_milliseconds(),
            status,
            generated: counters.succeeded as i64,
            failed: counters.failed as i64,
            skipped: counters.skipped as i64,
            deferred: counters.deferred as i64,
            incomplete: counters.incomplete as i64,
            details,
        };
        if let Err(e) = self.shared.db.insert_run(&run).await {
            warn!(error = %e, "Failed to record run");
        }
        self.prune_history().await;
    }

    /// Trim run and activity history to the configured retention.
    async fn prune_history(&self) {
        let shared = &self.shared;
        let retention = &self.config.retention;
        match shared.db.prune_runs(&shared.instance, retention.max_history).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Pruned run history"),
            Err(e) => warn!(error = %e, "Failed to prune run history"),
        }
        match shared
            .db
            .prune_activity(&shared.instance, retention.max_activity_logs)
            .await
        {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Pruned activity log"),
            Err(e) => warn!(error = %e, "Failed to prune activity log"),
        }
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        let shared = &self.shared;
        shared
            .transition(CoordinatorState::Stopped, "shutdown")
            .await?;
        shared
            .update_status(|s| {
                s.is_running = false;
                s.is_paused = false;
                s.current_activity = "stopped".to_string();
            })
            .await;
        shared
            .log_activity(ActivityEntry::info(&shared.instance, "Worker stopped"))
            .await;
        info!(instance = %shared.instance, "Worker coordinator stopped");
        Ok(())
    }
}

fn spawn_heartbeat(
    shared: Arc<Shared>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = shared.db.touch_heartbeat(&shared.instance, Utc::now()).await {
                        warn!(instance = %shared.instance, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    })
}

/// `at + delay`, saturating at the end of representable time.
fn later(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Cancel `cycle` once `limit` elapses, unless it is cancelled first.
fn spawn_watchdog(cycle: CancellationToken, limit: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cycle.cancelled() => {}
            _ = tokio::time::sleep(limit) => cycle.cancel(),
        }
    });
}

/// Cloneable view of a running coordinator for the admin surface.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    pub fn instance(&self) -> &str {
        &self.shared.instance
    }

    pub fn pause(&self) -> &PauseRegistry {
        &self.shared.pause
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.shared.db
    }

    pub async fn state(&self) -> CoordinatorState {
        self.shared.machine.lock().await.state()
    }

    /// The most recent `limit` state transitions, newest last.
    pub async fn transitions(&self, limit: usize) -> Vec<StateTransition> {
        let machine = self.shared.machine.lock().await;
        let all = machine.transitions();
        all[all.len().saturating_sub(limit)..].to_vec()
    }

    /// Persisted status row, falling back to the in-memory copy.
    pub async fn status(&self) -> Result<WorkerStatus, DatabaseError> {
        match self.shared.db.get_worker_status(&self.shared.instance).await? {
            Some(status) => Ok(status),
            None => Ok(self.shared.status.lock().await.clone()),
        }
    }

    /// Health of every instance sharing this database.
    pub async fn health(&self) -> Result<WorkerHealth, WorkerError> {
        let pause = self.shared.pause.refresh().await?;
        let statuses = self.shared.db.list_worker_statuses().await?;
        Ok(WorkerHealth::from_statuses(
            statuses,
            pause.global_paused,
            Utc::now(),
            self.shared.heartbeat_stale_after,
        ))
    }

    pub async fn activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, DatabaseError> {
        self.shared
            .db
            .list_activity(Some(&self.shared.instance), limit)
            .await
    }

    pub async fn runs(&self, limit: usize) -> Result<Vec<RunRecord>, DatabaseError> {
        self.shared.db.list_runs(&self.shared.instance, limit).await
    }

    pub fn concurrency(&self) -> LimiterSnapshot {
        self.shared.limiter.snapshot()
    }

    /// This month's usage and remaining budget for every provider.
    pub async fn usage(&self) -> Result<Vec<ProviderUsage>, DatabaseError> {
        self.shared.quota.snapshot(Utc::now()).await
    }

    /// Ask the worker to favor `question_type` for this user until `ttl` passes.
    pub async fn add_hint(
        &self,
        user_id: i64,
        question_type: QuestionType,
        ttl: Duration,
    ) -> Result<DateTime<Utc>, DatabaseError> {
        let expires_at = later(Utc::now(), ttl);
        self.shared
            .db
            .set_generation_hint(user_id, question_type, expires_at)
            .await?;
        info!(user_id, %question_type, %expires_at, "Generation hint set");
        Ok(expires_at)
    }

    /// Ask for an immediate cycle. At most one trigger is ever pending.
    pub async fn trigger_now(&self) -> TriggerAck {
        let state = self.shared.machine.lock().await.state();
        let ack = if state.is_terminal() {
            TriggerAck::Rejected
        } else if !state.accepts_trigger() {
            TriggerAck::Coalesced
        } else if self.shared.trigger_pending.swap(true, Ordering::SeqCst) {
            TriggerAck::Coalesced
        } else {
            self.shared.trigger.notify_one();
            TriggerAck::Accepted
        };
        info!(instance = %self.shared.instance, %state, ?ack, "Trigger requested");
        ack
    }

    /// What the scorer would queue for this user right now.
    pub async fn user_priority(&self, user_id: i64) -> Result<UserPriorityReport, PlanError> {
        let plan = plan_user(self.shared.db.as_ref(), &self.shared.scorer, user_id, Utc::now()).await?;
        let preferences = PriorityScorer::effective_preferences(user_id, &plan.preferences);
        Ok(UserPriorityReport {
            user_id,
            paused: self.shared.pause.is_user_paused(user_id).await,
            daily_goal: preferences.daily_goal,
            assigned_today: plan.assigned_today,
            hints: plan.hints.clone(),
            backoff_until: self
                .shared
                .failures
                .blocking(user_id, Utc::now())
                .await
                .map(|f| f.next_retry),
            queue: plan
                .items
                .iter()
                .map(|item| QueuedTopic {
                    topic: item.topic.clone(),
                    question_type: item.question_type,
                    score: item.score,
                    reasons: item.reasons.clone(),
                })
                .collect(),
            distribution: distribution(&plan.items),
            weak_areas: self.shared.scorer.weak_area_report(&plan.history),
        })
    }
}
