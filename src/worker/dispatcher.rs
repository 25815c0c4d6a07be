//! Generation dispatcher: turns a ranked queue into outcomes.
//!
//! Items are considered strictly in queue order. Each one passes the pause,
//! provider-exhaustion and quota gates, then waits (bounded) for a
//! concurrency slot. Calls run in parallel on a `JoinSet` while the loop
//! moves on to the next item. Every path produces a `GenerationOutcome`;
//! provider errors are values, never panics or early returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ai::{GeneratedQuestion, GenerationRequest, ProviderKind, QuestionGenerator};
use crate::config::RetryConfig;
use crate::error::{DatabaseError, ErrorKind, GenerationError, LimiterError};
use crate::store::Database;
use crate::worker::limiter::{AiConcurrencyLimiter, ConcurrencySlot};
use crate::worker::model::{GenerationOutcome, OutcomeStatus, SkipReason, WorkItem};
use crate::worker::pause::PauseRegistry;
use crate::worker::quota::QuotaGuard;
use crate::worker::status::ActivityEntry;

/// Per-status totals for one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub incomplete: usize,
}

impl DispatchCounters {
    pub fn tally(outcomes: &[GenerationOutcome]) -> Self {
        let mut counters = Self::default();
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Succeeded => counters.succeeded += 1,
                OutcomeStatus::Failed => counters.failed += 1,
                OutcomeStatus::Skipped(_) => counters.skipped += 1,
                OutcomeStatus::Deferred => counters.deferred += 1,
                OutcomeStatus::Incomplete => counters.incomplete += 1,
            }
        }
        counters
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.deferred + self.incomplete
    }
}

/// Everything a cycle learns from dispatching its queue.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// One outcome per input item, in input order.
    pub outcomes: Vec<GenerationOutcome>,
    pub counters: DispatchCounters,
    /// Messages of items that failed terminally, in input order.
    pub terminal_errors: Vec<String>,
}

/// Providers that reported an exhausted quota during this dispatch.
type ExhaustedSet = Arc<Mutex<HashSet<ProviderKind>>>;

#[derive(Clone)]
pub struct GenerationDispatcher {
    generator: Arc<dyn QuestionGenerator>,
    limiter: Arc<AiConcurrencyLimiter>,
    pause: Arc<PauseRegistry>,
    quota: Arc<QuotaGuard>,
    db: Arc<dyn Database>,
    retry: RetryConfig,
    call_timeout: Duration,
    instance: String,
}

impl GenerationDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generator: Arc<dyn QuestionGenerator>,
        limiter: Arc<AiConcurrencyLimiter>,
        pause: Arc<PauseRegistry>,
        quota: Arc<QuotaGuard>,
        db: Arc<dyn Database>,
        retry: RetryConfig,
        call_timeout: Duration,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            generator,
            limiter,
            pause,
            quota,
            db,
            retry,
            call_timeout,
            instance: instance.into(),
        }
    }

    /// Dispatch a ranked queue.
    ///
    /// `shutdown` stops new items from starting; calls already in flight
    /// run to completion. `cycle` is the watchdog: cancelling it abandons
    /// in-flight calls and marks them incomplete.
    pub async fn dispatch(
        &self,
        items: Vec<WorkItem>,
        shutdown: &CancellationToken,
        cycle: &CancellationToken,
    ) -> DispatchReport {
        let total = items.len();
        let exhausted: ExhaustedSet = Arc::new(Mutex::new(HashSet::new()));
        // Requests left per provider, loaded on first use and decremented
        // for every call started.
        let mut budgets: HashMap<ProviderKind, Option<u64>> = HashMap::new();
        let mut finished: Vec<(usize, GenerationOutcome)> = Vec::with_capacity(total);
        let mut join_set: JoinSet<(usize, GenerationOutcome)> = JoinSet::new();
        let mut lost = 0usize;

        for (index, item) in items.into_iter().enumerate() {
            let provider = item.provider.kind;

            if shutdown.is_cancelled() {
                finished.push((index, skipped(item, SkipReason::Shutdown)));
                continue;
            }
            if cycle.is_cancelled() {
                finished.push((
                    index,
                    GenerationOutcome::not_attempted(item, OutcomeStatus::Incomplete),
                ));
                continue;
            }
            if self.pause.is_globally_paused().await || self.pause.is_instance_paused().await {
                finished.push((index, skipped(item, SkipReason::GlobalPause)));
                continue;
            }
            if self.pause.is_user_paused(item.user_id).await {
                finished.push((index, skipped(item, SkipReason::UserPaused)));
                continue;
            }
            if exhausted.lock().await.contains(&provider) {
                finished.push((index, skipped(item, SkipReason::ProviderExhausted)));
                continue;
            }

            let budget = match budgets.get(&provider) {
                Some(budget) => *budget,
                None => {
                    let loaded = match self.quota.remaining(provider, Utc::now()).await {
                        Ok(remaining) => remaining,
                        Err(e) => {
                            warn!(%provider, error = %e, "Quota lookup failed, not enforcing budget");
                            None
                        }
                    };
                    budgets.insert(provider, loaded);
                    loaded
                }
            };
            if budget == Some(0) {
                if exhausted.lock().await.insert(provider) {
                    self.log_activity(ActivityEntry::warn(
                        &self.instance,
                        format!("Monthly request budget for {provider} used up"),
                    ))
                    .await;
                }
                finished.push((index, skipped(item, SkipReason::QuotaBudget)));
                continue;
            }

            let slot = tokio::select! {
                biased;
                _ = cycle.cancelled() => {
                    finished.push((
                        index,
                        GenerationOutcome::not_attempted(item, OutcomeStatus::Incomplete),
                    ));
                    continue;
                }
                acquired = self.limiter.acquire(provider) => acquired,
            };
            let slot = match slot {
                Ok(slot) => slot,
                Err(e) => {
                    if !matches!(e, LimiterError::ConcurrencyExhausted { .. }) {
                        warn!(%provider, error = %e, "Limiter refused slot");
                    }
                    debug!(user_id = item.user_id, topic = %item.topic, "No slot, deferring");
                    finished.push((
                        index,
                        GenerationOutcome::not_attempted(item, OutcomeStatus::Deferred),
                    ));
                    continue;
                }
            };

            // Flags may have changed while we waited for the slot.
            let late_skip = if self.pause.is_globally_paused().await
                || self.pause.is_instance_paused().await
            {
                Some(SkipReason::GlobalPause)
            } else if self.pause.is_user_paused(item.user_id).await {
                Some(SkipReason::UserPaused)
            } else if exhausted.lock().await.contains(&provider) {
                Some(SkipReason::ProviderExhausted)
            } else {
                None
            };
            if let Some(reason) = late_skip {
                drop(slot);
                finished.push((index, skipped(item, reason)));
                continue;
            }

            if let Some(Some(left)) = budgets.get_mut(&provider) {
                *left = left.saturating_sub(1);
            }

            let this = self.clone();
            let cycle = cycle.clone();
            let exhausted = Arc::clone(&exhausted);
            join_set.spawn(async move {
                let outcome = this.run_item(item, slot, &cycle, &exhausted).await;
                (index, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(entry) => finished.push(entry),
                Err(e) => {
                    error!(error = %e, "Generation task panicked");
                    lost += 1;
                }
            }
        }

        finished.sort_by_key(|(index, _)| *index);
        let outcomes: Vec<GenerationOutcome> =
            finished.into_iter().map(|(_, outcome)| outcome).collect();

        let mut counters = DispatchCounters::tally(&outcomes);
        counters.failed += lost;

        let mut terminal_errors: Vec<String> = outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .map(|o| {
                format!(
                    "user {} topic {}: {}",
                    o.item.user_id,
                    o.item.topic,
                    o.error_message.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        if lost > 0 {
            terminal_errors.push(format!("{lost} generation task(s) panicked"));
        }

        info!(
            items = total,
            succeeded = counters.succeeded,
            failed = counters.failed,
            skipped = counters.skipped,
            deferred = counters.deferred,
            incomplete = counters.incomplete,
            "Dispatch finished"
        );

        DispatchReport {
            outcomes,
            counters,
            terminal_errors,
        }
    }

    /// Call the provider for one item, retrying transient failures.
    async fn run_item(
        &self,
        item: WorkItem,
        mut slot: ConcurrencySlot,
        cycle: &CancellationToken,
        exhausted: &ExhaustedSet,
    ) -> GenerationOutcome {
        let provider = item.provider.kind;
        let request = GenerationRequest {
            user_id: item.user_id,
            provider: item.provider.clone(),
            language: item.language.clone(),
            level: item.level.clone(),
            topic: item.topic.clone(),
            question_type: item.question_type,
        };
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cycle.cancelled() => {
                    return incomplete(item, attempts);
                }
                called = tokio::time::timeout(self.call_timeout, self.generator.generate(&request)) => {
                    called.unwrap_or_else(|_| {
                        Err(GenerationError::new(
                            provider,
                            ErrorKind::Timeout,
                            format!("no response within {:?}", self.call_timeout),
                        ))
                    })
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let err = match result {
                Ok(question) => {
                    slot.release();
                    return self.persist(item, question, attempts, duration_ms).await;
                }
                Err(err) => err,
            };

            if err.is_transient() && attempts < max_attempts {
                let delay = self.backoff(attempts);
                warn!(
                    user_id = item.user_id,
                    topic = %item.topic,
                    %provider,
                    attempt = attempts,
                    error = %err,
                    "Transient generation error, retrying in {delay:?}"
                );
                self.log_activity(
                    ActivityEntry::warn(
                        &self.instance,
                        format!(
                            "Retrying {} for topic {} after {} (attempt {attempts}/{max_attempts})",
                            provider, item.topic, err.kind
                        ),
                    )
                    .with_user(item.user_id),
                )
                .await;

                tokio::select! {
                    biased;
                    _ = cycle.cancelled() => return incomplete(item, attempts),
                    _ = tokio::time::sleep(delay) => {}
                }

                if exhausted.lock().await.contains(&provider) {
                    slot.release();
                    let mut outcome = skipped(item, SkipReason::ProviderExhausted);
                    outcome.attempts = attempts;
                    outcome.error_kind = Some(err.kind);
                    outcome.error_message = Some(err.to_string());
                    return outcome;
                }
                continue;
            }

            // Only the first call to report an exhausted quota counts as a
            // failure; calls that were already in flight become skips.
            if err.kind == ErrorKind::QuotaExceeded && !exhausted.lock().await.insert(provider) {
                slot.release();
                debug!(user_id = item.user_id, topic = %item.topic, %provider, "Quota already reported exhausted");
                let mut outcome = skipped(item, SkipReason::ProviderExhausted);
                outcome.attempts = attempts;
                outcome.duration_ms = duration_ms;
                outcome.error_kind = Some(err.kind);
                outcome.error_message = Some(err.to_string());
                return outcome;
            }
            slot.release();

            error!(
                user_id = item.user_id,
                topic = %item.topic,
                %provider,
                attempts,
                error = %err,
                "Generation failed"
            );
            self.log_activity(
                ActivityEntry::error(
                    &self.instance,
                    format!("Generation for topic {} failed: {err}", item.topic),
                )
                .with_user(item.user_id),
            )
            .await;

            return GenerationOutcome {
                item,
                status: OutcomeStatus::Failed,
                error_kind: Some(err.kind),
                error_message: Some(err.to_string()),
                duration_ms,
                provider_used: provider,
                attempts,
                question_id: None,
            };
        }
    }

    /// Save, assign and account for a generated question.
    async fn persist(
        &self,
        item: WorkItem,
        question: GeneratedQuestion,
        attempts: u32,
        duration_ms: u64,
    ) -> GenerationOutcome {
        let provider = item.provider.kind;
        let saved = async {
            let id = self.db.save_question(&question).await?;
            self.db.assign_to_user(id, item.user_id).await?;
            Ok::<i64, DatabaseError>(id)
        }
        .await;

        match saved {
            Ok(question_id) => {
                if let Err(e) = self
                    .quota
                    .record(provider, question.char_count(), Utc::now())
                    .await
                {
                    warn!(%provider, error = %e, "Failed to record usage");
                }
                info!(
                    user_id = item.user_id,
                    topic = %item.topic,
                    %provider,
                    question_id,
                    duration_ms,
                    "Question generated"
                );
                GenerationOutcome {
                    item,
                    status: OutcomeStatus::Succeeded,
                    error_kind: None,
                    error_message: None,
                    duration_ms,
                    provider_used: provider,
                    attempts,
                    question_id: Some(question_id),
                }
            }
            Err(e) => {
                error!(user_id = item.user_id, topic = %item.topic, error = %e, "Failed to store question");
                GenerationOutcome {
                    item,
                    status: OutcomeStatus::Failed,
                    error_kind: Some(ErrorKind::Storage),
                    error_message: Some(e.to_string()),
                    duration_ms,
                    provider_used: provider,
                    attempts,
                    question_id: None,
                }
            }
        }
    }

    /// Delay before retry number `retry`, with symmetric jitter.
    fn backoff(&self, retry: u32) -> Duration {
        let base = self.retry.delay_for(retry);
        let jitter = self.retry.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor.max(0.0))
    }

    async fn log_activity(&self, entry: ActivityEntry) {
        if let Err(e) = self.db.append_activity(&entry).await {
            warn!(error = %e, "Failed to append activity entry");
        }
    }
}

fn skipped(item: WorkItem, reason: SkipReason) -> GenerationOutcome {
    GenerationOutcome::not_attempted(item, OutcomeStatus::Skipped(reason))
}

fn incomplete(item: WorkItem, attempts: u32) -> GenerationOutcome {
    let mut outcome = GenerationOutcome::not_attempted(item, OutcomeStatus::Incomplete);
    outcome.attempts = attempts;
    outcome
}
