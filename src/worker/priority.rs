//! Priority scoring for generation work.
//!
//! Pure and synchronous: everything the scorer needs is handed in through
//! [`ScoringInput`], so the coordinator does all I/O up front and the
//! ranking itself can be tested without a database.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::ai::{ProviderConfig, QuestionType};
use crate::config::ScoringConfig;
use crate::worker::model::{LearningPreferences, ReasonTag, TopicHistory, WorkItem};

/// Everything known about one user at the start of a cycle.
#[derive(Debug, Clone)]
pub struct ScoringInput<'a> {
    pub user_id: i64,
    pub language: &'a str,
    pub level: &'a str,
    pub provider: &'a ProviderConfig,
    pub preferences: &'a LearningPreferences,
    pub weak_areas: &'a [String],
    pub history: &'a [TopicHistory],
    /// Topics available for the user's language and level.
    pub catalog: &'a [String],
    pub assigned_today: i64,
    /// Question types in planning order, hinted types first.
    pub question_types: &'a [QuestionType],
}

/// A weak topic with the numbers behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeakArea {
    pub topic: String,
    pub accuracy: f64,
    pub attempts: i64,
}

/// Shape of a ranked queue, for the analytics endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriorityDistribution {
    pub total: usize,
    pub fresh: usize,
    pub review: usize,
    pub weak_area: usize,
    pub review_due: usize,
    /// Scores of at least 1.5.
    pub high: usize,
    /// Scores in [1.0, 1.5).
    pub medium: usize,
    /// Scores below 1.0.
    pub low: usize,
    pub mean_score: f64,
    pub by_topic: BTreeMap<String, f64>,
    pub by_type: BTreeMap<QuestionType, usize>,
}

/// Computes per-topic priority and the ranked slate for a user.
#[derive(Debug, Clone, Default)]
pub struct PriorityScorer {
    config: ScoringConfig,
}

impl PriorityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Preferences that passed validation, or the defaults.
    pub fn effective_preferences(user_id: i64, prefs: &LearningPreferences) -> LearningPreferences {
        match prefs.validate() {
            Ok(()) => prefs.clone(),
            Err(reason) => {
                warn!(user_id, %reason, "Malformed learning preferences, using defaults");
                LearningPreferences::default()
            }
        }
    }

    /// Score one topic. Returns the score and the reasons behind it.
    pub fn score_topic(
        &self,
        prefs: &LearningPreferences,
        weak: bool,
        last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> (f64, Vec<ReasonTag>) {
        let mut score = 1.0;
        let mut reasons = Vec::new();

        if weak {
            reasons.push(ReasonTag::WeakArea);
            if prefs.focus_on_weak_areas {
                score *= prefs.weak_area_boost;
            }
        }

        match last_seen {
            None => {
                reasons.push(ReasonTag::Fresh);
                score *= self.config.review_due_bonus;
            }
            Some(seen) => {
                let due_after = chrono::Duration::days(prefs.review_interval_days);
                if now.signed_duration_since(seen) >= due_after {
                    reasons.push(ReasonTag::ReviewDue);
                    score *= self.config.review_due_bonus;
                } else {
                    score *= 1.0 - prefs.known_question_penalty;
                }
            }
        }

        (score, reasons)
    }

    /// Every candidate topic for the user, scored but not capped.
    pub fn candidates(&self, input: &ScoringInput<'_>, now: DateTime<Utc>) -> Vec<WorkItem> {
        let prefs = Self::effective_preferences(input.user_id, input.preferences);
        let weak: BTreeSet<&str> = input.weak_areas.iter().map(String::as_str).collect();
        let first_type = input
            .question_types
            .first()
            .copied()
            .unwrap_or(QuestionType::Vocabulary);

        let mut topics: BTreeMap<&str, Option<DateTime<Utc>>> = BTreeMap::new();
        for topic in input.catalog.iter().chain(input.weak_areas.iter()) {
            topics.entry(topic.as_str()).or_insert(None);
        }
        for h in input.history {
            let seen = topics.entry(h.topic.as_str()).or_insert(None);
            *seen = match (*seen, h.last_seen) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }

        let mut items: Vec<WorkItem> = topics
            .into_iter()
            .map(|(topic, last_seen)| {
                let (score, reasons) =
                    self.score_topic(&prefs, weak.contains(topic), last_seen, now);
                WorkItem {
                    user_id: input.user_id,
                    language: input.language.to_string(),
                    level: input.level.to_string(),
                    topic: topic.to_string(),
                    question_type: first_type,
                    score,
                    reasons,
                    provider: input.provider.clone(),
                }
            })
            .collect();
        rank_queue(&mut items);
        items
    }

    /// The ranked slate for today: at most `daily_goal - assigned_today`
    /// items, split between fresh and review topics by the fresh ratio.
    pub fn score_user(&self, input: &ScoringInput<'_>, now: DateTime<Utc>) -> Vec<WorkItem> {
        let prefs = Self::effective_preferences(input.user_id, input.preferences);
        let remaining = (prefs.daily_goal - input.assigned_today).max(0) as usize;
        if remaining == 0 {
            return Vec::new();
        }

        let (fresh, review): (Vec<WorkItem>, Vec<WorkItem>) = self
            .candidates(input, now)
            .into_iter()
            .partition(WorkItem::is_fresh);

        let fresh_target =
            ((prefs.daily_goal as f64 * prefs.fresh_question_ratio).round() as usize).min(remaining);
        let review_target = remaining - fresh_target;

        // A short partition hands its unused slots to the other one.
        let fresh_take = fresh.len().min(fresh_target + review_target.saturating_sub(review.len()));
        let review_take = review.len().min(remaining - fresh_take);

        let mut slate: Vec<WorkItem> = fresh
            .into_iter()
            .take(fresh_take)
            .chain(review.into_iter().take(review_take))
            .collect();
        rank_queue(&mut slate);
        assign_question_types(&mut slate, input.question_types);
        slate
    }

    /// Topics below the weak-accuracy threshold, worst first.
    pub fn weak_area_report(&self, history: &[TopicHistory]) -> Vec<WeakArea> {
        let mut weak: Vec<WeakArea> = history
            .iter()
            .filter(|h| h.attempts > 0 && h.accuracy < self.config.weak_accuracy_threshold)
            .map(|h| WeakArea {
                topic: h.topic.clone(),
                accuracy: h.accuracy,
                attempts: h.attempts,
            })
            .collect();
        weak.sort_by(|a, b| {
            a.accuracy
                .partial_cmp(&b.accuracy)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.attempts.cmp(&a.attempts))
                .then_with(|| a.topic.cmp(&b.topic))
        });
        weak.truncate(self.config.weak_area_limit);
        weak
    }
}

/// Queue order: score descending, weak areas before others on equal score,
/// then user id and topic ascending.
pub fn compare_items(a: &WorkItem, b: &WorkItem) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.has_reason(ReasonTag::WeakArea)
                .cmp(&a.has_reason(ReasonTag::WeakArea))
        })
        .then_with(|| a.user_id.cmp(&b.user_id))
        .then_with(|| a.topic.cmp(&b.topic))
}

pub fn rank_queue(items: &mut [WorkItem]) {
    items.sort_by(compare_items);
}

/// Rotate through `order` along a ranked slate, so the highest-priority
/// items get the first (hinted) types and every type gets a share.
pub fn assign_question_types(slate: &mut [WorkItem], order: &[QuestionType]) {
    let order = if order.is_empty() {
        &QuestionType::ALL[..]
    } else {
        order
    };
    for (i, item) in slate.iter_mut().enumerate() {
        item.question_type = order[i % order.len()];
    }
}

/// Summarize a queue for operators.
pub fn distribution(items: &[WorkItem]) -> PriorityDistribution {
    let mut dist = PriorityDistribution {
        total: items.len(),
        ..Default::default()
    };
    let mut sum = 0.0;
    for item in items {
        sum += item.score;
        if item.is_fresh() {
            dist.fresh += 1;
        } else {
            dist.review += 1;
        }
        if item.has_reason(ReasonTag::WeakArea) {
            dist.weak_area += 1;
        }
        if item.has_reason(ReasonTag::ReviewDue) {
            dist.review_due += 1;
        }
        match item.score {
            s if s >= 1.5 => dist.high += 1,
            s if s >= 1.0 => dist.medium += 1,
            _ => dist.low += 1,
        }
        dist.by_topic.insert(item.topic.clone(), item.score);
        *dist.by_type.entry(item.question_type).or_default() += 1;
    }
    if !items.is_empty() {
        dist.mean_score = sum / items.len() as f64;
    }
    dist
}
