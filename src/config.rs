//! Configuration types.
//!
//! Every tuning knob of the worker (intervals, concurrency caps, backoff,
//! quotas) is read from `QUIZGEN_*` environment variables with a default.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::ai::ProviderKind;
use crate::error::ConfigError;

/// How `acquire` behaves when no slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Wait up to `wait` for a slot, then give up.
    Blocking { wait: Duration },
    /// Give up immediately.
    FailFast,
}

/// Concurrency limits for AI calls.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Maximum simultaneous AI calls across all providers.
    pub max_total: usize,
    /// Per-provider caps.
    pub max_per_provider: HashMap<ProviderKind, usize>,
    pub mode: AcquireMode,
    /// How long to wait for the provider permit once the global one is held.
    pub provider_wait: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_per_provider: ProviderKind::ALL.iter().map(|k| (*k, 4)).collect(),
            mode: AcquireMode::Blocking {
                wait: Duration::from_secs(3),
            },
            provider_wait: Duration::from_millis(250),
        }
    }
}

/// Exponential backoff for transient generation failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Random spread applied to each delay, as a fraction (0.1 = ±10%).
    pub jitter: f64,
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.factor.powi(retry.saturating_sub(1) as i32);
        let millis = (self.base_delay.as_millis() as f64 * exp).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(8),
            jitter: 0.1,
        }
    }
}

/// Priority scoring knobs that are not per-user preferences.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Multiplier for topics that are due for review (or never seen).
    pub review_due_bonus: f64,
    /// Accuracy below which a topic counts as a weak area.
    pub weak_accuracy_threshold: f64,
    /// Maximum weak areas reported per user.
    pub weak_area_limit: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            review_due_bonus: 1.25,
            weak_accuracy_threshold: 0.6,
            weak_area_limit: 5,
        }
    }
}

/// Per-user backoff after cycles in which the user's generation failed.
/// Failure `n` parks the user for `base * 2^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct UserBackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl UserBackoffConfig {
    /// Delay after `failures` consecutive failed cycles.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for UserBackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(3600),
        }
    }
}

/// How much history each instance keeps in the database.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Run records kept per instance.
    pub max_history: usize,
    /// Activity entries kept per instance.
    pub max_activity_logs: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            max_activity_logs: 1000,
        }
    }
}

/// Monthly request budgets. Providers without an entry are unlimited.
#[derive(Debug, Clone, Default)]
pub struct QuotaConfig {
    pub monthly_requests: HashMap<ProviderKind, u64>,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Instance name, the key of this worker's status row.
    pub instance: String,
    pub db_path: String,
    /// Port for the admin API; `None` disables it.
    pub admin_port: Option<u16>,
    pub cycle_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Heartbeats older than this mark an instance unhealthy.
    pub heartbeat_stale_after: Duration,
    /// Watchdog for a single cycle.
    pub max_cycle_duration: Duration,
    /// Set the global pause flag at startup.
    pub start_paused: bool,
    /// Timeout for one provider call.
    pub call_timeout: Duration,
    pub limiter: LimiterConfig,
    pub retry: RetryConfig,
    pub scoring: ScoringConfig,
    pub quota: QuotaConfig,
    pub user_backoff: UserBackoffConfig,
    pub retention: RetentionConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance: "default".to_string(),
            db_path: "./data/quizgen.db".to_string(),
            admin_port: Some(8090),
            cycle_interval: Duration::from_secs(300), // 5 minutes
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_stale_after: Duration::from_secs(300), // 5 minutes
            max_cycle_duration: Duration::from_secs(900), // 15 minutes
            start_paused: false,
            call_timeout: Duration::from_secs(60),
            limiter: LimiterConfig::default(),
            retry: RetryConfig::default(),
            scoring: ScoringConfig::default(),
            quota: QuotaConfig::default(),
            user_backoff: UserBackoffConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_or(lookup, key, default.as_secs()))
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_or(lookup, key, default.as_millis() as u64))
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn provider_suffix(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Google => "GOOGLE",
        ProviderKind::OpenAi => "OPENAI",
        ProviderKind::Ollama => "OLLAMA",
    }
}

impl WorkerConfig {
    /// Build config from `QUIZGEN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unparseable values fall
    /// back to their defaults; the result is validated.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let lookup = &lookup;

        let default_per_provider = parse_or(lookup, "QUIZGEN_MAX_PER_PROVIDER", 4usize);
        let max_per_provider = ProviderKind::ALL
            .iter()
            .map(|k| {
                let key = format!("QUIZGEN_MAX_{}", provider_suffix(*k));
                (*k, parse_or(lookup, &key, default_per_provider))
            })
            .collect();

        let mode = if flag(lookup, "QUIZGEN_FAIL_FAST") {
            AcquireMode::FailFast
        } else {
            AcquireMode::Blocking {
                wait: millis_or(lookup, "QUIZGEN_ACQUIRE_WAIT_MS", Duration::from_secs(3)),
            }
        };

        let monthly_requests = ProviderKind::ALL
            .iter()
            .filter_map(|k| {
                let key = format!("QUIZGEN_QUOTA_{}", provider_suffix(*k));
                lookup(&key)
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(|cap| (*k, cap))
            })
            .collect();

        let admin_port = match lookup("QUIZGEN_ADMIN_PORT") {
            Some(v) if v.trim().eq_ignore_ascii_case("off") => None,
            Some(v) => v.trim().parse().ok().or(d.admin_port),
            None => d.admin_port,
        };

        let config = Self {
            instance: lookup("QUIZGEN_INSTANCE")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(d.instance),
            db_path: lookup("QUIZGEN_DB_PATH").unwrap_or(d.db_path),
            admin_port,
            cycle_interval: secs_or(lookup, "QUIZGEN_CYCLE_INTERVAL_SECS", d.cycle_interval),
            heartbeat_interval: secs_or(lookup, "QUIZGEN_HEARTBEAT_INTERVAL_SECS", d.heartbeat_interval),
            heartbeat_stale_after: secs_or(lookup, "QUIZGEN_HEARTBEAT_STALE_SECS", d.heartbeat_stale_after),
            max_cycle_duration: secs_or(lookup, "QUIZGEN_MAX_CYCLE_SECS", d.max_cycle_duration),
            start_paused: flag(lookup, "QUIZGEN_START_PAUSED"),
            call_timeout: secs_or(lookup, "QUIZGEN_CALL_TIMEOUT_SECS", d.call_timeout),
            limiter: LimiterConfig {
                max_total: parse_or(lookup, "QUIZGEN_MAX_CONCURRENT", d.limiter.max_total),
                max_per_provider,
                mode,
                provider_wait: millis_or(lookup, "QUIZGEN_PROVIDER_WAIT_MS", d.limiter.provider_wait),
            },
            retry: RetryConfig {
                max_attempts: parse_or(lookup, "QUIZGEN_RETRY_ATTEMPTS", d.retry.max_attempts),
                base_delay: millis_or(lookup, "QUIZGEN_RETRY_BASE_MS", d.retry.base_delay),
                factor: parse_or(lookup, "QUIZGEN_RETRY_FACTOR", d.retry.factor),
                max_delay: millis_or(lookup, "QUIZGEN_RETRY_MAX_MS", d.retry.max_delay),
                jitter: parse_or(lookup, "QUIZGEN_RETRY_JITTER", d.retry.jitter),
            },
            scoring: ScoringConfig {
                review_due_bonus: parse_or(lookup, "QUIZGEN_REVIEW_BONUS", d.scoring.review_due_bonus),
                weak_accuracy_threshold: parse_or(
                    lookup,
                    "QUIZGEN_WEAK_THRESHOLD",
                    d.scoring.weak_accuracy_threshold,
                ),
                weak_area_limit: d.scoring.weak_area_limit,
            },
            quota: QuotaConfig { monthly_requests },
            user_backoff: UserBackoffConfig {
                base: millis_or(lookup, "QUIZGEN_USER_BACKOFF_BASE_MS", d.user_backoff.base),
                max: secs_or(lookup, "QUIZGEN_USER_BACKOFF_MAX_SECS", d.user_backoff.max),
            },
            retention: RetentionConfig {
                max_history: parse_or(lookup, "QUIZGEN_MAX_HISTORY", d.retention.max_history),
                max_activity_logs: parse_or(
                    lookup,
                    "QUIZGEN_MAX_ACTIVITY_LOGS",
                    d.retention.max_activity_logs,
                ),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        };

        if self.cycle_interval.is_zero() {
            return invalid("QUIZGEN_CYCLE_INTERVAL_SECS", "must be positive");
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.cycle_interval {
            return invalid(
                "QUIZGEN_HEARTBEAT_INTERVAL_SECS",
                "must be positive and shorter than the cycle interval",
            );
        }
        if self.limiter.max_total == 0 {
            return invalid("QUIZGEN_MAX_CONCURRENT", "must be at least 1");
        }
        if let Some((kind, _)) = self.limiter.max_per_provider.iter().find(|(_, cap)| **cap == 0) {
            return invalid(
                &format!("QUIZGEN_MAX_{}", provider_suffix(*kind)),
                "must be at least 1",
            );
        }
        if self.retry.max_attempts == 0 {
            return invalid("QUIZGEN_RETRY_ATTEMPTS", "must be at least 1");
        }
        if self.retry.factor < 1.0 {
            return invalid("QUIZGEN_RETRY_FACTOR", "must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("QUIZGEN_RETRY_JITTER", "must be within [0, 1]");
        }
        if self.scoring.review_due_bonus < 1.0 {
            return invalid("QUIZGEN_REVIEW_BONUS", "must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.scoring.weak_accuracy_threshold) {
            return invalid("QUIZGEN_WEAK_THRESHOLD", "must be within [0, 1]");
        }
        if self.user_backoff.base > self.user_backoff.max {
            return invalid(
                "QUIZGEN_USER_BACKOFF_BASE_MS",
                "must not exceed QUIZGEN_USER_BACKOFF_MAX_SECS",
            );
        }
        if self.retention.max_history == 0 {
            return invalid("QUIZGEN_MAX_HISTORY", "must be at least 1");
        }
        if self.retention.max_activity_logs == 0 {
            return invalid("QUIZGEN_MAX_ACTIVITY_LOGS", "must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = WorkerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.instance, "default");
        assert_eq!(config.cycle_interval, Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.quota.monthly_requests.is_empty());
        assert!(matches!(config.limiter.mode, AcquireMode::Blocking { .. }));
    }

    #[test]
    fn reads_overrides() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("QUIZGEN_INSTANCE", "worker-b"),
            ("QUIZGEN_CYCLE_INTERVAL_SECS", "60"),
            ("QUIZGEN_MAX_PER_PROVIDER", "2"),
            ("QUIZGEN_MAX_OLLAMA", "1"),
            ("QUIZGEN_FAIL_FAST", "true"),
            ("QUIZGEN_QUOTA_GOOGLE", "1500"),
            ("QUIZGEN_ADMIN_PORT", "off"),
            ("QUIZGEN_START_PAUSED", "1"),
        ]))
        .unwrap();
        assert_eq!(config.instance, "worker-b");
        assert_eq!(config.cycle_interval, Duration::from_secs(60));
        assert_eq!(config.limiter.max_per_provider[&ProviderKind::Google], 2);
        assert_eq!(config.limiter.max_per_provider[&ProviderKind::Ollama], 1);
        assert_eq!(config.limiter.mode, AcquireMode::FailFast);
        assert_eq!(config.quota.monthly_requests[&ProviderKind::Google], 1500);
        assert!(!config.quota.monthly_requests.contains_key(&ProviderKind::OpenAi));
        assert_eq!(config.admin_port, None);
        assert!(config.start_paused);
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let config =
            WorkerConfig::from_lookup(lookup_from(&[("QUIZGEN_RETRY_ATTEMPTS", "lots")])).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn heartbeat_must_be_shorter_than_cycle() {
        let err = WorkerConfig::from_lookup(lookup_from(&[
            ("QUIZGEN_CYCLE_INTERVAL_SECS", "30"),
            ("QUIZGEN_HEARTBEAT_INTERVAL_SECS", "30"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("QUIZGEN_HEARTBEAT_INTERVAL_SECS"));
    }

    #[test]
    fn zero_provider_cap_rejected() {
        let err =
            WorkerConfig::from_lookup(lookup_from(&[("QUIZGEN_MAX_OPENAI", "0")])).unwrap_err();
        assert!(err.to_string().contains("QUIZGEN_MAX_OPENAI"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_millis(1500),
            jitter: 0.0,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for(2), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(3), Duration::from_millis(1500));
    }

    #[test]
    fn user_backoff_doubles_up_to_an_hour() {
        let backoff = UserBackoffConfig::default();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(12), Duration::from_secs(3600));
        assert_eq!(backoff.delay_for(40), Duration::from_secs(3600));
    }

    #[test]
    fn retention_limits_read_and_validated() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("QUIZGEN_MAX_HISTORY", "20"),
            ("QUIZGEN_MAX_ACTIVITY_LOGS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.retention.max_history, 20);
        assert_eq!(config.retention.max_activity_logs, 250);

        let err =
            WorkerConfig::from_lookup(lookup_from(&[("QUIZGEN_MAX_HISTORY", "0")])).unwrap_err();
        assert!(err.to_string().contains("QUIZGEN_MAX_HISTORY"));
    }
}
