//! Monthly per-provider request budgets.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ai::ProviderKind;
use crate::config::QuotaConfig;
use crate::error::DatabaseError;
use crate::store::{Database, UsageStats};

/// Usage bucket for a timestamp, `YYYY-MM` in UTC.
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// One provider's usage this month against its budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderUsage {
    #[serde(flatten)]
    pub stats: UsageStats,
    pub monthly_limit: Option<u64>,
    pub remaining: Option<u64>,
}

pub struct QuotaGuard {
    config: QuotaConfig,
    db: Arc<dyn Database>,
}

impl QuotaGuard {
    pub fn new(config: QuotaConfig, db: Arc<dyn Database>) -> Self {
        Self { config, db }
    }

    pub fn limit(&self, provider: ProviderKind) -> Option<u64> {
        self.config.monthly_requests.get(&provider).copied()
    }

    /// Requests left this month, or `None` when the provider is unlimited.
    pub async fn remaining(
        &self,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, DatabaseError> {
        let Some(limit) = self.limit(provider) else {
            return Ok(None);
        };
        let usage = self.db.get_monthly_usage(provider, &month_key(now)).await?;
        Ok(Some(limit.saturating_sub(usage.requests)))
    }

    pub async fn usage(
        &self,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Result<UsageStats, DatabaseError> {
        self.db.get_monthly_usage(provider, &month_key(now)).await
    }

    /// Usage for every provider, in [`ProviderKind::ALL`] order.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> Result<Vec<ProviderUsage>, DatabaseError> {
        let mut out = Vec::with_capacity(ProviderKind::ALL.len());
        for provider in ProviderKind::ALL {
            let stats = self.usage(provider, now).await?;
            let monthly_limit = self.limit(provider);
            out.push(ProviderUsage {
                remaining: monthly_limit.map(|limit| limit.saturating_sub(stats.requests)),
                monthly_limit,
                stats,
            });
        }
        Ok(out)
    }

    /// Count one successful request.
    pub async fn record(
        &self,
        provider: ProviderKind,
        characters: u64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.db
            .record_usage(provider, &month_key(now), 1, characters)
            .await
    }
}
