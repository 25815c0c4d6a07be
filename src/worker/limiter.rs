//! Concurrency limiter for AI calls.
//!
//! One global semaphore bounds total in-flight calls; one semaphore per
//! provider keeps a slow or throttled provider from starving the others.
//! Permits are always taken global-first, so two acquirers can never hold
//! each other's second permit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::ai::ProviderKind;
use crate::config::{AcquireMode, LimiterConfig};
use crate::error::LimiterError;

struct ProviderGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Point-in-time view of slot usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterSnapshot {
    pub total_in_use: usize,
    pub total_limit: usize,
    pub per_provider_in_use: BTreeMap<ProviderKind, usize>,
    pub per_provider_limit: BTreeMap<ProviderKind, usize>,
}

/// Bounded semaphore plus per-provider accounting.
pub struct AiConcurrencyLimiter {
    global: Arc<Semaphore>,
    total_limit: usize,
    providers: HashMap<ProviderKind, ProviderGate>,
    mode: AcquireMode,
    provider_wait: Duration,
}

/// A held permit pair. Released on drop.
pub struct ConcurrencySlot {
    provider: ProviderKind,
    permits: Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)>,
}

impl ConcurrencySlot {
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn is_held(&self) -> bool {
        self.permits.is_some()
    }

    /// Give the permits back. Returns `false` if they were already released.
    pub fn release(&mut self) -> bool {
        match self.permits.take() {
            Some((provider_permit, global_permit)) => {
                drop(provider_permit);
                drop(global_permit);
                true
            }
            None => {
                debug!(provider = %self.provider, "Concurrency slot already released");
                false
            }
        }
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        if self.permits.is_some() {
            self.release();
        }
    }
}

impl std::fmt::Debug for ConcurrencySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencySlot")
            .field("provider", &self.provider)
            .field("held", &self.is_held())
            .finish()
    }
}

fn exhausted(provider: ProviderKind, waited: Duration) -> LimiterError {
    LimiterError::ConcurrencyExhausted { provider, waited }
}

impl AiConcurrencyLimiter {
    /// Build from config. Zero or missing limits are a misconfiguration.
    pub fn new(config: &LimiterConfig) -> Result<Self, LimiterError> {
        if config.max_total == 0 {
            return Err(LimiterError::Misconfigured(
                "max_total must be at least 1".to_string(),
            ));
        }

        let mut providers = HashMap::new();
        for kind in ProviderKind::ALL {
            let limit = config.max_per_provider.get(&kind).copied().unwrap_or(0);
            if limit == 0 {
                return Err(LimiterError::Misconfigured(format!(
                    "no concurrency limit for provider {kind}"
                )));
            }
            providers.insert(
                kind,
                ProviderGate {
                    semaphore: Arc::new(Semaphore::new(limit)),
                    limit,
                },
            );
        }

        Ok(Self {
            global: Arc::new(Semaphore::new(config.max_total)),
            total_limit: config.max_total,
            providers,
            mode: config.mode,
            provider_wait: config.provider_wait,
        })
    }

    /// Take a global and a provider permit.
    ///
    /// In blocking mode each permit is waited for with its own bound; in
    /// fail-fast mode neither waits. If the provider permit cannot be had,
    /// the global permit is handed back before returning.
    pub async fn acquire(&self, provider: ProviderKind) -> Result<ConcurrencySlot, LimiterError> {
        let gate = self.providers.get(&provider).ok_or_else(|| {
            LimiterError::Misconfigured(format!("unknown provider {provider}"))
        })?;

        let global = match self.mode {
            AcquireMode::FailFast => match Arc::clone(&self.global).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => return Err(exhausted(provider, Duration::ZERO)),
                Err(TryAcquireError::Closed) => return Err(LimiterError::Closed),
            },
            AcquireMode::Blocking { wait } => {
                match tokio::time::timeout(wait, Arc::clone(&self.global).acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(LimiterError::Closed),
                    Err(_) => return Err(exhausted(provider, wait)),
                }
            }
        };

        let provider_permit = match self.mode {
            AcquireMode::FailFast => Arc::clone(&gate.semaphore).try_acquire_owned().ok(),
            AcquireMode::Blocking { .. } => tokio::time::timeout(
                self.provider_wait,
                Arc::clone(&gate.semaphore).acquire_owned(),
            )
            .await
            .ok()
            .and_then(Result::ok),
        };

        match provider_permit {
            Some(permit) => Ok(ConcurrencySlot {
                provider,
                permits: Some((permit, global)),
            }),
            None => {
                drop(global);
                debug!(%provider, "Provider slots full, global permit rolled back");
                Err(exhausted(provider, self.provider_wait))
            }
        }
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let mut per_provider_in_use = BTreeMap::new();
        let mut per_provider_limit = BTreeMap::new();
        for (kind, gate) in &self.providers {
            per_provider_in_use.insert(*kind, gate.limit - gate.semaphore.available_permits());
            per_provider_limit.insert(*kind, gate.limit);
        }
        LimiterSnapshot {
            total_in_use: self.total_limit - self.global.available_permits(),
            total_limit: self.total_limit,
            per_provider_in_use,
            per_provider_limit,
        }
    }
}
