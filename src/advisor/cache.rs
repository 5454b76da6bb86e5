// src/advisor/cache.rs
use crate::advisor::traits::AdvisorClient;
use crate::error::EngineError;
use crate::types::{AccountState, Action, AdvisorResponse, Decision, MarketSnapshot};
use anyhow::anyhow;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub price_threshold: f64,
    /// Cached decisions older than this are never reused.
    pub max_age: Duration,
    /// Holds younger than this are reused whatever the price did.
    pub hold_reuse: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            price_threshold: 0.001,
            max_age: Duration::from_secs(120),
            hold_reuse: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_count: u64,
    /// `None` until the advisor has answered once.
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DecisionCache {
    last_decision: Option<Decision>,
    last_price: f64,
    last_update: DateTime<Utc>,
    hit_count: u64,
}

impl DecisionCache {
    /// Starts already expired so the first lookup always misses.
    pub fn new() -> Self {
        Self {
            last_decision: None,
            last_price: 0.0,
            last_update: Utc::now() - ChronoDuration::hours(1),
            hit_count: 0,
        }
    }

    pub fn lookup(&self, policy: &CachePolicy, price: f64, now: DateTime<Utc>) -> Option<&Decision> {
        if !policy.enabled {
            return None;
        }
        let decision = self.last_decision.as_ref()?;

        let age_ms = (now - self.last_update).num_milliseconds();
        if age_ms > policy.max_age.as_millis() as i64 {
            return None;
        }

        if decision.action == Action::Hold && age_ms < policy.hold_reuse.as_millis() as i64 {
            return Some(decision);
        }

        if self.last_price <= 0.0 {
            return None;
        }
        let change = (price - self.last_price).abs() / self.last_price;
        (change < policy.price_threshold).then_some(decision)
    }

    fn store(&mut self, decision: Decision, price: f64, now: DateTime<Utc>) {
        self.last_decision = Some(decision);
        self.last_price = price;
        self.last_update = now;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count,
            last_update: self.last_decision.as_ref().map(|_| self.last_update),
        }
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks a raw advisor payload and turns it into a `Decision`.
pub fn validate_decision(raw: AdvisorResponse) -> Result<Decision, EngineError> {
    let action: Action = raw.action.parse().map_err(EngineError::InvalidDecision)?;

    if !(0.0..=100.0).contains(&raw.confidence) {
        return Err(EngineError::InvalidDecision(format!(
            "invalid confidence: {} (must be 0-100)",
            raw.confidence
        )));
    }
    if !raw.amount.is_finite() || raw.amount < 0.0 {
        return Err(EngineError::InvalidDecision(format!(
            "invalid amount: {} (must be >= 0)",
            raw.amount
        )));
    }

    let non_empty = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
    Ok(Decision {
        action,
        amount: if action == Action::Hold { 0.0 } else { raw.amount },
        confidence: raw.confidence.round() as u8,
        reason: raw.reason,
        stop_loss: non_empty(raw.stop_loss),
        take_profit: non_empty(raw.take_profit),
    })
}

/// Advisor wrapper applying the decision cache in front of every call.
pub struct CachedAdvisor {
    client: Box<dyn AdvisorClient>,
    cache: DecisionCache,
    policy: CachePolicy,
    timeout: Duration,
}

impl CachedAdvisor {
    pub fn new(client: Box<dyn AdvisorClient>, policy: CachePolicy, timeout: Duration) -> Self {
        Self {
            client,
            cache: DecisionCache::new(),
            policy,
            timeout,
        }
    }

    pub fn name(&self) -> String {
        self.client.name()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn analyze(
        &mut self,
        snapshot: &MarketSnapshot,
        account: &AccountState,
    ) -> Result<Decision, EngineError> {
        self.analyze_at(snapshot, account, Utc::now()).await
    }

    pub async fn analyze_at(
        &mut self,
        snapshot: &MarketSnapshot,
        account: &AccountState,
        now: DateTime<Utc>,
    ) -> Result<Decision, EngineError> {
        let price = snapshot.price();
        if let Some(decision) = self.cache.lookup(&self.policy, price, now).cloned() {
            self.cache.hit_count += 1;
            debug!("Advisor cache hit #{} ({})", self.cache.hit_count, decision.action);
            return Ok(decision);
        }

        let raw = tokio::time::timeout(self.timeout, self.client.analyze(snapshot, account))
            .await
            .map_err(|_| {
                EngineError::Advisory(anyhow!("advisor timed out after {:?}", self.timeout))
            })?
            .map_err(EngineError::Advisory)?;

        let decision = validate_decision(raw)?;
        self.cache.store(decision.clone(), price, now);
        Ok(decision)
    }
}
