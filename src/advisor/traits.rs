// src/advisor/traits.rs
use crate::types::{AccountState, AdvisorResponse, MarketSnapshot};
use anyhow::Result;
use async_trait::async_trait;

/// Turns a market snapshot into a trade recommendation. Implementations
/// must tolerate being called repeatedly; validation of the returned
/// payload happens in `CachedAdvisor`.
#[async_trait]
pub trait AdvisorClient: Send + Sync {
    fn name(&self) -> String;

    async fn analyze(
        &self,
        snapshot: &MarketSnapshot,
        account: &AccountState,
    ) -> Result<AdvisorResponse>;
}
