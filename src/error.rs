// src/error.rs
use thiserror::Error;

/// Per-tick failures. Every variant except `Construction` is contained
/// within the tick that raised it; the next tick retries from scratch.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("market data collection failed: {0:#}")]
    Collection(anyhow::Error),

    #[error("advisor call failed: {0:#}")]
    Advisory(anyhow::Error),

    #[error("invalid advisor decision: {0}")]
    InvalidDecision(String),

    #[error("order execution failed: {0:#}")]
    Execution(anyhow::Error),

    #[error("engine construction failed: {0:#}")]
    Construction(anyhow::Error),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Construction(_))
    }
}
