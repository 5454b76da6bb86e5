pub mod engine;
pub mod performance;
pub mod position;
pub mod risk;
