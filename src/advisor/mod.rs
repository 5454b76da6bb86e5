pub mod cache;
pub mod llm;
pub mod traits;
