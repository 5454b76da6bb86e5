pub mod binance;
pub mod traits;
