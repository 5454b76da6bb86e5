use crate::types::{AssetBalance, Candle, OrderBook, OrderResponse, OrderType, Side, Ticker};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Exchange capability consumed by the engine. Errors are surfaced as-is;
/// the engine never retries, the next tick does.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn get_account_assets(&self) -> Result<Vec<AssetBalance>>;

    async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
    ) -> Result<OrderResponse>;

    // Optional market depth; exchanges without it return nothing.
    async fn get_candles(&self, _symbol: &str, _interval: &str, _limit: usize) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn get_order_book(&self, _symbol: &str, _depth: usize) -> Result<OrderBook> {
        Ok(OrderBook::default())
    }
}
