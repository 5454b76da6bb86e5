// src/types.rs
use crate::core::engine::EngineStatus;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the advisor wants done next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// Order side for a tradable action, `None` for hold.
    pub fn side(&self) -> Option<Side> {
        match self {
            Action::Buy => Some(Side::Buy),
            Action::Sell => Some(Side::Sell),
            Action::Hold => None,
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Action::Buy),
            "sell" => Ok(Action::Sell),
            "hold" => Ok(Action::Hold),
            other => Err(format!("invalid action: {other:?} (must be buy/sell/hold)")),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Buy => "buy",
            Action::Sell => "sell",
            Action::Hold => "hold",
        };
        f.write_str(s)
    }
}

/// A validated advisory decision. Only the advisor boundary builds these
/// from raw responses, so `amount` is always `>= 0` and `0` for holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub amount: f64, // base asset quantity
    pub confidence: u8,
    pub reason: String,
    pub stop_loss: Option<String>,
    pub take_profit: Option<String>,
}

impl Decision {
    pub fn hold(confidence: u8, reason: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            amount: 0.0,
            confidence,
            reason: reason.into(),
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn trade(action: Action, amount: f64, confidence: u8, reason: impl Into<String>) -> Self {
        Self {
            action,
            amount,
            confidence,
            reason: reason.into(),
            stop_loss: None,
            take_profit: None,
        }
    }
}

/// Unvalidated advisor payload, exactly as the advisor produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvisorResponse {
    pub action: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub stop_loss: Option<String>,
    #[serde(default)]
    pub take_profit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal, // Last trade price
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h: Decimal,
    pub change_24h: Decimal, // percent
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64, // ms
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSummary {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub buy_pressure: f64,
    pub sell_pressure: f64,
    pub pressure_ratio: f64, // > 1.0 means bids outweigh asks
}

impl OrderBook {
    /// Summarizes the top `levels` of each side into buy/sell pressure.
    pub fn summarize(&self, levels: usize) -> OrderBookSummary {
        let bids: Vec<PriceLevel> = self.bids.iter().take(levels).copied().collect();
        let asks: Vec<PriceLevel> = self.asks.iter().take(levels).copied().collect();

        let pressure = |side: &[PriceLevel]| -> f64 {
            side.iter().filter_map(|l| l.size.to_f64()).sum()
        };
        let buy_pressure = pressure(&bids);
        let sell_pressure = pressure(&asks);
        let pressure_ratio = if sell_pressure > 0.0 {
            buy_pressure / sell_pressure
        } else {
            1.0
        };

        OrderBookSummary {
            bids,
            asks,
            buy_pressure,
            sell_pressure,
            pressure_ratio,
        }
    }
}

/// Everything the advisor gets to see about the market for one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub last_price: Decimal,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h: Decimal,
    pub change_24h: Decimal,
    pub candles_1m: Vec<Candle>,
    pub candles_5m: Vec<Candle>,
    pub candles_15m: Vec<Candle>,
    pub order_book: Option<OrderBookSummary>,
}

impl MarketSnapshot {
    pub fn from_ticker(ticker: Ticker) -> Self {
        Self {
            symbol: ticker.symbol,
            timestamp: ticker.timestamp,
            last_price: ticker.price,
            bid_price: ticker.bid_price,
            ask_price: ticker.ask_price,
            high_24h: ticker.high_24h,
            low_24h: ticker.low_24h,
            volume_24h: ticker.volume_24h,
            change_24h: ticker.change_24h,
            candles_1m: Vec::new(),
            candles_5m: Vec::new(),
            candles_15m: Vec::new(),
            order_book: None,
        }
    }

    pub fn price(&self) -> f64 {
        self.last_price.to_f64().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub available: Decimal,
    pub total: Decimal,
}

/// Account view refreshed every tick. Read-only to the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub base_asset: String,
    pub quote_asset: String,
    pub balances: HashMap<String, AssetBalance>,
    pub max_position: f64, // in base asset
}

impl AccountState {
    pub fn new(
        base_asset: impl Into<String>,
        quote_asset: impl Into<String>,
        balances: Vec<AssetBalance>,
        max_position: f64,
    ) -> Self {
        Self {
            base_asset: base_asset.into(),
            quote_asset: quote_asset.into(),
            balances: balances
                .into_iter()
                .map(|b| (b.asset.clone(), b))
                .collect(),
            max_position,
        }
    }

    fn amount(&self, asset: &str, pick: fn(&AssetBalance) -> Decimal) -> f64 {
        self.balances
            .get(asset)
            .and_then(|b| pick(b).to_f64())
            .unwrap_or(0.0)
    }

    pub fn base_available(&self) -> f64 {
        self.amount(&self.base_asset, |b| b.available)
    }

    pub fn base_total(&self) -> f64 {
        self.amount(&self.base_asset, |b| b.total)
    }

    pub fn quote_available(&self) -> f64 {
        self.amount(&self.quote_asset, |b| b.available)
    }

    pub fn quote_total(&self) -> f64 {
        self.amount(&self.quote_asset, |b| b.total)
    }

    /// Shifts both base and quote balances (available and total) by the
    /// given amounts. Missing assets start from zero; results never go
    /// below zero.
    pub fn with_simulated_fills(mut self, base_delta: f64, quote_delta: f64) -> Self {
        for (asset, delta) in [
            (self.base_asset.clone(), base_delta),
            (self.quote_asset.clone(), quote_delta),
        ] {
            let Some(delta) = Decimal::from_f64(delta).filter(|d| !d.is_zero()) else {
                continue;
            };
            let balance = self
                .balances
                .entry(asset.clone())
                .or_insert_with(|| AssetBalance {
                    asset,
                    available: Decimal::ZERO,
                    total: Decimal::ZERO,
                });
            balance.available = (balance.available + delta).max(Decimal::ZERO);
            balance.total = (balance.total + delta).max(Decimal::ZERO);
        }
        self
    }

    /// Account equity in quote currency at `price`.
    pub fn total_value(&self, price: f64) -> f64 {
        self.quote_total() + self.base_total() * price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub symbol: String,
    pub status: String,
    pub executed_qty: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub fee: Option<Decimal>, // in quote currency
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Filled,
    Simulated,
}

/// One executed decision. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub profit: f64, // realized, quote currency
    pub profit_rate: f64,
    pub decision: Decision,
    pub status: TradeStatus,
}

// --- Dashboard events ---

#[derive(Debug, Clone)]
pub enum UiEvent {
    PriceUpdate { symbol: String, price: f64 },
    Decision(Decision),
    TradeExecuted(Trade),
    Status(Box<EngineStatus>),
    Log(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: i64, size: i64) -> PriceLevel {
        PriceLevel {
            price: Decimal::from(price),
            size: Decimal::from(size),
        }
    }

    #[test]
    fn action_parses_case_insensitively() {
        assert_eq!(" BUY ".parse::<Action>(), Ok(Action::Buy));
        assert_eq!("Hold".parse::<Action>(), Ok(Action::Hold));
        assert!("short".parse::<Action>().is_err());
    }

    #[test]
    fn order_book_pressure_uses_top_levels_only() {
        let book = OrderBook {
            bids: vec![level(100, 3), level(99, 1), level(98, 50)],
            asks: vec![level(101, 2), level(102, 2)],
        };
        let summary = book.summarize(2);
        assert_eq!(summary.bids.len(), 2);
        assert!((summary.buy_pressure - 4.0).abs() < 1e-12);
        assert!((summary.sell_pressure - 4.0).abs() < 1e-12);
        assert!((summary.pressure_ratio - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_ask_side_gives_neutral_ratio() {
        let book = OrderBook {
            bids: vec![level(100, 3)],
            asks: vec![],
        };
        assert_eq!(book.summarize(10).pressure_ratio, 1.0);
    }

    #[test]
    fn simulated_fills_shift_both_assets() {
        let account = AccountState::new(
            "BTC",
            "USDT",
            vec![AssetBalance {
                asset: "USDT".into(),
                available: Decimal::from(100),
                total: Decimal::from(100),
            }],
            1.0,
        )
        .with_simulated_fills(0.25, -150.0);

        assert!((account.base_total() - 0.25).abs() < 1e-12);
        assert!((account.base_available() - 0.25).abs() < 1e-12);
        assert_eq!(account.quote_available(), 0.0);

        let account = account.with_simulated_fills(-0.5, 0.0);
        assert_eq!(account.base_available(), 0.0);
    }

    #[test]
    fn market_is_the_only_order_type() {
        assert_eq!(OrderType::Market.as_str(), "MARKET");
        assert_eq!(serde_json::to_string(&OrderType::Market).unwrap(), "\"market\"");
    }

    #[test]
    fn account_equity_combines_both_assets() {
        let account = AccountState::new(
            "BTC",
            "USDT",
            vec![
                AssetBalance {
                    asset: "USDT".into(),
                    available: Decimal::from(400),
                    total: Decimal::from(500),
                },
                AssetBalance {
                    asset: "BTC".into(),
                    available: Decimal::new(1, 2),
                    total: Decimal::new(2, 2),
                },
            ],
            0.1,
        );
        assert!((account.quote_available() - 400.0).abs() < 1e-9);
        assert!((account.base_available() - 0.01).abs() < 1e-12);
        assert!((account.total_value(10_000.0) - 700.0).abs() < 1e-9);
    }
}
