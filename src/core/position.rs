// src/core/position.rs
use crate::types::Side;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remaining size below this is treated as a closed position.
const FLAT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    fn opened_by(side: Side) -> Self {
        match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }

    fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

/// How a fill changed the position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FillEffect {
    pub realized_pnl: f64,
    pub closed_amount: f64,
    pub opened_amount: f64,
}

/// Exposure in a single instrument. `side` is `None` while flat.
///
/// `realized_pnl` is a lifetime total: it survives the reset that happens
/// when the position closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Option<PositionSide>,
    pub amount: f64,
    pub entry_price: f64, // volume-weighted
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub open_time: Option<DateTime<Utc>>,
}

impl Position {
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            side: None,
            amount: 0.0,
            entry_price: 0.0,
            current_price: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            open_time: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side.is_none() || self.amount <= FLAT_EPSILON
    }

    /// Computes what a fill would do without touching the position.
    pub fn preview(&self, side: Side, price: f64, quantity: f64) -> FillEffect {
        if quantity <= 0.0 {
            return FillEffect::default();
        }

        match self.side {
            Some(held) if !self.is_flat() && held != PositionSide::opened_by(side) => {
                let closed = quantity.min(self.amount);
                let remainder = quantity - closed;
                FillEffect {
                    realized_pnl: (price - self.entry_price) * closed * held.sign(),
                    closed_amount: closed,
                    opened_amount: if remainder > FLAT_EPSILON { remainder } else { 0.0 },
                }
            }
            _ => FillEffect {
                realized_pnl: 0.0,
                closed_amount: 0.0,
                opened_amount: quantity,
            },
        }
    }

    /// Applies an executed fill. Reducing fills realize P&L on the closed
    /// part and keep the entry price; increasing fills re-average it. A fill
    /// larger than the open size closes it and opens the rest the other way.
    pub fn apply(&mut self, side: Side, price: f64, quantity: f64, at: DateTime<Utc>) -> FillEffect {
        let effect = self.preview(side, price, quantity);

        if effect.closed_amount > 0.0 {
            self.amount -= effect.closed_amount;
            self.realized_pnl += effect.realized_pnl;
            if self.amount <= FLAT_EPSILON {
                self.reset();
            }
        }

        if effect.opened_amount > 0.0 {
            if self.is_flat() {
                self.side = Some(PositionSide::opened_by(side));
                self.amount = effect.opened_amount;
                self.entry_price = price;
                self.open_time = Some(at);
            } else {
                let cost = self.entry_price * self.amount + price * effect.opened_amount;
                self.amount += effect.opened_amount;
                self.entry_price = cost / self.amount;
            }
        }

        self.mark(price);
        effect
    }

    /// Re-marks the open remainder at `price`.
    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = match self.side {
            Some(held) if !self.is_flat() => (price - self.entry_price) * self.amount * held.sign(),
            _ => 0.0,
        };
    }

    pub fn marked(&self, price: f64) -> Position {
        let mut copy = self.clone();
        copy.mark(price);
        copy
    }

    /// Raw price move since entry, `None` while flat.
    pub fn price_change_pct(&self) -> Option<f64> {
        if self.is_flat() || self.entry_price <= 0.0 {
            return None;
        }
        Some((self.current_price - self.entry_price) / self.entry_price)
    }

    fn reset(&mut self) {
        self.side = None;
        self.amount = 0.0;
        self.entry_price = 0.0;
        self.unrealized_pnl = 0.0;
        self.open_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn consecutive_buys_average_the_entry() {
        let mut pos = Position::flat("BTCUSDT");
        pos.apply(Side::Buy, 100.0, 1.0, Utc::now());
        pos.apply(Side::Buy, 130.0, 2.0, Utc::now());

        assert_eq!(pos.side, Some(PositionSide::Long));
        assert!(approx(pos.amount, 3.0));
        assert!(approx(pos.entry_price, (100.0 * 1.0 + 130.0 * 2.0) / 3.0));
    }

    #[test]
    fn partial_sell_realizes_and_keeps_entry() {
        let mut pos = Position::flat("BTCUSDT");
        pos.apply(Side::Buy, 100.0, 2.0, Utc::now());
        let effect = pos.apply(Side::Sell, 110.0, 0.5, Utc::now());

        assert!(approx(effect.realized_pnl, 5.0));
        assert!(approx(pos.amount, 1.5));
        assert!(approx(pos.entry_price, 100.0));
        assert!(approx(pos.unrealized_pnl, 15.0));
    }

    #[test]
    fn full_close_resets_but_carries_realized_pnl() {
        let mut pos = Position::flat("BTCUSDT");
        pos.apply(Side::Buy, 100.0, 1.0, Utc::now());
        pos.apply(Side::Sell, 90.0, 1.0, Utc::now());

        assert!(pos.is_flat());
        assert_eq!(pos.side, None);
        assert_eq!(pos.symbol, "BTCUSDT");
        assert_eq!(pos.open_time, None);
        assert!(approx(pos.realized_pnl, -10.0));

        pos.apply(Side::Buy, 50.0, 1.0, Utc::now());
        pos.apply(Side::Sell, 60.0, 1.0, Utc::now());
        assert!(approx(pos.realized_pnl, 0.0));
    }

    #[test]
    fn short_profit_flips_sign() {
        let mut pos = Position::flat("BTCUSDT");
        pos.apply(Side::Sell, 200.0, 1.0, Utc::now());
        assert_eq!(pos.side, Some(PositionSide::Short));

        pos.mark(190.0);
        assert!(approx(pos.unrealized_pnl, 10.0));

        let effect = pos.apply(Side::Buy, 180.0, 1.0, Utc::now());
        assert!(approx(effect.realized_pnl, 20.0));
        assert!(pos.is_flat());
    }

    #[test]
    fn oversized_sell_flips_to_short() {
        let mut pos = Position::flat("BTCUSDT");
        pos.apply(Side::Buy, 100.0, 1.0, Utc::now());
        let effect = pos.apply(Side::Sell, 120.0, 1.5, Utc::now());

        assert!(approx(effect.closed_amount, 1.0));
        assert!(approx(effect.opened_amount, 0.5));
        assert_eq!(pos.side, Some(PositionSide::Short));
        assert!(approx(pos.amount, 0.5));
        assert!(approx(pos.entry_price, 120.0));
    }

    #[test]
    fn float_dust_counts_as_flat() {
        let mut pos = Position::flat("BTCUSDT");
        pos.apply(Side::Buy, 100.0, 0.1, Utc::now());
        pos.apply(Side::Buy, 100.0, 0.2, Utc::now());
        pos.apply(Side::Sell, 100.0, 0.3, Utc::now());
        assert!(pos.is_flat());
        assert_eq!(pos.amount, 0.0);
    }

    #[test]
    fn preview_does_not_mutate() {
        let mut pos = Position::flat("BTCUSDT");
        pos.apply(Side::Buy, 100.0, 1.0, Utc::now());
        let before = pos.clone();
        let effect = pos.preview(Side::Sell, 150.0, 1.0);
        assert!(approx(effect.realized_pnl, 50.0));
        assert_eq!(pos, before);
    }
}
