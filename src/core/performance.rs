// src/core/performance.rs
use crate::types::Trade;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Derived from the ledger plus the initial balance. Counts and sums are
/// advanced once per recorded trade; every ratio is recomputed from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_profit: f64,
    pub total_loss: f64, // absolute value
    pub net_profit: f64,
    pub roi: f64,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub sharpe_ratio: f64,
    pub average_trade: f64,
    pub average_win: f64,
    pub average_loss: f64,
    /// `None` until at least one losing trade exists.
    pub profit_factor: Option<f64>,
    pub total_fees: f64,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub trading_days: i64,
    pub daily_return_rate: f64,
    pub monthly_return_rate: f64,
}

impl PerformanceMetrics {
    fn new(initial_balance: f64, start_time: DateTime<Utc>) -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            total_profit: 0.0,
            total_loss: 0.0,
            net_profit: 0.0,
            roi: 0.0,
            max_drawdown: 0.0,
            current_drawdown: 0.0,
            sharpe_ratio: 0.0,
            average_trade: 0.0,
            average_win: 0.0,
            average_loss: 0.0,
            profit_factor: None,
            total_fees: 0.0,
            start_time,
            last_update_time: start_time,
            initial_balance,
            current_balance: initial_balance,
            peak_balance: initial_balance,
            trading_days: 0,
            daily_return_rate: 0.0,
            monthly_return_rate: 0.0,
        }
    }
}

/// Replays realized profits from `initial_balance` and returns the largest
/// peak-to-trough decline as a fraction of the running peak.
pub fn max_drawdown(initial_balance: f64, profits: impl IntoIterator<Item = f64>) -> f64 {
    let mut peak = initial_balance;
    let mut balance = initial_balance;
    let mut worst = 0.0_f64;

    for profit in profits {
        balance += profit;
        if balance > peak {
            peak = balance;
        }
        if peak > 0.0 {
            worst = worst.max((peak - balance) / peak);
        }
    }
    worst
}

/// Mean over Bessel-corrected standard deviation of per-trade returns,
/// annualized by sqrt(365). Zero with fewer than two returns or no variance.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();

    if std_dev == 0.0 {
        return 0.0;
    }
    mean / std_dev * 365_f64.sqrt()
}

#[derive(Debug)]
struct TrackerState {
    metrics: PerformanceMetrics,
    trades: Vec<Trade>,
    returns: Vec<f64>,
}

impl TrackerState {
    fn recalculate(&mut self, now: DateTime<Utc>) {
        let m = &mut self.metrics;

        if m.total_trades > 0 {
            m.win_rate = m.winning_trades as f64 / m.total_trades as f64;
            m.average_trade = m.net_profit_from_sums() / m.total_trades as f64;
        }
        m.net_profit = m.net_profit_from_sums();
        if m.initial_balance > 0.0 {
            m.roi = m.net_profit / m.initial_balance;
        }
        if m.peak_balance > 0.0 {
            m.current_drawdown = (m.peak_balance - m.current_balance) / m.peak_balance;
        }
        if m.winning_trades > 0 {
            m.average_win = m.total_profit / m.winning_trades as f64;
        }
        if m.losing_trades > 0 {
            m.average_loss = m.total_loss / m.losing_trades as f64;
        }
        m.profit_factor = (m.total_loss > 0.0).then(|| m.total_profit / m.total_loss);

        m.trading_days = (now - m.start_time).num_days().max(1);
        if m.initial_balance > 0.0 {
            m.daily_return_rate = m.net_profit / m.initial_balance / m.trading_days as f64;
        }
        m.monthly_return_rate = m.daily_return_rate * 30.0;

        m.max_drawdown = max_drawdown(m.initial_balance, self.trades.iter().map(|t| t.profit));
        m.sharpe_ratio = sharpe_ratio(&self.returns);
        m.last_update_time = now;
    }
}

impl PerformanceMetrics {
    fn net_profit_from_sums(&self) -> f64 {
        self.total_profit - self.total_loss
    }
}

/// Append-only trade ledger with derived metrics.
#[derive(Debug)]
pub struct PerformanceTracker {
    state: RwLock<TrackerState>,
}

impl PerformanceTracker {
    pub fn new(initial_balance: f64) -> Self {
        Self::with_start_time(initial_balance, Utc::now())
    }

    pub fn with_start_time(initial_balance: f64, start_time: DateTime<Utc>) -> Self {
        Self {
            state: RwLock::new(TrackerState {
                metrics: PerformanceMetrics::new(initial_balance, start_time),
                trades: Vec::new(),
                returns: Vec::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_trade(&self, trade: Trade) {
        self.record_trade_at(trade, Utc::now());
    }

    pub fn record_trade_at(&self, trade: Trade, now: DateTime<Utc>) {
        let mut state = self.write();
        let m = &mut state.metrics;

        m.total_trades += 1;
        if trade.profit > 0.0 {
            m.winning_trades += 1;
            m.total_profit += trade.profit;
        } else if trade.profit < 0.0 {
            m.losing_trades += 1;
            m.total_loss += trade.profit.abs();
        }
        m.total_fees += trade.fee;
        m.current_balance += trade.profit;
        if m.current_balance > m.peak_balance {
            m.peak_balance = m.current_balance;
        }

        let initial = m.initial_balance;
        if initial > 0.0 {
            state.returns.push(trade.profit / initial);
        }
        state.trades.push(trade);
        state.recalculate(now);
    }

    /// Out-of-band balance correction. Leaves the ledger, trade counts and
    /// the returns series untouched.
    pub fn update_balance(&self, new_balance: f64) {
        let mut state = self.write();
        let m = &mut state.metrics;

        m.current_balance = new_balance;
        if new_balance > m.peak_balance {
            m.peak_balance = new_balance;
        }
        if m.peak_balance > 0.0 {
            m.current_drawdown = (m.peak_balance - new_balance) / m.peak_balance;
        }
        m.last_update_time = Utc::now();
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.read().metrics.clone()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.read().trades.clone()
    }

    /// Last `n` trades, oldest first. `n == 0` returns the whole ledger.
    pub fn recent_trades(&self, n: usize) -> Vec<Trade> {
        let state = self.read();
        let len = state.trades.len();
        let n = if n == 0 || n > len { len } else { n };
        state.trades[len - n..].to_vec()
    }

    pub fn summary(&self) -> String {
        let m = self.metrics();
        let mut out = String::new();
        let rule = "=".repeat(60);

        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Performance summary");
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "[Trades]");
        let _ = writeln!(out, "  total: {}", m.total_trades);
        let _ = writeln!(out, "  winning: {} | losing: {}", m.winning_trades, m.losing_trades);
        let _ = writeln!(out, "  win rate: {:.2}%", m.win_rate * 100.0);
        let _ = writeln!(out, "[P&L]");
        let _ = writeln!(out, "  initial balance: {:.2}", m.initial_balance);
        let _ = writeln!(out, "  current balance: {:.2}", m.current_balance);
        let _ = writeln!(out, "  peak balance: {:.2}", m.peak_balance);
        let _ = writeln!(out, "  gross profit: {:.2} | gross loss: {:.2}", m.total_profit, m.total_loss);
        let _ = writeln!(out, "  net profit: {:.2} ({:.2}%)", m.net_profit, m.roi * 100.0);
        let _ = writeln!(out, "  fees: {:.2}", m.total_fees);
        let _ = writeln!(out, "[Risk]");
        let _ = writeln!(out, "  max drawdown: {:.2}%", m.max_drawdown * 100.0);
        let _ = writeln!(out, "  current drawdown: {:.2}%", m.current_drawdown * 100.0);
        let _ = writeln!(out, "  sharpe ratio: {:.2}", m.sharpe_ratio);
        match m.profit_factor {
            Some(pf) => {
                let _ = writeln!(out, "  profit factor: {pf:.2}");
            }
            None => {
                let _ = writeln!(out, "  profit factor: n/a");
            }
        }
        let _ = writeln!(out, "[Per trade]");
        let _ = writeln!(out, "  average: {:.2}", m.average_trade);
        let _ = writeln!(out, "  average win: {:.2} | average loss: {:.2}", m.average_win, m.average_loss);
        let _ = writeln!(out, "[Returns]");
        let _ = writeln!(out, "  trading days: {}", m.trading_days);
        let _ = writeln!(out, "  daily: {:.2}%", m.daily_return_rate * 100.0);
        let _ = writeln!(out, "  monthly: {:.2}%", m.monthly_return_rate * 100.0);
        let _ = writeln!(out, "  annualized: {:.2}%", m.monthly_return_rate * 12.0 * 100.0);
        let _ = write!(out, "{rule}");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Decision, Side, TradeStatus};
    use chrono::Duration;

    fn trade(profit: f64, fee: f64) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            symbol: "BTCUSDT".into(),
            side: Side::Sell,
            price: 100.0,
            amount: 1.0,
            fee,
            profit,
            profit_rate: 0.0,
            decision: Decision::hold(80, "test"),
            status: TradeStatus::Filled,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn single_winning_trade() {
        let tracker = PerformanceTracker::new(1000.0);
        tracker.record_trade(trade(50.0, 1.0));

        let m = tracker.metrics();
        assert_eq!(m.total_trades, 1);
        assert_eq!(m.winning_trades, 1);
        assert_eq!(m.losing_trades, 0);
        assert!(approx(m.win_rate, 1.0));
        assert!(approx(m.net_profit, 50.0));
        assert!(approx(m.current_balance, 1050.0));
        assert!(approx(m.peak_balance, 1050.0));
        assert!(approx(m.current_drawdown, 0.0));
        assert!(approx(m.total_fees, 1.0));
        assert!(approx(m.roi, 0.05));
        assert_eq!(m.profit_factor, None);
        assert_eq!(m.sharpe_ratio, 0.0);
    }

    #[test]
    fn opening_fill_counts_toward_total_only() {
        let tracker = PerformanceTracker::new(1000.0);
        tracker.record_trade(trade(0.0, 0.1));
        tracker.record_trade(trade(10.0, 0.1));

        let m = tracker.metrics();
        assert_eq!(m.total_trades, 2);
        assert_eq!(m.winning_trades, 1);
        assert_eq!(m.losing_trades, 0);
        assert!(approx(m.win_rate, 0.5));
        assert!(approx(m.average_trade, 5.0));
        assert!(m.sharpe_ratio > 0.0);
    }

    #[test]
    fn drawdown_replays_with_running_peak() {
        assert_eq!(max_drawdown(1000.0, []), 0.0);
        assert!(approx(max_drawdown(1000.0, [100.0, -50.0]), 50.0 / 1100.0));
        assert!(approx(max_drawdown(1000.0, [100.0, -50.0, 20.0, -80.0]), 0.1));
        // A new peak resets the reference point.
        assert!(approx(max_drawdown(1000.0, [-100.0, 300.0, -120.0]), 0.1));
    }

    #[test]
    fn sharpe_is_zero_when_undefined() {
        assert_eq!(sharpe_ratio(&[]), 0.0);
        assert_eq!(sharpe_ratio(&[0.05]), 0.0);
        assert_eq!(sharpe_ratio(&[0.01, 0.01, 0.01]), 0.0);
    }

    #[test]
    fn sharpe_uses_sample_deviation() {
        let returns = [0.01, 0.03];
        // mean 0.02, sample std sqrt(0.0002)
        let expected = 0.02 / 0.0002_f64.sqrt() * 365_f64.sqrt();
        assert!(approx(sharpe_ratio(&returns), expected));
    }

    #[test]
    fn mixed_ledger_metrics() {
        let tracker = PerformanceTracker::new(1000.0);
        for p in [100.0, -50.0, 20.0, -80.0] {
            tracker.record_trade(trade(p, 0.5));
        }

        let m = tracker.metrics();
        assert_eq!(m.total_trades, 4);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 2);
        assert!(approx(m.total_profit, 120.0));
        assert!(approx(m.total_loss, 130.0));
        assert!(approx(m.net_profit, -10.0));
        assert!(approx(m.current_balance, 990.0));
        assert!(approx(m.peak_balance, 1100.0));
        assert!(approx(m.max_drawdown, 0.1));
        assert!(approx(m.current_drawdown, 0.1));
        assert!(approx(m.average_win, 60.0));
        assert!(approx(m.average_loss, 65.0));
        assert!(approx(m.profit_factor.unwrap(), 120.0 / 130.0));
        assert!(approx(m.total_fees, 2.0));
    }

    #[test]
    fn trading_days_floor_at_one() {
        let start = Utc::now() - Duration::days(10);
        let tracker = PerformanceTracker::with_start_time(1000.0, start);
        tracker.record_trade(trade(100.0, 0.0));

        let m = tracker.metrics();
        assert_eq!(m.trading_days, 10);
        assert!(approx(m.daily_return_rate, 0.01));
        assert!(approx(m.monthly_return_rate, 0.3));

        let fresh = PerformanceTracker::new(1000.0);
        fresh.record_trade(trade(10.0, 0.0));
        assert_eq!(fresh.metrics().trading_days, 1);
    }

    #[test]
    fn balance_update_leaves_ledger_alone() {
        let tracker = PerformanceTracker::new(1000.0);
        tracker.record_trade(trade(10.0, 0.0));
        tracker.update_balance(900.0);

        let m = tracker.metrics();
        assert_eq!(m.total_trades, 1);
        assert!(approx(m.current_balance, 900.0));
        assert!(approx(m.peak_balance, 1010.0));
        assert!(approx(m.current_drawdown, 110.0 / 1010.0));
        assert_eq!(tracker.trades().len(), 1);

        tracker.update_balance(1200.0);
        let m = tracker.metrics();
        assert!(approx(m.peak_balance, 1200.0));
        assert!(approx(m.current_drawdown, 0.0));
    }

    #[test]
    fn accessors_return_copies() {
        let tracker = PerformanceTracker::new(1000.0);
        for p in [1.0, 2.0, 3.0] {
            tracker.record_trade(trade(p, 0.0));
        }

        let mut ledger = tracker.trades();
        ledger.clear();
        assert_eq!(tracker.trades().len(), 3);

        let recent = tracker.recent_trades(2);
        assert_eq!(recent.len(), 2);
        assert!(approx(recent[0].profit, 2.0));
        assert_eq!(tracker.recent_trades(0).len(), 3);
        assert_eq!(tracker.recent_trades(10).len(), 3);
    }

    #[test]
    fn summary_mentions_key_figures() {
        let tracker = PerformanceTracker::new(1000.0);
        tracker.record_trade(trade(50.0, 1.0));
        let summary = tracker.summary();
        assert!(summary.contains("net profit: 50.00"));
        assert!(summary.contains("profit factor: n/a"));
    }
}
