// src/core/risk.rs
use crate::core::performance::PerformanceMetrics;
use crate::core::position::{Position, PositionSide};
use crate::types::{AccountState, Action, Decision, Trade};
use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

/// Days of per-day P&L kept by `reset_daily_stats`, today included.
const DAILY_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_position_ratio: f64, // 0-1 of account max position
    pub max_drawdown: f64,       // 0-1
    pub min_confidence: u8,      // 0-100
    pub max_trades_per_hour: usize,
    pub min_trade_interval: u64, // seconds
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    pub emergency_stop: bool,
    pub daily_loss_limit: f64, // fraction of initial balance
    pub allow_short_sell: bool,
    pub min_quote_balance: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_ratio: 0.8,
            max_drawdown: 0.15,
            min_confidence: 60,
            max_trades_per_hour: 10,
            min_trade_interval: 30,
            stop_loss_percent: 0.03,
            take_profit_percent: 0.05,
            emergency_stop: false,
            daily_loss_limit: 0.10,
            allow_short_sell: false,
            min_quote_balance: 10.0,
        }
    }
}

/// Outcome of a risk check. Rejections name the rule that fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskCheck {
    pub approved: bool,
    pub reason: String,
}

impl RiskCheck {
    fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskStats {
    pub recent_trades_1h: usize,
    pub max_trades_per_hour: usize,
    pub today_pnl: f64,
    pub secs_since_last_trade: Option<i64>,
    pub emergency_stop: bool,
    pub total_recorded: usize,
}

#[derive(Debug)]
struct RiskState {
    config: RiskConfig,
    trade_history: VecDeque<DateTime<Utc>>,
    daily_pnl: BTreeMap<NaiveDate, f64>,
    last_trade_time: Option<DateTime<Utc>>,
    emergency_stop: bool,
    total_recorded: usize,
}

impl RiskState {
    fn stopped(&self) -> bool {
        self.emergency_stop || self.config.emergency_stop
    }

    // Timestamps are not guaranteed to be ordered if the wall clock steps back.
    fn prune_history(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(1);
        self.trade_history.retain(|t| *t > cutoff);
    }

    fn pnl_on(&self, day: NaiveDate) -> f64 {
        self.daily_pnl.get(&day).copied().unwrap_or(0.0)
    }
}

fn local_day(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Gate for every non-hold decision, plus rolling frequency and daily
/// P&L bookkeeping. All state sits behind one reader/writer lock.
#[derive(Debug)]
pub struct RiskManager {
    state: RwLock<RiskState>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            state: RwLock::new(RiskState {
                config,
                trade_history: VecDeque::new(),
                daily_pnl: BTreeMap::new(),
                last_trade_time: None,
                emergency_stop: false,
                total_recorded: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RiskState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RiskState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(
        &self,
        decision: &Decision,
        account: &AccountState,
        metrics: &PerformanceMetrics,
    ) -> RiskCheck {
        self.check_at(decision, account, metrics, Utc::now())
    }

    /// Rules run in a fixed order and stop at the first failure.
    pub fn check_at(
        &self,
        decision: &Decision,
        account: &AccountState,
        metrics: &PerformanceMetrics,
        now: DateTime<Utc>,
    ) -> RiskCheck {
        let mut state = self.write();
        let cfg = state.config.clone();

        // 1. emergency stop
        if state.stopped() {
            return RiskCheck::reject("emergency stop is active");
        }

        // 2. holds never trade
        if decision.action == Action::Hold {
            return RiskCheck::approve("hold requires no risk check");
        }

        // 3. confidence
        if decision.confidence < cfg.min_confidence {
            return RiskCheck::reject(format!(
                "confidence too low (need >= {}, got {})",
                cfg.min_confidence, decision.confidence
            ));
        }

        // 4. drawdown
        if metrics.current_drawdown > cfg.max_drawdown {
            return RiskCheck::reject(format!(
                "drawdown above limit ({:.2}% > {:.2}%)",
                metrics.current_drawdown * 100.0,
                cfg.max_drawdown * 100.0
            ));
        }

        // 5. trades in the trailing hour
        state.prune_history(now);
        if state.trade_history.len() >= cfg.max_trades_per_hour {
            return RiskCheck::reject(format!(
                "trade frequency limit reached ({} per hour)",
                cfg.max_trades_per_hour
            ));
        }

        // 6. spacing between trades
        if let Some(last) = state.last_trade_time {
            let elapsed_ms = (now - last).num_milliseconds();
            if elapsed_ms < (cfg.min_trade_interval as i64) * 1000 {
                return RiskCheck::reject(format!(
                    "trade interval too short (minimum {}s)",
                    cfg.min_trade_interval
                ));
            }
        }

        // 7. daily loss
        let today_pnl = state.pnl_on(local_day(now));
        if today_pnl < 0.0 && metrics.initial_balance > 0.0 {
            let loss = -today_pnl / metrics.initial_balance;
            if loss > cfg.daily_loss_limit {
                return RiskCheck::reject(format!(
                    "daily loss limit exceeded ({:.2}% > {:.2}%)",
                    loss * 100.0,
                    cfg.daily_loss_limit * 100.0
                ));
            }
        }

        match decision.action {
            Action::Buy => {
                // 8. position limit
                let max_allowed = account.max_position * cfg.max_position_ratio;
                let target = account.base_total() + decision.amount;
                if target > max_allowed {
                    return RiskCheck::reject(format!(
                        "position limit exceeded (target {:.6} > max {:.6})",
                        target, max_allowed
                    ));
                }

                // 10. minimum funds
                if account.quote_available() < cfg.min_quote_balance {
                    return RiskCheck::reject(format!(
                        "insufficient {} balance ({:.2} < {:.2})",
                        account.quote_asset,
                        account.quote_available(),
                        cfg.min_quote_balance
                    ));
                }
            }
            Action::Sell => {
                // 9. short selling
                if !cfg.allow_short_sell && account.base_available() < decision.amount {
                    return RiskCheck::reject(format!(
                        "short selling disabled and {} balance insufficient ({:.6} < {:.6})",
                        account.base_asset,
                        account.base_available(),
                        decision.amount
                    ));
                }
            }
            Action::Hold => {}
        }

        RiskCheck::approve("all risk checks passed")
    }

    /// Feeds an executed trade into the frequency window and the daily
    /// bucket of the trade's local calendar day.
    pub fn record_trade(&self, trade: &Trade) {
        let mut state = self.write();
        state.trade_history.push_back(trade.timestamp);
        state.last_trade_time = Some(match state.last_trade_time {
            Some(prev) if prev > trade.timestamp => prev,
            _ => trade.timestamp,
        });
        *state.daily_pnl.entry(local_day(trade.timestamp)).or_insert(0.0) += trade.profit;
        state.total_recorded += 1;
    }

    pub fn reset_daily_stats(&self) {
        self.reset_daily_stats_at(Local::now().date_naive());
    }

    /// Drops per-day buckets older than the last seven calendar days.
    pub fn reset_daily_stats_at(&self, today: NaiveDate) {
        let cutoff = today - Duration::days(DAILY_RETENTION_DAYS - 1);
        let mut state = self.write();
        let before = state.daily_pnl.len();
        state.daily_pnl.retain(|day, _| *day >= cutoff);
        info!(
            "Daily risk stats reset: kept {} of {} day buckets",
            state.daily_pnl.len(),
            before
        );
    }

    pub fn trigger_emergency_stop(&self, reason: &str) {
        let mut state = self.write();
        if !state.stopped() {
            warn!("Emergency stop triggered: {}", reason);
        }
        state.emergency_stop = true;
        state.config.emergency_stop = true;
    }

    pub fn resume(&self) {
        let mut state = self.write();
        if state.stopped() {
            info!("Trading resumed");
        }
        state.emergency_stop = false;
        state.config.emergency_stop = false;
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.read().stopped()
    }

    pub fn update_config(&self, config: RiskConfig) {
        self.write().config = config;
    }

    pub fn config(&self) -> RiskConfig {
        self.read().config.clone()
    }

    pub fn daily_pnl(&self) -> BTreeMap<NaiveDate, f64> {
        self.read().daily_pnl.clone()
    }

    pub fn stats(&self) -> RiskStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> RiskStats {
        let state = self.read();
        let cutoff = now - Duration::hours(1);
        RiskStats {
            recent_trades_1h: state.trade_history.iter().filter(|t| **t > cutoff).count(),
            max_trades_per_hour: state.config.max_trades_per_hour,
            today_pnl: state.pnl_on(local_day(now)),
            secs_since_last_trade: state.last_trade_time.map(|t| (now - t).num_seconds()),
            emergency_stop: state.stopped(),
            total_recorded: state.total_recorded,
        }
    }

    pub fn should_stop_loss(&self, position: &Position) -> bool {
        let limit = self.read().config.stop_loss_percent;
        match (position.side, position.price_change_pct()) {
            (Some(PositionSide::Long), Some(change)) => change < -limit,
            (Some(PositionSide::Short), Some(change)) => change > limit,
            _ => false,
        }
    }

    pub fn should_take_profit(&self, position: &Position) -> bool {
        let target = self.read().config.take_profit_percent;
        match (position.side, position.price_change_pct()) {
            (Some(PositionSide::Long), Some(change)) => change > target,
            (Some(PositionSide::Short), Some(change)) => change < -target,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::performance::PerformanceTracker;
    use crate::types::{AssetBalance, Side, TradeStatus};
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    fn account(quote: f64, base: f64) -> AccountState {
        let balance = |asset: &str, v: f64| AssetBalance {
            asset: asset.into(),
            available: Decimal::from_f64(v).unwrap(),
            total: Decimal::from_f64(v).unwrap(),
        };
        AccountState::new("BTC", "USDT", vec![balance("USDT", quote), balance("BTC", base)], 1.0)
    }

    fn metrics() -> PerformanceMetrics {
        PerformanceTracker::new(1000.0).metrics()
    }

    fn trade_at(ts: DateTime<Utc>, profit: f64) -> Trade {
        Trade {
            id: "t".into(),
            timestamp: ts,
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            price: 100.0,
            amount: 0.1,
            fee: 0.0,
            profit,
            profit_rate: 0.0,
            decision: Decision::trade(Action::Buy, 0.1, 90, "test"),
            status: TradeStatus::Filled,
        }
    }

    fn buy(amount: f64, confidence: u8) -> Decision {
        Decision::trade(Action::Buy, amount, confidence, "test")
    }

    #[test]
    fn hold_is_always_approved() {
        let rm = RiskManager::new(RiskConfig {
            max_trades_per_hour: 1,
            ..Default::default()
        });
        let now = Utc::now();
        rm.record_trade(&trade_at(now, -500.0));

        let mut m = metrics();
        m.current_drawdown = 0.9;
        let check = rm.check_at(&Decision::hold(0, "wait"), &account(0.0, 0.0), &m, now);
        assert!(check.approved);
    }

    #[test]
    fn emergency_stop_blocks_even_holds() {
        let rm = RiskManager::new(RiskConfig::default());
        rm.trigger_emergency_stop("test");
        rm.trigger_emergency_stop("again");
        assert!(rm.is_emergency_stopped());

        let check = rm.check(&Decision::hold(90, "wait"), &account(1000.0, 0.0), &metrics());
        assert!(!check.approved);
        assert!(check.reason.contains("emergency"));

        rm.resume();
        rm.resume();
        assert!(!rm.is_emergency_stopped());
        assert!(rm.check(&buy(0.1, 90), &account(1000.0, 0.0), &metrics()).approved);
    }

    #[test]
    fn confidence_fires_before_drawdown() {
        let rm = RiskManager::new(RiskConfig::default());
        let mut m = metrics();
        m.current_drawdown = 0.5;

        let check = rm.check(&buy(0.1, 30), &account(1000.0, 0.0), &m);
        assert!(!check.approved);
        assert!(check.reason.contains("confidence"));

        let check = rm.check(&buy(0.1, 90), &account(1000.0, 0.0), &m);
        assert!(check.reason.contains("drawdown"));
    }

    #[test]
    fn frequency_window_slides() {
        let rm = RiskManager::new(RiskConfig {
            max_trades_per_hour: 2,
            min_trade_interval: 0,
            ..Default::default()
        });
        let now = Utc::now();
        rm.record_trade(&trade_at(now - Duration::minutes(90), 0.0));
        rm.record_trade(&trade_at(now - Duration::minutes(30), 0.0));
        assert!(rm.check_at(&buy(0.1, 90), &account(1000.0, 0.0), &metrics(), now).approved);

        rm.record_trade(&trade_at(now - Duration::minutes(10), 0.0));
        let check = rm.check_at(&buy(0.1, 90), &account(1000.0, 0.0), &metrics(), now);
        assert!(!check.approved);
        assert!(check.reason.contains("frequency"));

        // Once the older trade leaves the window there is room again.
        let later = now + Duration::minutes(31);
        assert!(rm.check_at(&buy(0.1, 90), &account(1000.0, 0.0), &metrics(), later).approved);
    }

    #[test]
    fn frequency_window_tolerates_out_of_order_timestamps() {
        let rm = RiskManager::new(RiskConfig {
            max_trades_per_hour: 2,
            min_trade_interval: 0,
            ..Default::default()
        });
        let now = Utc::now();
        rm.record_trade(&trade_at(now - Duration::minutes(10), 0.0));
        rm.record_trade(&trade_at(now - Duration::minutes(90), 0.0));

        let check = rm.check_at(&buy(0.1, 90), &account(1000.0, 0.0), &metrics(), now);
        assert!(check.approved, "{}", check.reason);
        assert_eq!(rm.stats_at(now).recent_trades_1h, 1);
    }

    #[test]
    fn minimum_interval_between_trades() {
        let rm = RiskManager::new(RiskConfig::default());
        let now = Utc::now();
        assert!(rm.check_at(&buy(0.1, 90), &account(1000.0, 0.0), &metrics(), now).approved);

        rm.record_trade(&trade_at(now - Duration::seconds(10), 0.0));
        let check = rm.check_at(&buy(0.1, 90), &account(1000.0, 0.0), &metrics(), now);
        assert!(check.reason.contains("interval"));

        let later = now + Duration::seconds(25);
        assert!(rm.check_at(&buy(0.1, 90), &account(1000.0, 0.0), &metrics(), later).approved);
    }

    #[test]
    fn daily_loss_limit() {
        let rm = RiskManager::new(RiskConfig {
            min_trade_interval: 0,
            ..Default::default()
        });
        let now = Utc::now();
        rm.record_trade(&trade_at(now, -100.0));
        assert!(rm.check_at(&buy(0.1, 90), &account(1000.0, 0.0), &metrics(), now).approved);

        rm.record_trade(&trade_at(now, -1.0));
        let check = rm.check_at(&buy(0.1, 90), &account(1000.0, 0.0), &metrics(), now);
        assert!(!check.approved);
        assert!(check.reason.contains("daily loss"));
        assert!((rm.stats_at(now).today_pnl + 101.0).abs() < 1e-9);
    }

    #[test]
    fn position_limit_on_buys() {
        let rm = RiskManager::new(RiskConfig::default());
        // max 1.0 * 0.8, already holding 0.5
        let acct = account(1000.0, 0.5);
        assert!(rm.check(&buy(0.25, 90), &acct, &metrics()).approved);

        let check = rm.check(&buy(0.31, 90), &acct, &metrics());
        assert!(!check.approved);
        assert!(check.reason.contains("position limit"));
    }

    #[test]
    fn short_selling_needs_inventory_unless_allowed() {
        let rm = RiskManager::new(RiskConfig::default());
        let sell = Decision::trade(Action::Sell, 0.2, 90, "test");

        let check = rm.check(&sell, &account(1000.0, 0.1), &metrics());
        assert!(check.reason.contains("short selling"));
        assert!(rm.check(&sell, &account(1000.0, 0.2), &metrics()).approved);

        rm.update_config(RiskConfig {
            allow_short_sell: true,
            ..Default::default()
        });
        assert!(rm.check(&sell, &account(1000.0, 0.0), &metrics()).approved);
    }

    #[test]
    fn buys_need_minimum_quote_funds() {
        let rm = RiskManager::new(RiskConfig::default());
        let check = rm.check(&buy(0.1, 90), &account(9.99, 0.0), &metrics());
        assert!(!check.approved);
        assert!(check.reason.contains("insufficient"));
    }

    #[test]
    fn reset_keeps_last_seven_days() {
        let rm = RiskManager::new(RiskConfig::default());
        let today = Local::now().date_naive();
        let noon = today.and_hms_opt(12, 0, 0).unwrap();
        for back in 0..10 {
            let ts = (noon - Duration::days(back))
                .and_local_timezone(Local)
                .single()
                .unwrap()
                .with_timezone(&Utc);
            rm.record_trade(&trade_at(ts, 1.0));
        }
        assert_eq!(rm.daily_pnl().len(), 10);

        rm.reset_daily_stats_at(today);
        let kept = rm.daily_pnl();
        assert_eq!(kept.len(), 7);
        assert_eq!(kept.keys().next().copied(), Some(today - Duration::days(6)));
    }

    #[test]
    fn stop_loss_and_take_profit_by_side() {
        let rm = RiskManager::new(RiskConfig::default());
        let mut long = Position::flat("BTCUSDT");
        long.apply(Side::Buy, 100.0, 1.0, Utc::now());

        assert!(rm.should_stop_loss(&long.marked(96.0)));
        assert!(!rm.should_stop_loss(&long.marked(98.0)));
        assert!(rm.should_take_profit(&long.marked(106.0)));

        let mut short = Position::flat("BTCUSDT");
        short.apply(Side::Sell, 100.0, 1.0, Utc::now());
        assert!(rm.should_stop_loss(&short.marked(104.0)));
        assert!(rm.should_take_profit(&short.marked(94.0)));

        assert!(!rm.should_stop_loss(&Position::flat("BTCUSDT")));
    }

    #[test]
    fn stats_reflect_history() {
        let rm = RiskManager::new(RiskConfig::default());
        let now = Utc::now();
        assert_eq!(rm.stats_at(now).secs_since_last_trade, None);

        rm.record_trade(&trade_at(now - Duration::seconds(42), 5.0));
        let stats = rm.stats_at(now);
        assert_eq!(stats.recent_trades_1h, 1);
        assert_eq!(stats.secs_since_last_trade, Some(42));
        assert_eq!(stats.total_recorded, 1);
        assert!(!stats.emergency_stop);
    }
}
