// src/core/engine.rs
use crate::advisor::cache::{CacheStats, CachedAdvisor};
use crate::advisor::traits::AdvisorClient;
use crate::config::{AppConfig, EngineConfig};
use crate::connectors::traits::ExchangeClient;
use crate::core::performance::PerformanceTracker;
use crate::core::position::Position;
use crate::core::risk::{RiskManager, RiskStats};
use crate::error::EngineError;
use crate::types::{
    AccountState, Candle, Decision, MarketSnapshot, OrderType, Side, Trade, TradeStatus, UiEvent,
};
use crate::utils::precision::order_quantity;
use anyhow::anyhow;
use chrono::{DateTime, Local, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const ORDER_BOOK_LEVELS: usize = 10;
const CANDLE_SERIES: [(&str, usize); 3] = [("1m", 15), ("5m", 12), ("15m", 8)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Idle,
    CollectingData,
    Analyzing,
    RiskChecking,
    Executing,
    Skipped,
    Stopped,
}

/// How a tick ended when nothing went wrong.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Executed(Trade),
    Held(Decision),
    Rejected(String),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub state: EngineState,
    pub symbol: String,
    pub dry_run: bool,
    pub total_trades: usize,
    pub win_rate: f64,
    pub net_profit: f64,
    pub roi: f64,
    pub current_balance: f64,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub position: Position,
    pub risk_stats: RiskStats,
    pub advisor_cache_hits: u64,
    pub advisor_last_update: Option<DateTime<Utc>>,
}

/// Cheap, cloneable read side of a running engine.
#[derive(Clone)]
pub struct StatusReader {
    symbol: String,
    dry_run: bool,
    running: Arc<AtomicBool>,
    risk: Arc<RiskManager>,
    performance: Arc<PerformanceTracker>,
    position: watch::Receiver<Position>,
    cache: watch::Receiver<CacheStats>,
    state: watch::Receiver<EngineState>,
}

impl StatusReader {
    pub fn status(&self) -> EngineStatus {
        let m = self.performance.metrics();
        let cache = *self.cache.borrow();
        EngineStatus {
            running: self.running.load(Ordering::SeqCst),
            state: *self.state.borrow(),
            symbol: self.symbol.clone(),
            dry_run: self.dry_run,
            total_trades: m.total_trades,
            win_rate: m.win_rate,
            net_profit: m.net_profit,
            roi: m.roi,
            current_balance: m.current_balance,
            max_drawdown: m.max_drawdown,
            current_drawdown: m.current_drawdown,
            position: self.position.borrow().clone(),
            risk_stats: self.risk.stats(),
            advisor_cache_hits: cache.hit_count,
            advisor_last_update: cache.last_update,
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| anyhow!("{} timed out after {:?}", operation, limit))?
}

pub struct TradingEngine {
    config: EngineConfig,
    exchange: Arc<dyn ExchangeClient>,
    advisor: CachedAdvisor,
    risk: Arc<RiskManager>,
    performance: Arc<PerformanceTracker>,
    position: Position,
    // Net effect of dry-run fills, which the exchange account never sees.
    simulated_base: f64,
    simulated_quote: f64,
    position_tx: watch::Sender<Position>,
    cache_tx: watch::Sender<CacheStats>,
    state_tx: watch::Sender<EngineState>,
    reader: StatusReader,
    ui_sender: Option<mpsc::Sender<UiEvent>>,
}

impl TradingEngine {
    /// Builds the engine and its risk/performance components. The exchange
    /// must be reachable: the initial balance comes from the live account
    /// unless `engine.initial_balance` is configured.
    pub async fn new(
        config: AppConfig,
        exchange: Arc<dyn ExchangeClient>,
        advisor: Box<dyn AdvisorClient>,
    ) -> Result<Self, EngineError> {
        let engine_cfg = config.engine.clone();
        let timeout = engine_cfg.request_timeout();

        let assets = with_timeout(timeout, "get_account_assets", exchange.get_account_assets())
            .await
            .map_err(EngineError::Construction)?;
        let account = AccountState::new(
            &engine_cfg.base_asset,
            &engine_cfg.quote_asset,
            assets,
            engine_cfg.max_position,
        );

        let initial_balance = match engine_cfg.initial_balance {
            Some(balance) => balance,
            None => {
                let ticker = with_timeout(timeout, "get_ticker", exchange.get_ticker(&engine_cfg.symbol))
                    .await
                    .map_err(EngineError::Construction)?;
                account.total_value(ticker.price.to_f64().unwrap_or(0.0))
            }
        };
        if initial_balance <= 0.0 {
            return Err(EngineError::Construction(anyhow!(
                "initial balance must be positive, got {:.2}",
                initial_balance
            )));
        }

        let risk = Arc::new(RiskManager::new(config.risk.clone()));
        let performance = Arc::new(PerformanceTracker::new(initial_balance));
        let advisor = CachedAdvisor::new(advisor, config.advisor.cache_policy(), timeout);
        let position = Position::flat(&engine_cfg.symbol);

        let (position_tx, position_rx) = watch::channel(position.clone());
        let (cache_tx, cache_rx) = watch::channel(advisor.stats());
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);

        let reader = StatusReader {
            symbol: engine_cfg.symbol.clone(),
            dry_run: engine_cfg.dry_run,
            running: Arc::new(AtomicBool::new(false)),
            risk: risk.clone(),
            performance: performance.clone(),
            position: position_rx,
            cache: cache_rx,
            state: state_rx,
        };

        Ok(Self {
            config: engine_cfg,
            exchange,
            advisor,
            risk,
            performance,
            position,
            simulated_base: 0.0,
            simulated_quote: 0.0,
            position_tx,
            cache_tx,
            state_tx,
            reader,
            ui_sender: None,
        })
    }

    pub fn with_ui(mut self, sender: mpsc::Sender<UiEvent>) -> Self {
        self.ui_sender = Some(sender);
        self
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn risk(&self) -> Arc<RiskManager> {
        self.risk.clone()
    }

    pub fn performance(&self) -> Arc<PerformanceTracker> {
        self.performance.clone()
    }

    pub fn status_reader(&self) -> StatusReader {
        self.reader.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.reader.status()
    }

    fn send_ui_event(&self, event: UiEvent) {
        let Some(sender) = &self.ui_sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("UI Channel closed! Interface is likely dead.");
            }
        }
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
    }

    /// Spawns the tick loop (first tick runs immediately) and the daily
    /// risk reset task.
    pub fn start(mut self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reader = self.reader.clone();
        reader.running.store(true, Ordering::SeqCst);

        self.log_startup_banner();

        let daily_task = tokio::spawn(daily_reset_loop(self.risk.clone(), shutdown_rx.clone()));
        let tick_task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
            self
        });

        EngineHandle {
            shutdown_tx,
            tick_task,
            daily_task,
            reader,
        }
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Engine loop running. Interval: {}s, Dry run: {}",
            self.config.decision_interval_secs, self.config.dry_run
        );
        let mut interval = tokio::time::interval(self.config.decision_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            // A started tick always runs to completion; cancellation is only
            // observed between ticks.
            match self.tick().await {
                Ok(outcome) => debug!("Tick finished: {:?}", outcome),
                Err(e) => {
                    error!("Tick aborted: {}", e);
                    self.send_ui_event(UiEvent::Log(format!("ERROR {}", e)));
                }
            }
            self.send_ui_event(UiEvent::Status(Box::new(self.status())));
        }

        self.set_state(EngineState::Stopped);
        info!("Engine loop stopped");
    }

    /// One full decision cycle. Failures leave position and metrics exactly
    /// as they were.
    pub async fn tick(&mut self) -> Result<TickOutcome, EngineError> {
        let result = self.run_pipeline().await;
        self.set_state(EngineState::Idle);
        result
    }

    async fn run_pipeline(&mut self) -> Result<TickOutcome, EngineError> {
        // 1. Collect
        self.set_state(EngineState::CollectingData);
        let snapshot = self.collect_market_data().await?;
        let account = self.collect_account().await?;
        let price = snapshot.price();
        self.send_ui_event(UiEvent::PriceUpdate {
            symbol: snapshot.symbol.clone(),
            price,
        });

        // 2. Analyze
        self.set_state(EngineState::Analyzing);
        let analysis = self.advisor.analyze(&snapshot, &account).await;
        self.cache_tx.send_replace(self.advisor.stats());
        let decision = analysis?;
        info!(
            "Decision: {} | amount: {:.6} | confidence: {}% | reason: {}",
            decision.action, decision.amount, decision.confidence, decision.reason
        );
        self.send_ui_event(UiEvent::Decision(decision.clone()));

        // 3. Risk
        self.set_state(EngineState::RiskChecking);
        let check = self
            .risk
            .check(&decision, &account, &self.performance.metrics());
        self.watch_exit_levels(price);

        if !check.approved {
            warn!("Risk rejected: {}", check.reason);
            self.send_ui_event(UiEvent::Log(format!("Rejected: {}", check.reason)));
            self.set_state(EngineState::Skipped);
            self.sync_balance(&account, price);
            return Ok(TickOutcome::Rejected(check.reason));
        }
        info!("Risk approved: {}", check.reason);

        let Some(side) = decision.action.side() else {
            info!("Holding");
            self.set_state(EngineState::Skipped);
            self.sync_balance(&account, price);
            return Ok(TickOutcome::Held(decision));
        };

        // 4. Execute
        self.set_state(EngineState::Executing);
        let Some(trade) = self.execute(side, &decision, &snapshot).await? else {
            self.set_state(EngineState::Skipped);
            return Ok(TickOutcome::Skipped(format!(
                "amount {:.8} rounds to zero at step {}",
                decision.amount, self.config.step_size
            )));
        };

        // 5. Bookkeeping: ledgers first, then the position.
        self.performance.record_trade(trade.clone());
        self.risk.record_trade(&trade);
        self.position
            .apply(trade.side, trade.price, trade.amount, trade.timestamp);
        self.position_tx.send_replace(self.position.clone());
        if trade.status == TradeStatus::Simulated {
            let notional = trade.amount * trade.price;
            match trade.side {
                Side::Buy => {
                    self.simulated_base += trade.amount;
                    self.simulated_quote -= notional + trade.fee;
                }
                Side::Sell => {
                    self.simulated_base -= trade.amount;
                    self.simulated_quote += notional - trade.fee;
                }
            }
        }

        if !self.position.is_flat() {
            info!(
                "Position: {:.6} @ {:.2}, unrealized P&L: {:.2}",
                self.position.amount, self.position.entry_price, self.position.unrealized_pnl
            );
        } else {
            info!("Position flat, realized P&L to date: {:.2}", self.position.realized_pnl);
        }
        self.send_ui_event(UiEvent::TradeExecuted(trade.clone()));

        let total = self.performance.metrics().total_trades;
        if self.config.summary_every > 0 && total % self.config.summary_every == 0 {
            info!("\n{}", self.performance.summary());
        }

        Ok(TickOutcome::Executed(trade))
    }

    async fn collect_market_data(&self) -> Result<MarketSnapshot, EngineError> {
        let symbol = &self.config.symbol;
        let timeout = self.config.request_timeout();

        let ticker = with_timeout(timeout, "get_ticker", self.exchange.get_ticker(symbol))
            .await
            .map_err(EngineError::Collection)?;
        let mut snapshot = MarketSnapshot::from_ticker(ticker);

        if self.config.enable_multi_timeframe {
            let mut series: Vec<Vec<Candle>> = Vec::with_capacity(CANDLE_SERIES.len());
            for (interval, limit) in CANDLE_SERIES {
                let candles = with_timeout(
                    timeout,
                    "get_candles",
                    self.exchange.get_candles(symbol, interval, limit),
                )
                .await
                .map_err(EngineError::Collection)?;
                series.push(candles);
            }
            let mut series = series.into_iter();
            snapshot.candles_1m = series.next().unwrap_or_default();
            snapshot.candles_5m = series.next().unwrap_or_default();
            snapshot.candles_15m = series.next().unwrap_or_default();
        }

        if self.config.enable_order_book {
            let book = with_timeout(
                timeout,
                "get_order_book",
                self.exchange.get_order_book(symbol, ORDER_BOOK_LEVELS),
            )
            .await
            .map_err(EngineError::Collection)?;
            snapshot.order_book = Some(book.summarize(ORDER_BOOK_LEVELS));
        }

        if snapshot.price() <= 0.0 {
            return Err(EngineError::Collection(anyhow!(
                "ticker for {} has no usable price",
                symbol
            )));
        }
        Ok(snapshot)
    }

    async fn collect_account(&self) -> Result<AccountState, EngineError> {
        let assets = with_timeout(
            self.config.request_timeout(),
            "get_account_assets",
            self.exchange.get_account_assets(),
        )
        .await
        .map_err(EngineError::Collection)?;

        let account = AccountState::new(
            &self.config.base_asset,
            &self.config.quote_asset,
            assets,
            self.config.max_position,
        );
        if self.config.dry_run {
            return Ok(account.with_simulated_fills(self.simulated_base, self.simulated_quote));
        }
        Ok(account)
    }

    /// Places (or simulates) the order and builds the resulting trade.
    /// `Ok(None)` means the amount normalized to nothing and no order went out.
    async fn execute(
        &self,
        side: Side,
        decision: &Decision,
        snapshot: &MarketSnapshot,
    ) -> Result<Option<Trade>, EngineError> {
        let quantity = order_quantity(decision.amount, self.config.step_size);
        if quantity.is_zero() {
            warn!(
                "Quantity {} is zero after normalization to step {}. Not trading.",
                decision.amount, self.config.step_size
            );
            return Ok(None);
        }
        let market_price = snapshot.price();
        let requested = quantity.to_f64().unwrap_or(0.0);

        let (id, price, amount, fee, status) = if self.config.dry_run {
            info!(
                "[DRY RUN] {} {} {} @ {:.2} (no order sent)",
                side, quantity, self.config.symbol, market_price
            );
            let fee = requested * market_price * self.config.fee_rate;
            (
                uuid::Uuid::new_v4().to_string(),
                market_price,
                requested,
                fee,
                TradeStatus::Simulated,
            )
        } else {
            info!("Submitting order: {} {} {}", side, quantity, self.config.symbol);
            let order = with_timeout(
                self.config.request_timeout(),
                "create_order",
                self.exchange
                    .create_order(&self.config.symbol, side, OrderType::Market, quantity),
            )
            .await
            .map_err(EngineError::Execution)?;

            let filled = order
                .executed_qty
                .and_then(|q| q.to_f64())
                .unwrap_or(requested);
            if filled <= 0.0 {
                return Err(EngineError::Execution(anyhow!(
                    "order {} was not filled (status {})",
                    order.id,
                    order.status
                )));
            }
            let price = order
                .avg_price
                .and_then(|p| p.to_f64())
                .unwrap_or(market_price);
            let fee = order
                .fee
                .and_then(|f| f.to_f64())
                .unwrap_or(filled * price * self.config.fee_rate);
            info!("Order confirmed: {} ({}) {:.6} @ {:.2}", order.id, order.status, filled, price);
            (order.id, price, filled, fee, TradeStatus::Filled)
        };

        let effect = self.position.preview(side, price, amount);
        let closed_cost = self.position.entry_price * effect.closed_amount;
        let profit_rate = if closed_cost > 0.0 {
            effect.realized_pnl / closed_cost
        } else {
            0.0
        };

        Ok(Some(Trade {
            id,
            timestamp: Utc::now(),
            symbol: self.config.symbol.clone(),
            side,
            price,
            amount,
            fee,
            profit: effect.realized_pnl,
            profit_rate,
            decision: decision.clone(),
            status,
        }))
    }

    /// Stop-loss / take-profit levels are advisory here: the position is
    /// only ever changed by executed trades.
    fn watch_exit_levels(&self, price: f64) {
        if self.position.is_flat() {
            return;
        }
        let marked = self.position.marked(price);
        if self.risk.should_stop_loss(&marked) {
            warn!(
                "Stop-loss level crossed: entry {:.2}, mark {:.2}, unrealized {:.2}",
                marked.entry_price, marked.current_price, marked.unrealized_pnl
            );
        } else if self.risk.should_take_profit(&marked) {
            info!(
                "Take-profit level crossed: entry {:.2}, mark {:.2}, unrealized {:.2}",
                marked.entry_price, marked.current_price, marked.unrealized_pnl
            );
        }
    }

    fn sync_balance(&self, account: &AccountState, price: f64) {
        if self.config.sync_balance {
            self.performance.update_balance(account.total_value(price));
        }
    }

    fn log_startup_banner(&self) {
        let risk = self.risk.config();
        let metrics = self.performance.metrics();
        info!("========================================");
        info!("  AI TRADER - advisor: {}", self.advisor.name());
        info!("========================================");
        info!("Symbol:            {}", self.config.symbol);
        info!("Decision interval: {}s", self.config.decision_interval_secs);
        info!("Max position:      {:.6} {}", self.config.max_position, self.config.base_asset);
        info!(
            "Mode:              {}",
            if self.config.dry_run { "DRY RUN" } else { "LIVE TRADING" }
        );
        info!(
            "Risk: max position {:.0}%, max drawdown {:.0}%, min confidence {}, {} trades/h",
            risk.max_position_ratio * 100.0,
            risk.max_drawdown * 100.0,
            risk.min_confidence,
            risk.max_trades_per_hour
        );
        info!(
            "Stop loss {:.1}% | take profit {:.1}% | daily loss limit {:.0}%",
            risk.stop_loss_percent * 100.0,
            risk.take_profit_percent * 100.0,
            risk.daily_loss_limit * 100.0
        );
        info!("Initial balance:   {:.2} {}", metrics.initial_balance, self.config.quote_asset);
        info!(
            "Start time:        {}",
            metrics.start_time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
    }
}

/// Time left until the next local midnight in `now`'s timezone.
pub fn duration_until_next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| midnight.and_local_timezone(now.timezone()).earliest());

    match next {
        Some(midnight) => (midnight - now.clone())
            .to_std()
            .unwrap_or(Duration::from_secs(1)),
        None => Duration::from_secs(24 * 60 * 60),
    }
}

async fn daily_reset_loop(risk: Arc<RiskManager>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let wait = duration_until_next_midnight(&Local::now());
        debug!("Next daily risk reset in {:?}", wait);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                info!("Running daily risk stats reset");
                risk.reset_daily_stats();
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Owner side of a started engine.
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    tick_task: JoinHandle<TradingEngine>,
    daily_task: JoinHandle<()>,
    reader: StatusReader,
}

impl EngineHandle {
    pub fn status(&self) -> EngineStatus {
        self.reader.status()
    }

    pub fn status_reader(&self) -> StatusReader {
        self.reader.clone()
    }

    /// Signals both tasks, lets an in-flight tick finish and returns the
    /// stopped engine.
    pub async fn stop(self) -> anyhow::Result<TradingEngine> {
        info!("Stopping trading engine...");
        self.shutdown_tx.send_replace(true);

        let engine = self.tick_task.await?;
        self.daily_task.await?;
        self.reader.running.store(false, Ordering::SeqCst);

        info!("\n{}", engine.performance.summary());
        let recent = engine.performance.recent_trades(20);
        if recent.is_empty() {
            info!("No trades recorded");
        }
        for t in recent {
            info!(
                "{} {} {:.6} @ {:.2} profit {:.2} ({:.2}%) [{:?}] {}",
                t.timestamp.with_timezone(&Local).format("%m-%d %H:%M:%S"),
                t.side,
                t.amount,
                t.price,
                t.profit,
                t.profit_rate * 100.0,
                t.status,
                t.decision.reason
            );
        }
        Ok(engine)
    }
}
