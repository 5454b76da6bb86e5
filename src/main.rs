// src/main.rs
use ai_trader::advisor::llm::LlmAdvisor;
use ai_trader::config::{AppConfig, LogConfig};
use ai_trader::connectors::binance::BinanceClient;
use ai_trader::core::engine::TradingEngine;
use ai_trader::tui;
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// The dashboard owns the terminal, so logs go to a daily file while it runs.
fn init_logging(log: &LogConfig, to_file: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level)?,
    };

    if to_file {
        let appender = tracing_appender::rolling::daily(&log.directory, "ai_trader.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // 1. Load Configuration
    let config = AppConfig::new()?;
    let _log_guard = init_logging(&config.log, config.ui.enabled)?;

    info!(
        "Loaded config: {} every {}s ({})",
        config.engine.symbol,
        config.engine.decision_interval_secs,
        if config.engine.dry_run { "dry run" } else { "LIVE" }
    );

    // 2. Initialize Components
    let exchange = Arc::new(BinanceClient::new(&config.exchange));
    let advisor = Box::new(LlmAdvisor::new(&config.advisor));
    let symbol = config.engine.symbol.clone();
    let ui_enabled = config.ui.enabled;

    let mut engine = match TradingEngine::new(config, exchange, advisor).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    // 3. Run Engine (and the dashboard, if enabled)
    let ui_task = if ui_enabled {
        let (ui_tx, ui_rx) = mpsc::channel(100);
        engine = engine.with_ui(ui_tx);
        Some(tokio::spawn(tui::run(ui_rx, symbol)))
    } else {
        None
    };

    let handle = engine.start();

    match ui_task {
        Some(mut task) => {
            tokio::select! {
                res = &mut task => match res {
                    Ok(Err(e)) => error!("Dashboard failed: {}", e),
                    Err(e) => error!("Dashboard task panicked: {}", e),
                    Ok(Ok(())) => info!("Dashboard closed"),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received");
                    task.abort();
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Ctrl-C received");
        }
    }

    // 4. Graceful shutdown
    handle.stop().await?;
    info!("Shutdown complete");
    Ok(())
}
