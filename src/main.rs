//! Trade Session - Main Entry Point
//!
//! Connects to the venue, streams ticks and balance updates, and
//! optionally runs the loss-recovery trade loop.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use trade_session::common::channels::create_event_channel_with_size;
use trade_session::common::types::SessionEvent;
use trade_session::config::load_config;
use trade_session::{
    ConnectionStatus, Session, SessionError, SessionListener, TradeMetrics, TradeRunner,
};

/// CLI arguments for the application
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Symbol to stream and trade; overrides the config file
    #[arg(long)]
    symbol: Option<String>,

    /// Number of contracts to trade; 0 only streams market data
    #[arg(long, default_value_t = 0)]
    runs: usize,
}

/// Logs what the UI layer would render
struct LogListener;

impl SessionListener for LogListener {
    fn on_statistics_changed(&self, metrics: &TradeMetrics) {
        info!(
            runs = metrics.runs,
            win_rate = %metrics.win_rate,
            profit = %metrics.total_profit,
            drawdown = %metrics.max_drawdown,
            "Statistics updated"
        );
    }

    fn on_connection_status(&self, status: &ConnectionStatus) {
        info!(?status, "Connection status");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let mut config = load_config(Some(&args.config))?;
    if let Some(symbol) = &args.symbol {
        config.trade.symbol = symbol.clone();
    }

    // Initialize logging
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.settings.log_level.clone());
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting trade session");
    info!("Configuration file: {}", args.config);

    let session = Arc::new(Session::from_config(&config, Arc::new(LogListener))?);
    let (event_tx, mut event_rx) =
        create_event_channel_with_size(config.settings.event_channel_size);
    session.start(event_tx).await?;

    if let Some(auth) = session.authorization() {
        info!(
            loginid = %auth.loginid,
            balance = %auth.balance,
            currency = %auth.currency,
            "Logged in"
        );
        session.subscribe_balance().await?;
    }
    session.subscribe_ticks(&config.trade.symbol).await?;

    let events = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SessionEvent::Tick(tick) => {
                    info!(symbol = %tick.symbol, quote = %tick.quote, epoch = tick.epoch, "Tick")
                }
                SessionEvent::Balance(balance) => {
                    info!(balance = %balance.balance, currency = %balance.currency, "Balance")
                }
                SessionEvent::OpenContract(contract) => info!(
                    contract_id = contract.contract_id,
                    profit = %contract.profit,
                    finished = contract.is_finished(),
                    "Contract update"
                ),
                _ => {}
            }
        }
    });

    if args.runs > 0 {
        let mut runner =
            TradeRunner::from_config(session.clone(), &config, Arc::new(LogListener))?;
        tokio::select! {
            result = runner.run(args.runs) => match result {
                Ok(summary) => info!(
                    completed = summary.completed,
                    profit = %summary.metrics.total_profit,
                    win_rate = %summary.metrics.win_rate,
                    "Trade loop finished"
                ),
                Err(SessionError::StakeLimitExceeded { next_stake, max_stake }) => warn!(
                    %next_stake,
                    %max_stake,
                    "Trade loop stopped at the stake limit"
                ),
                Err(e) => error!(error = %e, "Trade loop failed"),
            },
            _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        }
    } else {
        // Keep the application running
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal, cleaning up...");
    }

    session.stop().await;
    events.abort();

    Ok(())
}
