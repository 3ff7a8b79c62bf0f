//! The "trade again" loop: quote, buy, wait for closure, record, repeat

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::lifecycle::Resolution;
use super::recovery::StakeRecoveryController;
use super::statistics::{StatisticsAggregator, StatsPeriod, TradeMetrics};
use crate::common::errors::{Result, SessionError};
use crate::common::traits::{SessionListener, TradingGateway};
use crate::common::types::{ContractId, TradeOutcome};
use crate::config::types::{AppConfig, TradeConfig};
use crate::venue::messages::ProposalRequest;

/// Consecutive transient failures tolerated before the loop gives up
const MAX_TRANSIENT_FAILURES: u32 = 3;

/// What a finished run looked like
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub next_stake: Decimal,
    pub metrics: TradeMetrics,
}

/// Drives repeated trades through a gateway, sizing each stake from the
/// previous outcomes
pub struct TradeRunner<G: TradingGateway> {
    gateway: Arc<G>,
    /// Symbol and contract parameters for every proposal
    trade: TradeConfig,
    /// Safety timeout for each closure wait
    closure_timeout: Duration,
    /// Pause before retrying after a transient failure
    retry_delay: Duration,
    recovery: StakeRecoveryController,
    statistics: StatisticsAggregator,
    /// Receives a metrics snapshot after every settled trade
    listener: Arc<dyn SessionListener>,
}

impl<G: TradingGateway> TradeRunner<G> {
    pub fn new(
        gateway: Arc<G>,
        trade: TradeConfig,
        recovery: StakeRecoveryController,
        statistics: StatisticsAggregator,
        closure_timeout: Duration,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        Self {
            gateway,
            trade,
            closure_timeout,
            retry_delay: Duration::from_secs(1),
            recovery,
            statistics,
            listener,
        }
    }

    pub fn from_config(
        gateway: Arc<G>,
        config: &AppConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self> {
        Ok(Self::new(
            gateway,
            config.trade.clone(),
            StakeRecoveryController::from_config(&config.recovery)?,
            StatisticsAggregator::new(config.statistics.capacity),
            config.settings.closure_timeout(),
            listener,
        ))
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn statistics(&self) -> &StatisticsAggregator {
        &self.statistics
    }

    pub fn recovery(&self) -> &StakeRecoveryController {
        &self.recovery
    }

    pub fn metrics(&self) -> TradeMetrics {
        self.statistics.metrics(StatsPeriod::All)
    }

    /// Trade up to `max_runs` contracts
    ///
    /// Stops early with an error when the stake limit is reached, on a
    /// terminal session error, or after repeated transient failures. Every
    /// outcome recorded before the error stays in [`statistics`](Self::statistics).
    #[instrument(skip(self), fields(symbol = %self.trade.symbol))]
    pub async fn run(&mut self, max_runs: usize) -> Result<RunSummary> {
        let mut completed = 0;
        let mut failures = 0;

        while completed < max_runs {
            match self.run_once().await {
                Ok(outcome) => {
                    failures = 0;
                    completed += 1;
                    let next_stake = self.recovery.on_outcome(outcome.is_win)?;
                    info!(
                        run = completed,
                        profit = %outcome.profit,
                        is_win = outcome.is_win,
                        %next_stake,
                        "Run complete"
                    );
                }
                Err(e) if e.is_transient() && self.gateway.is_stopped() => {
                    warn!(error = %e, "Session stopped, ending the trade loop");
                    return Err(e);
                }
                Err(e) if e.is_transient() && failures + 1 < MAX_TRANSIENT_FAILURES => {
                    failures += 1;
                    warn!(error = %e, failures, "Run failed, retrying with the same stake");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(RunSummary {
            completed,
            next_stake: self.recovery.current_stake(),
            metrics: self.metrics(),
        })
    }

    /// One full contract cycle at the current stake
    pub async fn run_once(&mut self) -> Result<TradeOutcome> {
        let stake = self.recovery.current_stake();
        let proposal = self
            .gateway
            .get_proposal(&ProposalRequest::stake(stake, &self.trade))
            .await?;
        let receipt = self
            .gateway
            .buy_contract(&proposal.id, proposal.ask_price)
            .await?;
        let contract_id = receipt.contract_id;
        info!(contract_id, %stake, buy_price = %receipt.buy_price, "Contract bought");

        let profit = self.settle(contract_id, receipt.buy_price).await;
        self.gateway.release_contract(contract_id).await;
        let profit = profit?;

        let outcome = TradeOutcome::new(self.trade.symbol.clone(), receipt.buy_price, profit);
        self.statistics.record(outcome.clone());
        self.listener
            .on_statistics_changed(&self.statistics.metrics(StatsPeriod::All));
        Ok(outcome)
    }

    /// Wait for the contract to finish and return its profit
    async fn settle(&self, contract_id: ContractId, buy_price: Decimal) -> Result<Decimal> {
        if let Err(e) = self.gateway.watch_contract(contract_id).await {
            // The safety timeout still bounds the wait below
            warn!(contract_id, error = %e, "Failed to watch contract");
        }

        let resolution = self
            .gateway
            .await_closure(contract_id, self.closure_timeout)
            .await;
        let contract = self.gateway.contract_outcome(contract_id).await?;
        if contract.is_finished() {
            return Ok(contract.profit);
        }

        match resolution {
            Resolution::Closed => Err(SessionError::InvalidResponse(format!(
                "contract {} reported closed but is still open",
                contract_id
            ))),
            Resolution::TimedOut | Resolution::ForceReleased => {
                warn!(contract_id, ?resolution, "Selling unfinished contract at market");
                let sold = self
                    .gateway
                    .sell_contract(contract_id, Decimal::ZERO)
                    .await?;
                Ok(sold.sold_for - buy_price)
            }
        }
    }
}
