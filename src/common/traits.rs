//! Trait definitions at the seams of the session engine

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

use super::errors::Result;
use super::types::{Balance, ConnectionStatus, ContractId, OpenContract};
use crate::strategy::lifecycle::Resolution;
use crate::strategy::statistics::TradeMetrics;
use crate::venue::messages::{BuyReceipt, Proposal, ProposalRequest, SellReceipt};

/// Sink for state changes the UI/state layer renders
///
/// Every method has an empty default so consumers only implement what
/// they display.
#[cfg_attr(test, mockall::automock)]
pub trait SessionListener: Send + Sync {
    /// Called on every balance push
    fn on_balance_update(&self, _balance: &Balance) {}

    /// Called after a settled trade has been recorded
    fn on_statistics_changed(&self, _metrics: &TradeMetrics) {}

    /// Called on every connection state transition
    fn on_connection_status(&self, _status: &ConnectionStatus) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// Operations the strategy execution layer calls on the session
///
/// This trait provides the narrow surface the "trade again" loop needs,
/// so the loop can be driven by the live session or by a scripted fake.
#[async_trait]
pub trait TradingGateway: Send + Sync {
    /// Request a price quote
    async fn get_proposal(&self, request: &ProposalRequest) -> Result<Proposal>;

    /// Buy a previously quoted proposal, paying at most `max_price`
    async fn buy_contract(&self, proposal_id: &str, max_price: Decimal) -> Result<BuyReceipt>;

    /// Sell an open contract; a `min_price` of zero sells at market
    async fn sell_contract(&self, contract_id: ContractId, min_price: Decimal)
        -> Result<SellReceipt>;

    /// Subscribe to push updates for a purchased contract
    async fn watch_contract(&self, contract_id: ContractId) -> Result<()>;

    /// Suspend until the contract closes, is force-released, or the
    /// safety timeout elapses
    async fn await_closure(&self, contract_id: ContractId, safety_timeout: Duration) -> Resolution;

    /// Final (or latest known) state of a contract
    async fn contract_outcome(&self, contract_id: ContractId) -> Result<OpenContract>;

    /// Drop every piece of state kept for a contract
    async fn release_contract(&self, contract_id: ContractId);

    /// True when the session will not reconnect on its own, so a
    /// connection error is final
    fn is_stopped(&self) -> bool {
        false
    }
}
