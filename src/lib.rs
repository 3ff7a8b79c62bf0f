//! Trade Session Library
//!
//! A client-side session engine for a binary-options trading venue that
//! speaks JSON over a single WebSocket: request/response correlation,
//! server-push subscriptions, contract lifecycle tracking, loss-recovery
//! staking and rolling trade statistics.

pub mod common;
pub mod config;
pub mod strategy;
pub mod venue;

// Re-export commonly used types
pub use common::errors::{Result, SessionError};
pub use common::traits::{NoopListener, SessionListener, TradingGateway};
pub use common::types::{
    Balance, ConnectionState, ConnectionStatus, ContractId, OpenContract, SessionEvent, Tick,
    TradeOutcome,
};
pub use config::types::AppConfig;
pub use venue::Session;

// Strategy types
pub use strategy::{
    LifecycleCoordinator, LifecycleEvent, Resolution, RunSummary, StakeRecoveryController,
    StatisticsAggregator, StatsPeriod, TradeMetrics, TradeRunner,
};
