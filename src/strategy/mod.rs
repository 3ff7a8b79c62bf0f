//! Strategy execution layer
//!
//! Everything that decides what to trade next and keeps score, driven
//! through the [`TradingGateway`](crate::common::traits::TradingGateway)
//! seam so it can run against the live session or a scripted fake.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TradeRunner                                                │
//! │    proposal ──▶ buy ──▶ watch ──▶ await closure             │
//! │                                        │                    │
//! │           ┌────────────────────────────┤                    │
//! │           ▼                            ▼                    │
//! │  StatisticsAggregator        StakeRecoveryController        │
//! │    (record outcome)            (next stake or STOP)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`LifecycleCoordinator`]: single-resolution wait for contract closure
//! - [`StakeRecoveryController`]: stake progression after losses
//! - [`StatisticsAggregator`]: rolling window of trade outcomes
//! - [`TradeRunner`]: the "trade again" loop

pub mod lifecycle;
pub mod recovery;
pub mod runner;
pub mod statistics;

pub use lifecycle::{LifecycleCoordinator, LifecycleEvent, LifecycleState, Resolution};
pub use recovery::StakeRecoveryController;
pub use runner::{RunSummary, TradeRunner};
pub use statistics::{StatisticsAggregator, StatsPeriod, TradeMetrics};
