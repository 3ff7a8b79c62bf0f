//! Rolling trade statistics

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;

use crate::common::types::TradeOutcome;

/// Which outcomes a metrics query covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsPeriod {
    /// Everything still held in the window
    All,
    /// The most recent n outcomes
    Last(usize),
    /// Outcomes at or after a point in time
    Since(DateTime<Utc>),
}

/// Aggregate figures over a set of outcomes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeMetrics {
    pub runs: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_stake: Decimal,
    pub total_profit: Decimal,
    /// wins / runs, 0 when empty
    pub win_rate: Decimal,
    /// gross profit / gross loss, 0 when there are no losses
    pub profit_factor: Decimal,
    /// Largest peak-to-trough fall of cumulative profit
    pub max_drawdown: Decimal,
    /// Every outcome ever recorded, including those evicted from the window
    pub lifetime_runs: u64,
}

impl TradeMetrics {
    fn empty(lifetime_runs: u64) -> Self {
        Self {
            runs: 0,
            wins: 0,
            losses: 0,
            total_stake: Decimal::ZERO,
            total_profit: Decimal::ZERO,
            win_rate: Decimal::ZERO,
            profit_factor: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            lifetime_runs,
        }
    }
}

/// Fixed-capacity window of trade outcomes
#[derive(Debug, Clone)]
pub struct StatisticsAggregator {
    capacity: usize,
    /// Oldest outcome first; evicted once full
    outcomes: VecDeque<TradeOutcome>,
    /// Every outcome ever recorded, including evicted ones
    lifetime_runs: u64,
}

impl StatisticsAggregator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            outcomes: VecDeque::with_capacity(capacity.min(4096)),
            lifetime_runs: 0,
        }
    }

    /// Append an outcome, evicting the oldest when full
    pub fn record(&mut self, outcome: TradeOutcome) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);
        self.lifetime_runs += 1;
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lifetime_runs(&self) -> u64 {
        self.lifetime_runs
    }

    pub fn last(&self) -> Option<&TradeOutcome> {
        self.outcomes.back()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &TradeOutcome> {
        self.outcomes.iter()
    }

    pub fn clear(&mut self) {
        self.outcomes.clear();
    }

    pub fn metrics(&self, period: StatsPeriod) -> TradeMetrics {
        let mut selected: Vec<&TradeOutcome> = match period {
            StatsPeriod::All => self.outcomes.iter().collect(),
            StatsPeriod::Last(n) => {
                let skip = self.outcomes.len().saturating_sub(n);
                self.outcomes.iter().skip(skip).collect()
            }
            StatsPeriod::Since(from) => self
                .outcomes
                .iter()
                .filter(|o| o.timestamp >= from)
                .collect(),
        };
        if selected.is_empty() {
            return TradeMetrics::empty(self.lifetime_runs);
        }
        // Stable, so equal timestamps keep insertion order
        selected.sort_by_key(|o| o.timestamp);

        let runs = selected.len();
        let wins = selected.iter().filter(|o| o.is_win).count();
        let mut total_stake = Decimal::ZERO;
        let mut total_profit = Decimal::ZERO;
        let mut gross_profit = Decimal::ZERO;
        let mut gross_loss = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_drawdown = Decimal::ZERO;

        for outcome in &selected {
            total_stake += outcome.stake;
            total_profit += outcome.profit;
            if outcome.profit > Decimal::ZERO {
                gross_profit += outcome.profit;
            } else {
                gross_loss += outcome.profit.abs();
            }
            peak = peak.max(total_profit);
            max_drawdown = max_drawdown.max(peak - total_profit);
        }

        let profit_factor = if gross_loss.is_zero() {
            Decimal::ZERO
        } else {
            gross_profit / gross_loss
        };

        TradeMetrics {
            runs,
            wins,
            losses: runs - wins,
            total_stake,
            total_profit,
            win_rate: Decimal::from(wins) / Decimal::from(runs),
            profit_factor,
            max_drawdown,
            lifetime_runs: self.lifetime_runs,
        }
    }
}

impl Default for StatisticsAggregator {
    fn default() -> Self {
        Self::new(1000)
    }
}
