//! Loss-recovery stake progression

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::common::errors::{Result, SessionError};
use crate::config::types::RecoveryConfig;

/// Computes the next stake from the win/loss streak
///
/// The multiplier is recomputed from the consecutive-loss count each time
/// instead of being accumulated, so rounding never drifts. The first loss
/// whose stake would exceed the maximum trades at the maximum; a further
/// loss at the cap fails with [`SessionError::StakeLimitExceeded`] and the
/// controller stays stopped until a win or [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct StakeRecoveryController {
    base_stake: Decimal,
    multiplier: Decimal,
    max_stake: Decimal,
    consecutive_losses: u32,
    /// Stake for the next trade
    current_stake: Decimal,
    /// The last stake was clamped to `max_stake`
    at_cap: bool,
    /// A loss at the cap; no further stake until a win or reset
    stopped: bool,
}

impl StakeRecoveryController {
    pub fn new(base_stake: Decimal, multiplier: Decimal, max_stake: Decimal) -> Result<Self> {
        if base_stake <= Decimal::ZERO {
            return Err(SessionError::Configuration(format!(
                "base stake must be positive, got {}",
                base_stake
            )));
        }
        if multiplier < Decimal::ONE {
            return Err(SessionError::Configuration(format!(
                "multiplier must be at least 1, got {}",
                multiplier
            )));
        }
        if max_stake < base_stake {
            return Err(SessionError::Configuration(format!(
                "max stake {} is below base stake {}",
                max_stake, base_stake
            )));
        }

        Ok(Self {
            base_stake,
            multiplier,
            max_stake,
            consecutive_losses: 0,
            current_stake: base_stake,
            at_cap: base_stake >= max_stake,
            stopped: false,
        })
    }

    pub fn from_config(config: &RecoveryConfig) -> Result<Self> {
        Self::new(config.base_stake, config.multiplier, config.max_stake)
    }

    pub fn current_stake(&self) -> Decimal {
        self.current_stake
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    pub fn max_stake(&self) -> Decimal {
        self.max_stake
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// multiplier^losses, or None on overflow
    pub fn current_multiplier(&self) -> Option<Decimal> {
        multiplier_for(self.multiplier, self.consecutive_losses)
    }

    /// Feed a finished trade and get the stake for the next one
    pub fn on_outcome(&mut self, is_win: bool) -> Result<Decimal> {
        if is_win {
            self.reset();
            return Ok(self.current_stake);
        }

        self.consecutive_losses = self.consecutive_losses.saturating_add(1);
        let raw = self
            .current_multiplier()
            .and_then(|m| self.base_stake.checked_mul(m));

        if self.stopped || self.at_cap {
            self.stopped = true;
            let next_stake = raw.unwrap_or(Decimal::MAX);
            warn!(
                losses = self.consecutive_losses,
                %next_stake,
                max_stake = %self.max_stake,
                "Stake limit exceeded"
            );
            return Err(SessionError::StakeLimitExceeded {
                next_stake,
                max_stake: self.max_stake,
            });
        }

        let stake = match raw {
            Some(stake) if stake < self.max_stake => stake,
            _ => {
                self.at_cap = true;
                self.max_stake
            }
        };
        self.current_stake = stake;
        info!(
            losses = self.consecutive_losses,
            %stake,
            at_cap = self.at_cap,
            "Stake increased after loss"
        );
        Ok(stake)
    }

    /// Back to the base stake
    pub fn reset(&mut self) {
        self.consecutive_losses = 0;
        self.current_stake = self.base_stake;
        self.at_cap = self.base_stake >= self.max_stake;
        self.stopped = false;
    }
}

fn multiplier_for(multiplier: Decimal, losses: u32) -> Option<Decimal> {
    (0..losses).try_fold(Decimal::ONE, |acc, _| acc.checked_mul(multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn controller() -> StakeRecoveryController {
        StakeRecoveryController::new(dec!(1), dec!(2), dec!(50)).unwrap()
    }

    #[test]
    fn test_progression_caps_then_stops() {
        let mut recovery = controller();
        let mut stakes = vec![recovery.current_stake()];
        for _ in 0..6 {
            stakes.push(recovery.on_outcome(false).unwrap());
        }
        assert_eq!(
            stakes,
            vec![dec!(1), dec!(2), dec!(4), dec!(8), dec!(16), dec!(32), dec!(50)]
        );

        match recovery.on_outcome(false) {
            Err(SessionError::StakeLimitExceeded {
                next_stake,
                max_stake,
            }) => {
                assert_eq!(next_stake, dec!(128));
                assert_eq!(max_stake, dec!(50));
            }
            other => panic!("Expected StakeLimitExceeded, got {:?}", other),
        }
        assert!(recovery.is_stopped());
        assert!(recovery.on_outcome(false).is_err());
    }

    #[test]
    fn test_win_resets() {
        let mut recovery = controller();
        recovery.on_outcome(false).unwrap();
        recovery.on_outcome(false).unwrap();
        assert_eq!(recovery.current_stake(), dec!(4));

        assert_eq!(recovery.on_outcome(true).unwrap(), dec!(1));
        assert_eq!(recovery.consecutive_losses(), 0);
        assert_eq!(recovery.current_multiplier(), Some(dec!(1)));
    }

    #[test]
    fn test_win_clears_stop() {
        let mut recovery = controller();
        for _ in 0..6 {
            recovery.on_outcome(false).unwrap();
        }
        assert!(recovery.on_outcome(false).is_err());
        assert_eq!(recovery.on_outcome(true).unwrap(), dec!(1));
        assert!(!recovery.is_stopped());
    }

    #[test]
    fn test_exact_max_counts_as_cap() {
        let mut recovery = StakeRecoveryController::new(dec!(1), dec!(2), dec!(4)).unwrap();
        assert_eq!(recovery.on_outcome(false).unwrap(), dec!(2));
        assert_eq!(recovery.on_outcome(false).unwrap(), dec!(4));
        assert!(recovery.on_outcome(false).is_err());
    }

    #[test]
    fn test_fractional_multiplier_has_no_drift() {
        let mut recovery = StakeRecoveryController::new(dec!(0.35), dec!(2.1), dec!(1000)).unwrap();
        for _ in 0..5 {
            recovery.on_outcome(false).unwrap();
        }
        assert_eq!(recovery.current_multiplier(), Some(dec!(40.84101)));
        assert_eq!(recovery.current_stake(), dec!(14.2943535));
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(StakeRecoveryController::new(dec!(0), dec!(2), dec!(50)).is_err());
        assert!(StakeRecoveryController::new(dec!(1), dec!(0.5), dec!(50)).is_err());
        assert!(StakeRecoveryController::new(dec!(10), dec!(2), dec!(5)).is_err());
    }
}
