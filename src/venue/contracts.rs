//! Book of purchased contracts and their latest pushed state

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::common::types::{ContractId, OpenContract};

/// Released contract ids remembered to drop pushes still in flight
const RELEASED_CAPACITY: usize = 256;

/// Result of applying a push update to the book
#[derive(Debug, Clone, PartialEq)]
pub enum ContractUpdate {
    /// First update for a contract
    Opened,
    /// Still open, state refreshed
    Updated,
    /// Outcome determined; the contract moved to the settled set
    Finished(OpenContract),
    /// Update for a contract that already finished or was released
    Ignored,
}

#[derive(Debug, Default)]
struct BookState {
    /// Contracts still running
    active: HashMap<ContractId, OpenContract>,
    /// Contracts whose outcome is known, until released
    settled: HashMap<ContractId, OpenContract>,
    /// Most recently released ids, oldest first
    released: VecDeque<ContractId>,
    released_set: HashSet<ContractId>,
}

impl BookState {
    fn mark_released(&mut self, contract_id: ContractId) {
        if !self.released_set.insert(contract_id) {
            return;
        }
        self.released.push_back(contract_id);
        if self.released.len() > RELEASED_CAPACITY {
            if let Some(oldest) = self.released.pop_front() {
                self.released_set.remove(&oldest);
            }
        }
    }
}

/// Purchased contracts keyed by id, mutated in place by push updates
#[derive(Debug, Default)]
pub struct OpenContractBook {
    state: Mutex<BookState>,
}

impl OpenContractBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BookState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a contract right after it was bought
    pub fn track(&self, contract: OpenContract) {
        let mut state = self.state();
        if !state.settled.contains_key(&contract.contract_id) {
            state.active.entry(contract.contract_id).or_insert(contract);
        }
    }

    /// Merge a push update
    pub fn apply(&self, update: &OpenContract) -> ContractUpdate {
        let mut state = self.state();
        if state.settled.contains_key(&update.contract_id)
            || state.released_set.contains(&update.contract_id)
        {
            return ContractUpdate::Ignored;
        }

        let opened = !state.active.contains_key(&update.contract_id);
        let entry = state
            .active
            .entry(update.contract_id)
            .or_insert_with(|| update.clone());
        entry.apply(update);

        if entry.is_finished() {
            let finished = entry.clone();
            state.active.remove(&update.contract_id);
            state.settled.insert(update.contract_id, finished.clone());
            ContractUpdate::Finished(finished)
        } else if opened {
            ContractUpdate::Opened
        } else {
            ContractUpdate::Updated
        }
    }

    pub fn get(&self, contract_id: ContractId) -> Option<OpenContract> {
        let state = self.state();
        state
            .settled
            .get(&contract_id)
            .or_else(|| state.active.get(&contract_id))
            .cloned()
    }

    pub fn settled(&self, contract_id: ContractId) -> Option<OpenContract> {
        self.state().settled.get(&contract_id).cloned()
    }

    /// Forget a contract entirely; later pushes for it are ignored
    pub fn release(&self, contract_id: ContractId) {
        let mut state = self.state();
        state.active.remove(&contract_id);
        state.settled.remove(&contract_id);
        state.mark_released(contract_id);
    }

    pub fn active_ids(&self) -> Vec<ContractId> {
        self.state().active.keys().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn update(contract_id: ContractId, is_sold: bool, profit: Decimal) -> OpenContract {
        OpenContract {
            contract_id,
            is_settleable: false,
            is_sold,
            profit,
            buy_price: dec!(1),
            underlying: Some("R_100".into()),
            status: None,
        }
    }

    #[test]
    fn test_lifecycle_through_book() {
        let book = OpenContractBook::new();
        assert_eq!(book.apply(&update(1, false, dec!(0.1))), ContractUpdate::Opened);
        assert_eq!(book.apply(&update(1, false, dec!(-0.3))), ContractUpdate::Updated);
        assert_eq!(book.active_count(), 1);

        match book.apply(&update(1, true, dec!(-1))) {
            ContractUpdate::Finished(c) => assert_eq!(c.profit, dec!(-1)),
            other => panic!("Expected Finished, got {:?}", other),
        }
        assert_eq!(book.active_count(), 0);
        assert_eq!(book.settled(1).map(|c| c.profit), Some(dec!(-1)));
    }

    #[test]
    fn test_late_update_after_finish_is_ignored() {
        let book = OpenContractBook::new();
        book.apply(&update(2, true, dec!(0.95)));
        assert_eq!(book.apply(&update(2, false, dec!(0))), ContractUpdate::Ignored);
        assert_eq!(book.get(2).map(|c| c.profit), Some(dec!(0.95)));
    }

    #[test]
    fn test_release_forgets_everything() {
        let book = OpenContractBook::new();
        book.track(update(3, false, Decimal::ZERO));
        book.apply(&update(3, true, dec!(0.5)));
        book.release(3);
        assert!(book.get(3).is_none());
    }

    #[test]
    fn test_push_after_release_is_ignored() {
        let book = OpenContractBook::new();
        book.track(update(4, false, Decimal::ZERO));
        book.release(4);

        assert_eq!(book.apply(&update(4, true, dec!(0.95))), ContractUpdate::Ignored);
        assert!(book.get(4).is_none());
        assert!(book.settled(4).is_none());
        assert_eq!(book.active_count(), 0);
    }

    #[test]
    fn test_released_ids_are_bounded() {
        let book = OpenContractBook::new();
        for contract_id in 0..(RELEASED_CAPACITY as ContractId + 1) {
            book.release(contract_id);
        }

        // The oldest id fell out of the window and is tracked again
        assert_eq!(book.apply(&update(0, false, dec!(0.1))), ContractUpdate::Opened);
        assert_eq!(
            book.apply(&update(RELEASED_CAPACITY as ContractId, false, dec!(0.1))),
            ContractUpdate::Ignored
        );
        assert_eq!(book.state().released.len(), RELEASED_CAPACITY);
    }
}
