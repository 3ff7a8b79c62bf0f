//! Single-resolution wait for a contract to close
//!
//! Every awaited key resolves exactly once, through whichever of three
//! sources fires first: the venue reports the contract closed, the caller
//! force-releases it, or the safety timeout elapses. Later sources are
//! no-ops. An event that arrives before anyone awaits is recorded so the
//! next await returns immediately.

use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// External signals that end a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The venue reported the contract as sold or settleable
    Closed,
    /// The caller gave up on the contract
    ForceReleased,
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    Closed,
    ForceReleased,
    TimedOut,
}

impl From<LifecycleEvent> for Resolution {
    fn from(event: LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Closed => Resolution::Closed,
            LifecycleEvent::ForceReleased => Resolution::ForceReleased,
        }
    }
}

/// Observable state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Awaiting,
    Resolved(Resolution),
}

enum Slot {
    /// Waiters to wake on resolution
    Awaiting(Vec<oneshot::Sender<Resolution>>),
    Resolved(Resolution),
}

/// Closure waits keyed by scope (a contract id in the session)
pub struct LifecycleCoordinator<K> {
    /// One slot per key, from first await or event until forgotten
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K> Default for LifecycleCoordinator<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> LifecycleCoordinator<K>
where
    K: Hash + Eq + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the key resolves or `safety_timeout` elapses
    ///
    /// Never fails: the timeout is itself one of the resolutions.
    pub async fn await_closure(&self, key: K, safety_timeout: Duration) -> Resolution {
        let rx = {
            let mut slots = self.slots();
            let (tx, rx) = oneshot::channel();
            match slots.entry(key.clone()) {
                Entry::Occupied(mut occupied) => match occupied.get_mut() {
                    Slot::Resolved(resolution) => return *resolution,
                    Slot::Awaiting(waiters) => waiters.push(tx),
                },
                Entry::Vacant(vacant) => {
                    vacant.insert(Slot::Awaiting(vec![tx]));
                }
            }
            rx
        };

        debug!(key = ?key, ?safety_timeout, "Awaiting closure");
        match tokio::time::timeout(safety_timeout, rx).await {
            Ok(Ok(resolution)) => resolution,
            // Sender dropped unresolved; only happens if the slot was torn down
            Ok(Err(_)) => Resolution::ForceReleased,
            Err(_) => {
                // Another source may have resolved between the timer firing
                // and taking the lock; that resolution wins.
                let (resolution, fired) = self.resolve(&key, Resolution::TimedOut);
                if fired {
                    warn!(key = ?key, ?safety_timeout, "Closure wait timed out");
                }
                resolution
            }
        }
    }

    /// Deliver an external event
    ///
    /// Returns true when this event resolved the key, false when it was
    /// already resolved.
    pub fn notify(&self, key: &K, event: LifecycleEvent) -> bool {
        let (_, fired) = self.resolve(key, event.into());
        if fired {
            info!(key = ?key, ?event, "Contract lifecycle resolved");
        } else {
            debug!(key = ?key, ?event, "Ignoring event for resolved contract");
        }
        fired
    }

    /// Resolve once; returns the effective resolution and whether this call set it
    fn resolve(&self, key: &K, resolution: Resolution) -> (Resolution, bool) {
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(Slot::Resolved(existing)) => (*existing, false),
            Some(slot) => {
                if let Slot::Awaiting(waiters) =
                    std::mem::replace(slot, Slot::Resolved(resolution))
                {
                    for waiter in waiters {
                        let _ = waiter.send(resolution);
                    }
                }
                (resolution, true)
            }
            None => {
                slots.insert(key.clone(), Slot::Resolved(resolution));
                (resolution, true)
            }
        }
    }

    pub fn state(&self, key: &K) -> LifecycleState {
        match self.slots().get(key) {
            None => LifecycleState::Idle,
            Some(Slot::Awaiting(_)) => LifecycleState::Awaiting,
            Some(Slot::Resolved(resolution)) => LifecycleState::Resolved(*resolution),
        }
    }

    /// Drop all state for a key, releasing any waiter first
    pub fn forget(&self, key: &K) {
        if let Some(Slot::Awaiting(waiters)) = self.slots().remove(key) {
            for waiter in waiters {
                let _ = waiter.send(Resolution::ForceReleased);
            }
        }
    }

    /// Force-release every pending wait, e.g. on shutdown
    pub fn release_all(&self) -> usize {
        let mut slots = self.slots();
        let mut released = 0;
        for slot in slots.values_mut() {
            if matches!(slot, Slot::Awaiting(_)) {
                if let Slot::Awaiting(waiters) =
                    std::mem::replace(slot, Slot::Resolved(Resolution::ForceReleased))
                {
                    for waiter in waiters {
                        let _ = waiter.send(Resolution::ForceReleased);
                    }
                }
                released += 1;
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}
