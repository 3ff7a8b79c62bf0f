//! Registry of live server-push subscriptions

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::messages::{Request, SubscriptionKind};

/// A confirmed server-push stream
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    /// Venue-assigned id, valid for one connection only
    pub id: String,
    pub kind: SubscriptionKind,
    /// Symbol or contract id the stream is about
    pub subject: String,
    /// Request that opened the stream, replayed after a reconnect
    pub request: Request,
}

#[derive(Debug, Default)]
struct RegistryState {
    live: HashMap<String, Subscription>,
    /// Streams dropped by a disconnect, waiting to be re-established
    orphaned: Vec<Subscription>,
}

impl RegistryState {
    fn push_orphan(&mut self, subscription: Subscription) {
        let duplicate = self
            .orphaned
            .iter()
            .any(|o| o.kind == subscription.kind && o.subject == subscription.subject);
        if !duplicate {
            self.orphaned.push(subscription);
        }
    }
}

/// Tracks live subscriptions so they can be forgotten and re-established
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a stream the venue just confirmed
    pub fn register(&self, subscription: Subscription) {
        debug!(
            subscription_id = %subscription.id,
            kind = %subscription.kind,
            subject = %subscription.subject,
            "Registering subscription"
        );
        self.state()
            .live
            .insert(subscription.id.clone(), subscription);
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.state().live.contains_key(subscription_id)
    }

    pub fn get(&self, subscription_id: &str) -> Option<Subscription> {
        self.state().live.get(subscription_id).cloned()
    }

    /// Stop tracking a stream
    ///
    /// Returns `None` for ids that are not live so callers can treat the
    /// forget as a no-op. An orphaned stream carrying the id is discarded
    /// so it is not re-established later.
    pub fn remove(&self, subscription_id: &str) -> Option<Subscription> {
        let mut state = self.state();
        state.orphaned.retain(|s| s.id != subscription_id);
        state.live.remove(subscription_id)
    }

    /// Stop tracking every stream about a subject
    pub fn remove_subject(&self, kind: SubscriptionKind, subject: &str) -> Vec<Subscription> {
        let mut state = self.state();
        state
            .orphaned
            .retain(|s| !(s.kind == kind && s.subject == subject));

        let ids: Vec<String> = state
            .live
            .values()
            .filter(|s| s.kind == kind && s.subject == subject)
            .map(|s| s.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| state.live.remove(id))
            .collect()
    }

    /// Stop tracking every stream of the given kinds
    pub fn remove_kinds(&self, kinds: &[SubscriptionKind]) -> Vec<Subscription> {
        let mut state = self.state();
        state.orphaned.retain(|s| !kinds.contains(&s.kind));

        let ids: Vec<String> = state
            .live
            .values()
            .filter(|s| kinds.contains(&s.kind))
            .map(|s| s.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| state.live.remove(id))
            .collect()
    }

    /// Remove every live stream, e.g. for teardown
    pub fn take_all(&self) -> Vec<Subscription> {
        self.state().live.drain().map(|(_, s)| s).collect()
    }

    /// Invalidate every live stream after a disconnect
    ///
    /// The streams are kept aside so they can be replayed once the next
    /// connection is ready. Returns how many streams were invalidated.
    pub fn invalidate(&self) -> usize {
        let mut state = self.state();
        let dropped: Vec<Subscription> = state.live.drain().map(|(_, s)| s).collect();
        let count = dropped.len();
        for subscription in dropped {
            state.push_orphan(subscription);
        }
        count
    }

    /// Queue a stream for replay on the next connection
    pub fn orphan(&self, subscription: Subscription) {
        self.state().push_orphan(subscription);
    }

    /// Hand out the streams to re-establish on the new connection
    pub fn take_orphaned(&self) -> Vec<Subscription> {
        std::mem::take(&mut self.state().orphaned)
    }

    pub fn find(&self, kind: SubscriptionKind, subject: &str) -> Option<Subscription> {
        self.state()
            .live
            .values()
            .find(|s| s.kind == kind && s.subject == subject)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().live.is_empty()
    }

    pub fn orphaned_count(&self) -> usize {
        self.state().orphaned.len()
    }
}
