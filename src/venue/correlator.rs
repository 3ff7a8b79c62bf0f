//! Request/response correlation over the shared socket

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::messages::{Request, Response, SubscriptionKind};
use crate::common::errors::{Result, SessionError};

/// Correlation ids are unique for the lifetime of the process
static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

fn next_req_id() -> u64 {
    NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed)
}

/// Settled outcome of a request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response: Response,
    /// Set when the request opened a server-push stream
    pub subscription_id: Option<String>,
}

impl Reply {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            subscription_id: None,
        }
    }

    pub fn with_subscription(response: Response, subscription_id: impl Into<String>) -> Self {
        Self {
            response,
            subscription_id: Some(subscription_id.into()),
        }
    }
}

/// A request waiting for its correlated response
#[derive(Debug)]
pub struct PendingRequest {
    req_id: u64,
    request: Request,
    issued_at: Instant,
    responder: oneshot::Sender<Result<Reply>>,
}

impl PendingRequest {
    pub fn req_id(&self) -> u64 {
        self.req_id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn subscription(&self) -> Option<(SubscriptionKind, String)> {
        self.request.subscription()
    }

    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Deliver the outcome to the waiting caller
    ///
    /// Returns false when the caller has already gone away.
    pub fn settle(self, result: Result<Reply>) -> bool {
        self.responder.send(result).is_ok()
    }
}

/// Matches inbound responses to outstanding requests by correlation id
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

/// Removes the pending entry when the waiting future ends, however it ends
struct PendingGuard<'a> {
    correlator: &'a RequestCorrelator,
    req_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.cancel(self.req_id);
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a pending entry under a fresh correlation id
    pub fn register(&self, request: Request) -> (u64, oneshot::Receiver<Result<Reply>>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending();

        let mut req_id = next_req_id();
        while pending.contains_key(&req_id) {
            req_id = next_req_id();
        }

        pending.insert(
            req_id,
            PendingRequest {
                req_id,
                request,
                issued_at: Instant::now(),
                responder: tx,
            },
        );
        (req_id, rx)
    }

    /// Remove and return the entry for a correlation id (fire-once)
    pub fn take(&self, req_id: u64) -> Option<PendingRequest> {
        self.pending().remove(&req_id)
    }

    /// Drop an entry without settling it
    pub fn cancel(&self, req_id: u64) -> bool {
        self.pending().remove(&req_id).is_some()
    }

    pub fn contains(&self, req_id: u64) -> bool {
        self.pending().contains_key(&req_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Reject every outstanding request; used when the connection drops
    pub fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> SessionError,
    {
        let drained: Vec<PendingRequest> = self.pending().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            debug!(
                req_id = pending.req_id,
                family = pending.request.family(),
                "Rejecting pending request"
            );
            pending.settle(Err(make_error()));
        }
        count
    }

    /// Issue a request and wait for its correlated response
    ///
    /// `send` hands the encoded frame to the transport. If it fails the entry
    /// is removed and the error returned right away. A response arriving after
    /// the timeout finds no entry and is dropped by the dispatcher.
    pub async fn request<F>(&self, request: Request, timeout: Duration, send: F) -> Result<Reply>
    where
        F: FnOnce(String) -> Result<()> + Send,
    {
        let family = request.family();
        let frame_request = request.clone();
        let (req_id, rx) = self.register(request);
        let _guard = PendingGuard {
            correlator: self,
            req_id,
        };

        let frame = frame_request.encode(req_id)?;
        debug!(req_id, family, "Sending request");
        send(frame)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::ConnectionLost),
            Err(_) => {
                warn!(req_id, family, ?timeout, "Request timed out");
                Err(SessionError::RequestTimeout { req_id, timeout })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::messages::Proposal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn proposal(id: &str) -> Response {
        Response::Proposal(Proposal {
            id: id.to_string(),
            ask_price: dec!(1),
            payout: dec!(1.9),
            spot: None,
            longcode: String::new(),
        })
    }

    fn req_id_of(frame: &str) -> u64 {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        value["req_id"].as_u64().unwrap()
    }

    #[test]
    fn test_ids_are_unique() {
        let correlator = RequestCorrelator::new();
        let (a, _ra) = correlator.register(Request::ping());
        let (b, _rb) = correlator.register(Request::ping());
        assert_ne!(a, b);
        assert_eq!(correlator.pending_count(), 2);
    }

    #[test]
    fn test_take_is_fire_once() {
        let correlator = RequestCorrelator::new();
        let (id, _rx) = correlator.register(Request::ping());
        assert!(correlator.take(id).is_some());
        assert!(correlator.take(id).is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let correlator = Arc::new(RequestCorrelator::new());
        let (frames_tx, mut frames_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let first = {
            let correlator = correlator.clone();
            let tx = frames_tx.clone();
            tokio::spawn(async move {
                correlator
                    .request(Request::ping(), Duration::from_secs(2), |f| {
                        tx.send(f).map_err(|e| SessionError::ChannelSend(e.to_string()))
                    })
                    .await
            })
        };
        let id_first = req_id_of(&frames_rx.recv().await.unwrap());

        let second = {
            let correlator = correlator.clone();
            let tx = frames_tx.clone();
            tokio::spawn(async move {
                correlator
                    .request(Request::ping(), Duration::from_secs(2), |f| {
                        tx.send(f).map_err(|e| SessionError::ChannelSend(e.to_string()))
                    })
                    .await
            })
        };
        let id_second = req_id_of(&frames_rx.recv().await.unwrap());

        // Answer the second request first
        assert!(correlator.take(id_second).unwrap().settle(Ok(Reply::new(proposal("second")))));
        assert!(correlator.take(id_first).unwrap().settle(Ok(Reply::new(proposal("first")))));

        assert_eq!(first.await.unwrap().unwrap().response, proposal("first"));
        assert_eq!(second.await.unwrap().unwrap().response, proposal("second"));
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let correlator = RequestCorrelator::new();
        let result = correlator
            .request(Request::ping(), Duration::from_millis(20), |_| Ok(()))
            .await;

        assert!(matches!(result, Err(SessionError::RequestTimeout { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_cleans_up() {
        let correlator = RequestCorrelator::new();
        let result = correlator
            .request(Request::ping(), Duration::from_secs(5), |_| {
                Err(SessionError::NotConnected)
            })
            .await;

        assert!(matches!(result, Err(SessionError::NotConnected)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_with_connection_lost() {
        let correlator = RequestCorrelator::new();
        let (_a, ra) = correlator.register(Request::ping());
        let (_b, rb) = correlator.register(Request::balance());

        assert_eq!(correlator.fail_all(|| SessionError::ConnectionLost), 2);
        assert!(matches!(ra.await.unwrap(), Err(SessionError::ConnectionLost)));
        assert!(matches!(rb.await.unwrap(), Err(SessionError::ConnectionLost)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_settle_after_receiver_dropped() {
        let correlator = RequestCorrelator::new();
        let (id, rx) = correlator.register(Request::ping());
        drop(rx);
        assert!(!correlator.take(id).unwrap().settle(Ok(Reply::new(Response::Pong))));
    }
}
