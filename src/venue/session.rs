//! Session engine
//!
//! [`Session`] owns one venue connection and everything that depends on it:
//! request correlation, the subscription registry, the open-contract book
//! and the closure waits. A supervisor task drives the connection through
//! connect, handshake and reconnect; a reader task decodes every inbound
//! frame once and routes it either to the waiting caller or to the push
//! consumers.

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, instrument, warn};

use super::connection::{ConnectionManager, ReconnectPolicy, WsReader};
use super::contracts::{ContractUpdate, OpenContractBook};
use super::correlator::{PendingRequest, Reply, RequestCorrelator};
use super::messages::{
    Authorization, BuyReceipt, InboundFrame, Proposal, ProposalRequest, Request, Response,
    SellReceipt, SubscriptionKind, TickHistory, TimeoutClass,
};
use super::subscriptions::{Subscription, SubscriptionRegistry};
use crate::common::errors::{Result, SessionError};
use crate::common::traits::{NoopListener, SessionListener, TradingGateway};
use crate::common::types::{
    Balance, ConnectionState, ConnectionStatus, ContractId, OpenContract, SessionEvent,
};
use crate::config::types::{AppConfig, SessionSettings, VenueConfig};
use crate::strategy::lifecycle::{LifecycleCoordinator, LifecycleEvent, Resolution};

/// How one connection cycle ended
enum CycleEnd {
    Shutdown,
    Dropped(String),
    Terminal(SessionError),
}

/// State shared between the session handle and its background tasks
struct SessionInner {
    /// Venue endpoint and credentials
    venue: VenueConfig,
    /// Timeouts, backoff and heartbeat settings
    settings: SessionSettings,
    policy: ReconnectPolicy,
    /// Socket owner and connection state
    connection: ConnectionManager,
    /// In-flight requests keyed by req_id
    correlator: RequestCorrelator,
    /// Live and orphaned streams
    subscriptions: SubscriptionRegistry,
    /// Purchased contracts and their latest pushed state
    contracts: OpenContractBook,
    /// Closure waits per contract
    lifecycle: LifecycleCoordinator<ContractId>,
    /// UI callbacks
    listener: Arc<dyn SessionListener>,
    /// Event sink installed by `start`
    events: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    /// Account details from the last handshake
    authorization: Mutex<Option<Authorization>>,
    /// Subscription ids with a forget in flight on this connection
    forgotten: Mutex<HashSet<String>>,
    /// Raised by `stop`, and by the supervisor when it gives up
    shutdown: watch::Sender<bool>,
}

/// A trading session against the venue
pub struct Session {
    inner: Arc<SessionInner>,
    /// Connection supervisor task while started
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(venue: VenueConfig, settings: SessionSettings) -> Result<Self> {
        Self::with_listener(venue, settings, Arc::new(NoopListener))
    }

    pub fn with_listener(
        venue: VenueConfig,
        settings: SessionSettings,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self> {
        let endpoint = venue.endpoint()?;
        let (shutdown, _) = watch::channel(false);

        let inner = SessionInner {
            policy: ReconnectPolicy::from_settings(&settings),
            connection: ConnectionManager::new(endpoint),
            correlator: RequestCorrelator::new(),
            subscriptions: SubscriptionRegistry::new(),
            contracts: OpenContractBook::new(),
            lifecycle: LifecycleCoordinator::new(),
            listener,
            events: Mutex::new(None),
            authorization: Mutex::new(None),
            forgotten: Mutex::new(HashSet::new()),
            shutdown,
            venue,
            settings,
        };

        Ok(Self {
            inner: Arc::new(inner),
            supervisor: Mutex::new(None),
        })
    }

    pub fn from_config(config: &AppConfig, listener: Arc<dyn SessionListener>) -> Result<Self> {
        Self::with_listener(config.venue.clone(), config.settings.clone(), listener)
    }

    fn supervisor(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect and wait until the session is Ready
    ///
    /// Pushes and connection status updates are delivered on `events` for
    /// the lifetime of the session. Fails when the credential token is
    /// refused or the reconnect attempts run out before the first Ready.
    #[instrument(skip(self, events), fields(endpoint = %self.inner.connection.endpoint()))]
    pub async fn start(&self, events: mpsc::Sender<SessionEvent>) -> Result<()> {
        let ready_rx = {
            let mut supervisor = self.supervisor();
            if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return Err(SessionError::Internal("session already started".to_string()));
            }

            *self.inner.events() = Some(events);
            self.inner.shutdown.send_replace(false);

            let (ready_tx, ready_rx) = oneshot::channel();
            let inner = self.inner.clone();
            *supervisor = Some(tokio::spawn(async move { inner.supervise(ready_tx).await }));
            ready_rx
        };

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Internal(
                "supervisor exited before the session was ready".to_string(),
            )),
        }
    }

    /// Forget every stream, close the socket and stop reconnecting
    pub async fn stop(&self) {
        if self.inner.connection.is_ready() {
            self.forget_all();
        }
        self.inner.shutdown.send_replace(true);

        let handle = self.supervisor().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Supervisor task failed");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.connection.is_ready()
    }

    /// Account details from the last successful handshake
    pub fn authorization(&self) -> Option<Authorization> {
        self.inner.authorization().clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Forget requests sent but not yet acknowledged
    pub fn forgets_in_flight(&self) -> usize {
        self.inner.forgotten().len()
    }

    /// True once the session was stopped or the supervisor gave up
    ///
    /// A stopped session never reconnects on its own; requests keep failing
    /// with `NotConnected` until the next `start`.
    pub fn is_stopped(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Send any request and wait for its correlated response
    #[instrument(skip(self, request), fields(family = request.family()))]
    pub async fn request(&self, request: Request) -> Result<Reply> {
        self.inner.request(request).await
    }

    /// Open a server-push stream; returns the venue's subscription id
    pub async fn subscribe(&self, request: Request) -> Result<String> {
        if request.subscription().is_none() {
            return Err(SessionError::Internal(format!(
                "{} request does not open a stream",
                request.family()
            )));
        }

        let reply = self.inner.request(request).await?;
        reply.subscription_id.ok_or_else(|| {
            SessionError::InvalidResponse(format!(
                "{} response carried no subscription id",
                reply.response.family()
            ))
        })
    }

    pub async fn subscribe_ticks(&self, symbol: &str) -> Result<String> {
        self.subscribe(Request::ticks(symbol)).await
    }

    pub async fn subscribe_balance(&self) -> Result<String> {
        self.subscribe(Request::balance()).await
    }

    pub async fn subscribe_transactions(&self) -> Result<String> {
        self.subscribe(Request::transactions()).await
    }

    /// Stream updates for a purchased contract until it finishes
    pub async fn watch_contract(&self, contract_id: ContractId) -> Result<String> {
        let subject = contract_id.to_string();
        if let Some(existing) = self
            .inner
            .subscriptions
            .find(SubscriptionKind::OpenContract, &subject)
        {
            return Ok(existing.id);
        }
        self.subscribe(Request::open_contract(contract_id)).await
    }

    /// Stop a stream; unknown ids are ignored
    pub fn forget(&self, subscription_id: &str) {
        match self.inner.subscriptions.remove(subscription_id) {
            Some(subscription) => self.inner.send_forget(subscription.id),
            None => debug!(subscription_id, "Forget for unknown subscription ignored"),
        }
    }

    /// Stop every stream about a subject, whatever its current id
    pub fn forget_subject(&self, kind: SubscriptionKind, subject: &str) {
        for subscription in self.inner.subscriptions.remove_subject(kind, subject) {
            self.inner.send_forget(subscription.id);
        }
    }

    /// Forget every tracked stream; returns how many were live
    pub fn forget_all(&self) -> usize {
        let subscriptions = self.inner.subscriptions.take_all();
        let count = subscriptions.len();
        for subscription in subscriptions {
            self.inner.send_forget(subscription.id);
        }
        self.inner.subscriptions.take_orphaned();
        count
    }

    /// Forget whole stream families in one request
    pub async fn forget_streams(&self, kinds: &[SubscriptionKind]) -> Result<Vec<String>> {
        let removed: Vec<String> = self
            .inner
            .subscriptions
            .remove_kinds(kinds)
            .into_iter()
            .map(|s| s.id)
            .collect();
        self.inner.forgotten().extend(removed.iter().cloned());

        let result = self.inner.request(Request::forget_all(kinds)).await;
        {
            let mut forgotten = self.inner.forgotten();
            for id in &removed {
                forgotten.remove(id);
            }
        }

        match result?.response {
            Response::ForgetAll(ids) => Ok(ids),
            other => Err(unexpected("forget_all", &other)),
        }
    }

    pub async fn ticks_history(&self, symbol: &str, count: u32) -> Result<TickHistory> {
        match self
            .inner
            .request(Request::ticks_history(symbol, count))
            .await?
            .response
        {
            Response::History(history) => Ok(history),
            other => Err(unexpected("history", &other)),
        }
    }

    /// Round-trip time of a ping
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        match self.inner.request(Request::ping()).await?.response {
            Response::Pong => Ok(started.elapsed()),
            other => Err(unexpected("ping", &other)),
        }
    }

    pub async fn get_proposal(&self, request: &ProposalRequest) -> Result<Proposal> {
        match self
            .inner
            .request(Request::Proposal(request.clone()))
            .await?
            .response
        {
            Response::Proposal(proposal) => Ok(proposal),
            other => Err(unexpected("proposal", &other)),
        }
    }

    pub async fn buy_contract(&self, proposal_id: &str, max_price: Decimal) -> Result<BuyReceipt> {
        let receipt = match self
            .inner
            .request(Request::buy(proposal_id, max_price))
            .await?
            .response
        {
            Response::Buy(receipt) => receipt,
            other => return Err(unexpected("buy", &other)),
        };

        self.inner.contracts.track(OpenContract {
            contract_id: receipt.contract_id,
            is_settleable: false,
            is_sold: false,
            profit: Decimal::ZERO,
            buy_price: receipt.buy_price,
            underlying: None,
            status: Some("open".to_string()),
        });
        Ok(receipt)
    }

    pub async fn sell_contract(
        &self,
        contract_id: ContractId,
        min_price: Decimal,
    ) -> Result<SellReceipt> {
        match self
            .inner
            .request(Request::sell(contract_id, min_price))
            .await?
            .response
        {
            Response::Sell(receipt) => Ok(receipt),
            other => Err(unexpected("sell", &other)),
        }
    }

    /// Wait until the contract closes, is force-released, or the safety
    /// timeout elapses
    pub async fn await_closure(
        &self,
        contract_id: ContractId,
        safety_timeout: Duration,
    ) -> Resolution {
        self.inner
            .lifecycle
            .await_closure(contract_id, safety_timeout)
            .await
    }

    /// Stop waiting on a contract; false if it was already resolved
    pub fn force_release(&self, contract_id: ContractId) -> bool {
        self.inner
            .lifecycle
            .notify(&contract_id, LifecycleEvent::ForceReleased)
    }

    /// Latest known state of a contract held in the book
    pub fn open_contract(&self, contract_id: ContractId) -> Option<OpenContract> {
        self.inner.contracts.get(contract_id)
    }

    /// Final state of a contract, asking the venue if no push settled it
    pub async fn contract_outcome(&self, contract_id: ContractId) -> Result<OpenContract> {
        if let Some(settled) = self.inner.contracts.settled(contract_id) {
            return Ok(settled);
        }

        match self
            .inner
            .request(Request::contract_snapshot(contract_id))
            .await?
            .response
        {
            Response::OpenContract(contract) => {
                self.inner.contracts.apply(&contract);
                Ok(contract)
            }
            other => Err(unexpected("proposal_open_contract", &other)),
        }
    }

    /// Drop the book entry, the closure state and any stream for a contract
    pub fn release_contract(&self, contract_id: ContractId) {
        self.inner.contracts.release(contract_id);
        self.inner.lifecycle.forget(&contract_id);
        self.forget_subject(SubscriptionKind::OpenContract, &contract_id.to_string());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

#[async_trait]
impl TradingGateway for Session {
    async fn get_proposal(&self, request: &ProposalRequest) -> Result<Proposal> {
        Session::get_proposal(self, request).await
    }

    async fn buy_contract(&self, proposal_id: &str, max_price: Decimal) -> Result<BuyReceipt> {
        Session::buy_contract(self, proposal_id, max_price).await
    }

    async fn sell_contract(
        &self,
        contract_id: ContractId,
        min_price: Decimal,
    ) -> Result<SellReceipt> {
        Session::sell_contract(self, contract_id, min_price).await
    }

    async fn watch_contract(&self, contract_id: ContractId) -> Result<()> {
        Session::watch_contract(self, contract_id).await.map(|_| ())
    }

    async fn await_closure(&self, contract_id: ContractId, safety_timeout: Duration) -> Resolution {
        Session::await_closure(self, contract_id, safety_timeout).await
    }

    async fn contract_outcome(&self, contract_id: ContractId) -> Result<OpenContract> {
        Session::contract_outcome(self, contract_id).await
    }

    async fn release_contract(&self, contract_id: ContractId) {
        Session::release_contract(self, contract_id)
    }

    fn is_stopped(&self) -> bool {
        Session::is_stopped(self)
    }
}

fn unexpected(expected: &str, response: &Response) -> SessionError {
    SessionError::InvalidResponse(format!(
        "expected {} response, got {}",
        expected,
        response.family()
    ))
}

fn reader_exit(result: std::result::Result<String, JoinError>) -> String {
    result.unwrap_or_else(|e| format!("reader task failed: {}", e))
}

impl SessionInner {
    fn events(&self) -> MutexGuard<'_, Option<mpsc::Sender<SessionEvent>>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn authorization(&self) -> MutexGuard<'_, Option<Authorization>> {
        self.authorization.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forgotten(&self) -> MutexGuard<'_, HashSet<String>> {
        self.forgotten.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        let sender = self.events().clone();
        let Some(sender) = sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Event channel full, dropping event"),
            Err(TrySendError::Closed(_)) => debug!("Event receiver dropped"),
        }
    }

    fn publish(&self, status: ConnectionStatus) {
        self.listener.on_connection_status(&status);
        self.emit(SessionEvent::ConnectionStatus(status));
    }

    async fn request(&self, request: Request) -> Result<Reply> {
        let timeout = match request.timeout_class() {
            TimeoutClass::Standard => self.settings.request_timeout(),
            TimeoutClass::History => self.settings.history_timeout(),
        };
        self.correlator
            .request(request, timeout, |frame| self.connection.send(frame))
            .await
    }

    async fn supervise(self: Arc<Self>, ready_tx: oneshot::Sender<Result<()>>) {
        let mut ready_tx = Some(ready_tx);
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            match self
                .run_connection(&mut shutdown, &mut ready_tx, &mut attempt)
                .await
            {
                CycleEnd::Shutdown => break,
                CycleEnd::Terminal(err) => {
                    error!(error = %err, "Session stopped by terminal error");
                    match &err {
                        SessionError::AuthorizationFailed(reason) => {
                            self.publish(ConnectionStatus::AuthorizationFailed(reason.clone()))
                        }
                        other => self.publish(ConnectionStatus::Error(other.to_string())),
                    }
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(err));
                    }
                    break;
                }
                CycleEnd::Dropped(reason) => self.on_disconnect(&reason),
            }

            attempt += 1;
            if !self.policy.allows(attempt) {
                let err = SessionError::WebSocketConnection(format!(
                    "gave up after {} reconnect attempts",
                    attempt - 1
                ));
                error!(error = %err, "Reconnect attempts exhausted");
                self.publish(ConnectionStatus::Error(err.to_string()));
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(err));
                }
                break;
            }

            let delay = self.policy.delay_for(attempt);
            let delay_ms = delay.as_millis() as u64;
            info!(attempt, delay_ms, "Reconnecting");
            self.publish(ConnectionStatus::Reconnecting { attempt, delay_ms });
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.teardown();
    }

    async fn run_connection(
        self: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
        ready_tx: &mut Option<oneshot::Sender<Result<()>>>,
        attempt: &mut u32,
    ) -> CycleEnd {
        if *shutdown.borrow() {
            return CycleEnd::Shutdown;
        }

        self.publish(ConnectionStatus::Connecting);
        let reader = match self.connection.connect().await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(error = %e, "Failed to connect");
                return CycleEnd::Dropped(e.to_string());
            }
        };
        self.publish(ConnectionStatus::Connected);

        let mut read_task = tokio::spawn(self.clone().read_loop(reader));

        let handshake = tokio::select! {
            result = self.handshake() => result,
            result = &mut read_task => return CycleEnd::Dropped(reader_exit(result)),
            _ = shutdown.changed() => {
                read_task.abort();
                return CycleEnd::Shutdown;
            }
        };
        if let Err(e) = handshake {
            read_task.abort();
            self.connection.close();
            if e.is_terminal() {
                return CycleEnd::Terminal(e);
            }
            warn!(error = %e, "Handshake failed");
            return CycleEnd::Dropped(e.to_string());
        }

        *attempt = 0;
        self.publish(ConnectionStatus::Ready);
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }
        self.spawn_resubscribe();

        let heartbeat_enabled = self.settings.heartbeat_interval_secs > 0;
        let period = Duration::from_secs(self.settings.heartbeat_interval_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut read_task => return CycleEnd::Dropped(reader_exit(result)),
                _ = shutdown.changed() => {
                    read_task.abort();
                    return CycleEnd::Shutdown;
                }
                _ = heartbeat.tick(), if heartbeat_enabled => self.spawn_ping(),
            }
        }
    }

    /// Authorize when a token is configured, then mark the session Ready
    async fn handshake(&self) -> Result<()> {
        if let Some(token) = self.venue.token() {
            self.connection.transition(ConnectionState::Authorizing);
            let reply = self
                .correlator
                .request(
                    Request::authorize(token),
                    self.settings.request_timeout(),
                    |frame| self.connection.send_handshake(frame),
                )
                .await;

            match reply {
                Ok(Reply {
                    response: Response::Authorize(auth),
                    ..
                }) => {
                    info!(loginid = %auth.loginid, is_virtual = auth.is_virtual, "Authorized");
                    let balance = Balance {
                        balance: auth.balance,
                        currency: auth.currency.clone(),
                        loginid: Some(auth.loginid.clone()),
                    };
                    self.listener.on_balance_update(&balance);
                    self.emit(SessionEvent::Balance(balance));
                    *self.authorization() = Some(auth);
                }
                Ok(reply) => {
                    return Err(SessionError::AuthorizationFailed(format!(
                        "unexpected {} response",
                        reply.response.family()
                    )))
                }
                Err(SessionError::Venue { code, message }) => {
                    return Err(SessionError::AuthorizationFailed(format!(
                        "{}: {}",
                        code, message
                    )))
                }
                Err(e) => return Err(e),
            }
        }

        self.connection.transition(ConnectionState::Ready);
        Ok(())
    }

    /// Read until the socket closes; returns the close reason
    async fn read_loop(self: Arc<Self>, mut reader: WsReader) -> String {
        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => self.dispatch(&text),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => self.dispatch(&text),
                    Err(e) => warn!(error = %e, "Dropping non UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by venue".to_string());
                    info!(%reason, "Venue closed the connection");
                    return reason;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "WebSocket read error");
                    return e.to_string();
                }
            }
        }
        "stream ended".to_string()
    }

    /// Route one inbound frame
    fn dispatch(self: &Arc<Self>, text: &str) {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to decode frame");
                self.emit(SessionEvent::Raw(text.to_string()));
                return;
            }
        };

        if let Some(req_id) = frame.req_id {
            if let Some(pending) = self.correlator.take(req_id) {
                self.settle(pending, frame);
                return;
            }
        }

        match frame.subscription_id().map(str::to_string) {
            Some(id) if self.subscriptions.contains(&id) => self.route_push(frame.response),
            Some(id) => {
                debug!(
                    subscription_id = %id,
                    msg_type = %frame.msg_type,
                    "Push for unknown subscription"
                );
                self.send_forget(id);
            }
            None => debug!(
                req_id = ?frame.req_id,
                msg_type = %frame.msg_type,
                "Dropping uncorrelated frame"
            ),
        }
    }

    /// Complete a pending request from its response frame
    ///
    /// A confirmed stream is registered and its first payload routed before
    /// the caller resumes.
    fn settle(self: &Arc<Self>, pending: PendingRequest, frame: InboundFrame) {
        let req_id = pending.req_id();
        let confirmed = (
            frame.error.is_none(),
            frame.subscription_id(),
            pending.subscription(),
        );
        let subscription = match confirmed {
            (true, Some(id), Some((kind, subject))) => Some(Subscription {
                id: id.to_string(),
                kind,
                subject,
                request: pending.request().clone(),
            }),
            _ => None,
        };

        if let Some(subscription) = &subscription {
            self.subscriptions.register(subscription.clone());
            self.route_push(frame.response.clone());
        }

        let subscription_id = subscription.as_ref().map(|s| s.id.clone());
        let reply = frame.into_result().map(|response| Reply {
            response,
            subscription_id,
        });

        if !pending.settle(reply) {
            debug!(req_id, "Caller no longer waiting, dropping response");
            if let Some(subscription) = subscription {
                self.subscriptions.remove(&subscription.id);
                self.send_forget(subscription.id);
            }
        }
    }

    /// Deliver a push payload to its consumers
    fn route_push(self: &Arc<Self>, response: Response) {
        match response {
            Response::Tick(tick) => self.emit(SessionEvent::Tick(tick)),
            Response::OpenContract(contract) => {
                match self.contracts.apply(&contract) {
                    ContractUpdate::Ignored => return,
                    ContractUpdate::Finished(finished) => {
                        info!(
                            contract_id = finished.contract_id,
                            profit = %finished.profit,
                            "Contract finished"
                        );
                        self.lifecycle
                            .notify(&finished.contract_id, LifecycleEvent::Closed);
                        let subject = finished.contract_id.to_string();
                        for subscription in self
                            .subscriptions
                            .remove_subject(SubscriptionKind::OpenContract, &subject)
                        {
                            self.send_forget(subscription.id);
                        }
                    }
                    ContractUpdate::Opened | ContractUpdate::Updated => {}
                }
                self.emit(SessionEvent::OpenContract(contract));
            }
            Response::Balance(balance) => {
                self.listener.on_balance_update(&balance);
                self.emit(SessionEvent::Balance(balance));
            }
            Response::Transaction(transaction) => {
                self.emit(SessionEvent::Transaction(transaction))
            }
            other => debug!(family = other.family(), "Ignoring push payload"),
        }
    }

    /// Fire-and-forget unsubscribe, at most one in flight per id
    fn send_forget(self: &Arc<Self>, subscription_id: String) {
        if !self.connection.is_ready() || !self.forgotten().insert(subscription_id.clone()) {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            match inner.request(Request::forget(&subscription_id)).await {
                Ok(_) => debug!(%subscription_id, "Subscription forgotten"),
                Err(e) => debug!(%subscription_id, error = %e, "Forget failed"),
            }
            // The venue pushes nothing for the id after answering
            inner.forgotten().remove(&subscription_id);
        });
    }

    fn spawn_ping(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            match inner.request(Request::ping()).await {
                Ok(_) => debug!("Heartbeat acknowledged"),
                Err(e) => warn!(error = %e, "Heartbeat failed"),
            }
        });
    }

    /// Replay streams dropped by the last disconnect
    fn spawn_resubscribe(self: &Arc<Self>) {
        let orphaned = self.subscriptions.take_orphaned();
        if orphaned.is_empty() {
            return;
        }
        info!(count = orphaned.len(), "Re-establishing subscriptions");

        let inner = self.clone();
        tokio::spawn(async move {
            for subscription in orphaned {
                match inner.request(subscription.request.clone()).await {
                    Ok(reply) => info!(
                        kind = %subscription.kind,
                        subject = %subscription.subject,
                        old_id = %subscription.id,
                        new_id = ?reply.subscription_id,
                        "Subscription re-established"
                    ),
                    Err(e) if e.is_transient() => {
                        warn!(
                            kind = %subscription.kind,
                            subject = %subscription.subject,
                            error = %e,
                            "Re-subscribe failed, will retry"
                        );
                        inner.subscriptions.orphan(subscription);
                    }
                    Err(e) => warn!(
                        kind = %subscription.kind,
                        subject = %subscription.subject,
                        error = %e,
                        "Dropping subscription that could not be re-established"
                    ),
                }
            }
        });
    }

    /// Connection dropped: state goes Disconnected before waiters are failed
    fn on_disconnect(&self, reason: &str) {
        self.connection.close();
        let failed = self.correlator.fail_all(|| SessionError::ConnectionLost);
        let invalidated = self.subscriptions.invalidate();
        self.forgotten().clear();
        warn!(%reason, failed, invalidated, "Connection lost");
        self.publish(ConnectionStatus::Disconnected(Some(reason.to_string())));
    }

    fn teardown(&self) {
        self.connection.close();
        let failed = self.correlator.fail_all(|| SessionError::ConnectionLost);
        let dropped =
            self.subscriptions.take_all().len() + self.subscriptions.take_orphaned().len();
        let released = self.lifecycle.release_all();
        self.forgotten().clear();
        self.shutdown.send_replace(true);
        info!(failed, dropped, released, "Session stopped");
        self.publish(ConnectionStatus::Disconnected(None));
    }
}
