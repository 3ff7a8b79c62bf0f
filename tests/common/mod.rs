//! Common test utilities and fixtures
//!
//! [`MockVenue`] is a scripted venue speaking the session's JSON protocol
//! over a local WebSocket. Only one client connection is served at a time;
//! subscription ids are minted per connection like the real venue does.

#![allow(dead_code)]

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use trade_session::common::types::{Balance, ConnectionStatus};
use trade_session::config::types::{SessionSettings, VenueConfig};
use trade_session::strategy::statistics::TradeMetrics;
use trade_session::SessionListener;

pub const VALID_TOKEN: &str = "valid-token";

/// Knobs for scripted venue behavior
#[derive(Debug, Clone, Default)]
pub struct MockVenueOptions {
    /// Hold proposal requests until this many arrived, then answer them in
    /// reverse order
    pub proposal_batch: usize,
    /// Answer these families only after the given delay
    pub delays: Vec<(&'static str, Duration)>,
    /// Profits used to settle contracts shortly after they are watched
    pub settle_profits: Vec<f64>,
}

#[derive(Default)]
struct VenueState {
    options: MockVenueOptions,
    connections: AtomicUsize,
    next_id: AtomicU64,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    received: Mutex<Vec<Value>>,
    held_proposals: Mutex<Vec<Value>>,
    /// symbol -> subscription id, current connection only
    tick_streams: Mutex<HashMap<String, String>>,
    /// contract id -> subscription id, current connection only
    contract_streams: Mutex<HashMap<u64, String>>,
    settled: Mutex<HashMap<u64, f64>>,
    settle_queue: Mutex<Vec<f64>>,
}

impl VenueState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send(&self, frame: Value) -> bool {
        match self.writer.lock().unwrap().as_ref() {
            Some(tx) => tx.send(Message::Text(frame.to_string())).is_ok(),
            None => false,
        }
    }
}

pub struct MockVenue {
    addr: SocketAddr,
    state: Arc<VenueState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockVenue {
    pub async fn spawn(options: MockVenueOptions) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(VenueState {
            settle_queue: Mutex::new(options.settle_profits.iter().rev().copied().collect()),
            options,
            next_id: AtomicU64::new(1000),
            ..Default::default()
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let server_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            let state = server_state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_socket(state, stream).await {
                                    warn!(error = %e, "Mock venue connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Mock venue failed to accept");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn venue_config(&self, token: Option<&str>) -> VenueConfig {
        VenueConfig {
            websocket_url: self.url(),
            api_token: token.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Every request received for a family, in arrival order
    pub fn requests(&self, family: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.get(family).is_some())
            .cloned()
            .collect()
    }

    pub fn forgotten_ids(&self) -> Vec<String> {
        self.requests("forget")
            .iter()
            .filter_map(|r| r["forget"].as_str().map(str::to_string))
            .collect()
    }

    /// Close the live connection from the venue side
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.writer.lock().unwrap().take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Push a tick on the live stream for a symbol; false if none is open
    pub fn push_tick(&self, symbol: &str, quote: f64) -> bool {
        let stream = self.state.tick_streams.lock().unwrap().get(symbol).cloned();
        match stream {
            Some(id) => self.state.send(tick_frame(symbol, quote, &id, None)),
            None => false,
        }
    }

    /// Settle a contract and push its final state on the live stream
    pub fn finish_contract(&self, contract_id: u64, profit: f64) -> bool {
        finish_contract(&self.state, contract_id, profit)
    }

    pub fn tick_stream(&self, symbol: &str) -> Option<String> {
        self.state.tick_streams.lock().unwrap().get(symbol).cloned()
    }
}

impl Drop for MockVenue {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn handle_socket(state: Arc<VenueState>, stream: TcpStream) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    state.connections.fetch_add(1, Ordering::SeqCst);
    state.tick_streams.lock().unwrap().clear();
    state.contract_streams.lock().unwrap().clear();
    *state.writer.lock().unwrap() = Some(tx.clone());

    while let Some(message) = source.next().await {
        match message? {
            Message::Text(text) => {
                let request: Value = serde_json::from_str(&text)?;
                state.received.lock().unwrap().push(request.clone());
                handle_request(&state, &tx, request);
            }
            Message::Ping(payload) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(tx);
    writer.abort();
    Ok(())
}

fn reply(state: &Arc<VenueState>, tx: &mpsc::UnboundedSender<Message>, family: &str, frame: Value) {
    let delay = state
        .options
        .delays
        .iter()
        .find(|(f, _)| *f == family)
        .map(|(_, d)| *d);

    match delay {
        Some(delay) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Message::Text(frame.to_string()));
            });
        }
        None => {
            let _ = tx.send(Message::Text(frame.to_string()));
        }
    }
}

fn handle_request(state: &Arc<VenueState>, tx: &mpsc::UnboundedSender<Message>, request: Value) {
    let req_id = request["req_id"].clone();

    if let Some(token) = request.get("authorize").and_then(Value::as_str) {
        let frame = if token == VALID_TOKEN {
            json!({
                "msg_type": "authorize",
                "authorize": {
                    "loginid": "VRTC1", "balance": 1000, "currency": "USD", "is_virtual": 1
                },
                "req_id": req_id,
            })
        } else {
            json!({
                "msg_type": "authorize",
                "error": {"code": "InvalidToken", "message": "The token is invalid."},
                "req_id": req_id,
            })
        };
        reply(state, tx, "authorize", frame);
    } else if request.get("ping").is_some() {
        reply(state, tx, "ping", json!({"msg_type": "ping", "ping": "pong", "req_id": req_id}));
    } else if request.get("proposal").is_some() {
        handle_proposal(state, tx, request);
    } else if let Some(proposal_id) = request.get("buy").and_then(Value::as_str) {
        let contract_id = state.next_id();
        let price = request["price"].as_f64().unwrap_or(1.0);
        let frame = json!({
            "msg_type": "buy",
            "buy": {
                "contract_id": contract_id,
                "buy_price": price,
                "balance_after": 1000.0 - price,
                "transaction_id": state.next_id(),
                "longcode": format!("Bought {}", proposal_id),
            },
            "req_id": req_id,
        });
        reply(state, tx, "buy", frame);
    } else if let Some(contract_id) = request.get("sell").and_then(Value::as_u64) {
        state.settled.lock().unwrap().insert(contract_id, -0.5);
        let frame = json!({
            "msg_type": "sell",
            "sell": {
                "contract_id": contract_id,
                "sold_for": 0.5,
                "balance_after": 1000.5,
                "transaction_id": state.next_id(),
            },
            "req_id": req_id,
        });
        reply(state, tx, "sell", frame);
    } else if let Some(symbol) = request.get("ticks").and_then(Value::as_str) {
        let id = format!("tick-{}", state.next_id());
        state
            .tick_streams
            .lock()
            .unwrap()
            .insert(symbol.to_string(), id.clone());
        reply(state, tx, "ticks", tick_frame(symbol, 100.0, &id, Some(req_id)));
    } else if let Some(symbol) = request.get("ticks_history").and_then(Value::as_str) {
        let frame = json!({
            "msg_type": "history",
            "history": {"prices": [100.1, 100.2, 100.3], "times": [1, 2, 3]},
            "echo_req": {"ticks_history": symbol},
            "req_id": req_id,
        });
        reply(state, tx, "ticks_history", frame);
    } else if request.get("proposal_open_contract").is_some() {
        handle_open_contract(state, tx, request);
    } else if request.get("balance").is_some() {
        let id = format!("bal-{}", state.next_id());
        let frame = json!({
            "msg_type": "balance",
            "balance": {"balance": 1000, "currency": "USD", "loginid": "VRTC1", "id": id},
            "subscription": {"id": id},
            "req_id": req_id,
        });
        reply(state, tx, "balance", frame);
    } else if let Some(id) = request.get("forget").and_then(Value::as_str) {
        let removed = remove_stream(state, id);
        reply(
            state,
            tx,
            "forget",
            json!({"msg_type": "forget", "forget": if removed { 1 } else { 0 }, "req_id": req_id}),
        );
    } else if let Some(kinds) = request.get("forget_all").and_then(Value::as_array) {
        let mut ids = Vec::new();
        for kind in kinds.iter().filter_map(Value::as_str) {
            if kind == "ticks" {
                ids.extend(state.tick_streams.lock().unwrap().drain().map(|(_, id)| id));
            } else if kind == "proposal_open_contract" {
                ids.extend(state.contract_streams.lock().unwrap().drain().map(|(_, id)| id));
            }
        }
        reply(
            state,
            tx,
            "forget_all",
            json!({"msg_type": "forget_all", "forget_all": ids, "req_id": req_id}),
        );
    } else {
        let frame = json!({
            "msg_type": "error",
            "error": {"code": "UnrecognisedRequest", "message": "Unrecognised request."},
            "req_id": req_id,
        });
        reply(state, tx, "unknown", frame);
    }
}

fn handle_proposal(state: &Arc<VenueState>, tx: &mpsc::UnboundedSender<Message>, request: Value) {
    let batch = state.options.proposal_batch;
    if batch == 0 {
        reply(state, tx, "proposal", proposal_frame(&request));
        return;
    }

    let ready: Vec<Value> = {
        let mut held = state.held_proposals.lock().unwrap();
        held.push(request);
        if held.len() < batch {
            return;
        }
        held.drain(..).rev().collect()
    };
    for request in ready {
        reply(state, tx, "proposal", proposal_frame(&request));
    }
}

fn proposal_frame(request: &Value) -> Value {
    let amount = request["amount"].as_f64().unwrap_or(1.0);
    json!({
        "msg_type": "proposal",
        "proposal": {
            "id": format!("prop-{}", amount),
            "ask_price": amount,
            "payout": amount * 1.95,
            "spot": 100.0,
            "longcode": "Win payout if the exit spot is higher than the entry spot.",
        },
        "req_id": request["req_id"],
    })
}

fn handle_open_contract(
    state: &Arc<VenueState>,
    tx: &mpsc::UnboundedSender<Message>,
    request: Value,
) {
    let contract_id = request["contract_id"].as_u64().unwrap_or_default();
    let settled = state.settled.lock().unwrap().get(&contract_id).copied();
    let subscribe = request.get("subscribe").is_some();

    let mut frame = json!({
        "msg_type": "proposal_open_contract",
        "proposal_open_contract": contract_body(contract_id, settled),
        "req_id": request["req_id"],
    });
    if subscribe && settled.is_none() {
        let id = format!("poc-{}", state.next_id());
        state
            .contract_streams
            .lock()
            .unwrap()
            .insert(contract_id, id.clone());
        frame["subscription"] = json!({"id": id});

        let profit = state.settle_queue.lock().unwrap().pop();
        if let Some(profit) = profit {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                finish_contract(&state, contract_id, profit);
            });
        }
    }
    reply(state, tx, "proposal_open_contract", frame);
}

fn contract_body(contract_id: u64, settled: Option<f64>) -> Value {
    json!({
        "contract_id": contract_id,
        "is_sold": if settled.is_some() { 1 } else { 0 },
        "is_settleable": 0,
        "profit": settled.unwrap_or(0.0),
        "buy_price": 1,
        "underlying": "R_100",
        "status": match settled {
            Some(p) if p > 0.0 => "won",
            Some(_) => "lost",
            None => "open",
        },
    })
}

fn finish_contract(state: &Arc<VenueState>, contract_id: u64, profit: f64) -> bool {
    state.settled.lock().unwrap().insert(contract_id, profit);
    let stream = state
        .contract_streams
        .lock()
        .unwrap()
        .get(&contract_id)
        .cloned();
    match stream {
        Some(id) => state.send(json!({
            "msg_type": "proposal_open_contract",
            "proposal_open_contract": contract_body(contract_id, Some(profit)),
            "subscription": {"id": id},
        })),
        None => false,
    }
}

fn remove_stream(state: &Arc<VenueState>, id: &str) -> bool {
    let mut ticks = state.tick_streams.lock().unwrap();
    let before = ticks.len();
    ticks.retain(|_, stream| stream != id);
    let mut contracts = state.contract_streams.lock().unwrap();
    let before_contracts = contracts.len();
    contracts.retain(|_, stream| stream != id);
    ticks.len() != before || contracts.len() != before_contracts
}

fn tick_frame(symbol: &str, quote: f64, id: &str, req_id: Option<Value>) -> Value {
    let mut frame = json!({
        "msg_type": "tick",
        "tick": {"symbol": symbol, "quote": quote, "epoch": 1_700_000_000, "id": id},
        "subscription": {"id": id},
    });
    if let Some(req_id) = req_id {
        frame["req_id"] = req_id;
    }
    frame
}

/// Session settings tuned for fast tests
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        request_timeout_ms: 2_000,
        history_timeout_ms: 3_000,
        closure_timeout_secs: 5,
        reconnect_delay_ms: 50,
        max_reconnect_delay_ms: 200,
        max_reconnect_attempts: 5,
        heartbeat_interval_secs: 0,
        ..Default::default()
    }
}

/// Listener that records everything it is told
#[derive(Default)]
pub struct RecordingListener {
    pub statuses: Mutex<Vec<ConnectionStatus>>,
    pub balances: Mutex<Vec<Balance>>,
    pub metrics: Mutex<Vec<TradeMetrics>>,
}

impl SessionListener for RecordingListener {
    fn on_balance_update(&self, balance: &Balance) {
        self.balances.lock().unwrap().push(balance.clone());
    }

    fn on_statistics_changed(&self, metrics: &TradeMetrics) {
        self.metrics.lock().unwrap().push(metrics.clone());
    }

    fn on_connection_status(&self, status: &ConnectionStatus) {
        self.statuses.lock().unwrap().push(status.clone());
    }
}

/// Poll a condition until it holds or the timeout elapses
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
