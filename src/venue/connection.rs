//! Ownership of the single venue socket

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, instrument, warn};

use crate::common::errors::{Result, SessionError};
use crate::common::types::ConnectionState;
use crate::config::types::SessionSettings;

/// Read half of the venue socket
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Growing delay between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0 = unlimited
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.reconnect_delay_ms),
            max_delay: Duration::from_millis(
                settings.max_reconnect_delay_ms.max(settings.reconnect_delay_ms),
            ),
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Delay before the given attempt (1-based): base * 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

/// Owns the socket lifecycle and the only path for outbound frames
///
/// The write half lives in a dedicated task fed by an unbounded channel;
/// dropping the channel sender closes the socket.
pub struct ConnectionManager {
    endpoint: String,
    state_tx: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl ConnectionManager {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            state_tx,
            outbound: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to a new state; returns the previous one
    pub(crate) fn transition(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Connection state changed");
        }
        previous
    }

    /// Open the socket and start the writer task
    ///
    /// Any previous socket is closed first so at most one is ever live.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn connect(&self) -> Result<WsReader> {
        self.close();
        self.transition(ConnectionState::Connecting);

        let (ws_stream, _response) = match connect_async(self.endpoint.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                return Err(SessionError::WebSocketConnection(e.to_string()));
            }
        };

        let (mut write, read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write.send(message).await {
                    warn!(error = %e, "Failed to write frame, stopping writer");
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Writer task finished");
        });

        *self.outbound() = Some(tx);
        self.transition(ConnectionState::Open);
        info!("WebSocket connection established");
        Ok(read)
    }

    /// Send a frame; only allowed once the session is Ready
    pub fn send(&self, frame: String) -> Result<()> {
        if !self.is_ready() {
            return Err(SessionError::NotConnected);
        }
        self.push(Message::Text(frame))
    }

    /// Send a frame while the handshake is still running
    pub(crate) fn send_handshake(&self, frame: String) -> Result<()> {
        match self.state() {
            ConnectionState::Open | ConnectionState::Authorizing | ConnectionState::Ready => {
                self.push(Message::Text(frame))
            }
            _ => Err(SessionError::NotConnected),
        }
    }

    fn push(&self, message: Message) -> Result<()> {
        match self.outbound().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| SessionError::NotConnected),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Close the socket deterministically
    pub fn close(&self) {
        if let Some(tx) = self.outbound().take() {
            let _ = tx.send(Message::Close(None));
            debug!("Closing WebSocket");
        }
        self.transition(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(tx) = self.outbound().take() {
            let _ = tx.send(Message::Close(None));
        }
    }
}
