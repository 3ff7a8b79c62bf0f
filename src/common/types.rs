//! Unified types shared by the session engine and the strategy layer

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// Venue-assigned identifier of a purchased contract
pub type ContractId = u64;

/// Lifecycle state of the single venue connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Authorizing,
    Ready,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Authorizing => write!(f, "authorizing"),
            ConnectionState::Ready => write!(f, "ready"),
        }
    }
}

/// Connection status reported to the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Socket is being opened
    Connecting,
    /// Socket open, handshake in progress
    Connected,
    /// Authorized (or anonymous) and accepting requests
    Ready,
    /// Disconnected (with optional reason)
    Disconnected(Option<String>),
    /// Waiting before the next connection attempt
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// The venue refused the credential token; the session is stopped
    AuthorizationFailed(String),
    /// Connection error
    Error(String),
}

/// A single price tick for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub quote: Decimal,
    pub epoch: i64,
}

/// Account balance snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub balance: Decimal,
    pub currency: String,
    #[serde(default)]
    pub loginid: Option<String>,
}

/// A purchased position that has not been released yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenContract {
    pub contract_id: ContractId,
    #[serde(default, deserialize_with = "bool_from_flag")]
    pub is_settleable: bool,
    #[serde(default, deserialize_with = "bool_from_flag")]
    pub is_sold: bool,
    #[serde(default)]
    pub profit: Decimal,
    #[serde(default)]
    pub buy_price: Decimal,
    #[serde(default)]
    pub underlying: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl OpenContract {
    /// The outcome is determined and the contract no longer needs watching
    pub fn is_finished(&self) -> bool {
        self.is_sold || self.is_settleable
    }

    /// Merge a newer push update into this record
    pub fn apply(&mut self, update: &OpenContract) {
        self.is_settleable = update.is_settleable;
        self.is_sold = update.is_sold;
        self.profit = update.profit;
        if update.buy_price != Decimal::ZERO {
            self.buy_price = update.buy_price;
        }
        if update.underlying.is_some() {
            self.underlying = update.underlying.clone();
        }
        if update.status.is_some() {
            self.status = update.status.clone();
        }
    }
}

/// Immutable record of one settled trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub stake: Decimal,
    pub profit: Decimal,
    pub is_win: bool,
}

impl TradeOutcome {
    /// Create an outcome stamped with the current time
    pub fn new(symbol: impl Into<String>, stake: Decimal, profit: Decimal) -> Self {
        Self::at(Utc::now(), symbol, stake, profit)
    }

    /// Create an outcome with an explicit timestamp
    pub fn at(
        timestamp: DateTime<Utc>,
        symbol: impl Into<String>,
        stake: Decimal,
        profit: Decimal,
    ) -> Self {
        Self {
            timestamp,
            symbol: symbol.into(),
            stake,
            profit,
            is_win: profit > Decimal::ZERO,
        }
    }
}

/// Events pushed out of the session to its consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Price tick from a ticks subscription
    Tick(Tick),
    /// Open contract update
    OpenContract(OpenContract),
    /// Balance update
    Balance(Balance),
    /// Transaction stream entry, forwarded untyped
    Transaction(serde_json::Value),
    /// Connection status change
    ConnectionStatus(ConnectionStatus),
    /// Push frame of a family the engine does not model
    Raw(String),
}

/// The venue encodes booleans as 0/1 integers
pub(crate) fn bool_from_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}
