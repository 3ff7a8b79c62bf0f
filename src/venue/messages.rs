//! Venue message types
//!
//! Outbound requests are a closed set of typed variants; inbound frames are
//! decoded once at the connection boundary into an [`InboundFrame`] so the
//! rest of the engine never probes raw JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::errors::{Result, SessionError};
use crate::common::types::{bool_from_flag, Balance, ContractId, OpenContract, Tick};
use crate::config::types::TradeConfig;

/// Kinds of server-push streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Ticks,
    OpenContract,
    Balance,
    Transaction,
}

impl SubscriptionKind {
    /// Stream name as used by `forget_all`
    pub fn stream_name(&self) -> &'static str {
        match self {
            SubscriptionKind::Ticks => "ticks",
            SubscriptionKind::OpenContract => "proposal_open_contract",
            SubscriptionKind::Balance => "balance",
            SubscriptionKind::Transaction => "transaction",
        }
    }
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stream_name())
    }
}

/// Which timeout budget a request is held to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Standard,
    History,
}

/// Price quote request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub proposal: u8,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub basis: String,
    pub contract_type: String,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier: Option<String>,
}

impl ProposalRequest {
    /// Stake-based quote for the configured contract
    pub fn stake(amount: Decimal, trade: &TradeConfig) -> Self {
        Self {
            proposal: 1,
            amount,
            basis: "stake".to_string(),
            contract_type: trade.contract_type.clone(),
            currency: trade.currency.clone(),
            duration: trade.duration,
            duration_unit: trade.duration_unit.clone(),
            symbol: trade.symbol.clone(),
            barrier: None,
        }
    }
}

/// Tick history request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicksHistoryRequest {
    pub ticks_history: String,
    pub end: String,
    pub count: u32,
    pub style: String,
}

/// Outbound request families
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Request {
    Authorize {
        authorize: String,
    },
    Proposal(ProposalRequest),
    Buy {
        buy: String,
        #[serde(with = "rust_decimal::serde::float")]
        price: Decimal,
    },
    Sell {
        sell: ContractId,
        #[serde(with = "rust_decimal::serde::float")]
        price: Decimal,
    },
    Ticks {
        ticks: String,
        subscribe: u8,
    },
    TicksHistory(TicksHistoryRequest),
    OpenContract {
        proposal_open_contract: u8,
        contract_id: ContractId,
        #[serde(skip_serializing_if = "Option::is_none")]
        subscribe: Option<u8>,
    },
    Balance {
        balance: u8,
        subscribe: u8,
    },
    Transaction {
        transaction: u8,
        subscribe: u8,
    },
    Forget {
        forget: String,
    },
    ForgetAll {
        forget_all: Vec<String>,
    },
    Ping {
        ping: u8,
    },
}

impl Request {
    pub fn authorize(token: &str) -> Self {
        Request::Authorize {
            authorize: token.to_string(),
        }
    }

    pub fn buy(proposal_id: &str, max_price: Decimal) -> Self {
        Request::Buy {
            buy: proposal_id.to_string(),
            price: max_price,
        }
    }

    pub fn sell(contract_id: ContractId, min_price: Decimal) -> Self {
        Request::Sell {
            sell: contract_id,
            price: min_price,
        }
    }

    pub fn ticks(symbol: &str) -> Self {
        Request::Ticks {
            ticks: symbol.to_string(),
            subscribe: 1,
        }
    }

    pub fn ticks_history(symbol: &str, count: u32) -> Self {
        Request::TicksHistory(TicksHistoryRequest {
            ticks_history: symbol.to_string(),
            end: "latest".to_string(),
            count,
            style: "ticks".to_string(),
        })
    }

    /// Streaming updates for a contract
    pub fn open_contract(contract_id: ContractId) -> Self {
        Request::OpenContract {
            proposal_open_contract: 1,
            contract_id,
            subscribe: Some(1),
        }
    }

    /// One-shot snapshot of a contract
    pub fn contract_snapshot(contract_id: ContractId) -> Self {
        Request::OpenContract {
            proposal_open_contract: 1,
            contract_id,
            subscribe: None,
        }
    }

    pub fn balance() -> Self {
        Request::Balance {
            balance: 1,
            subscribe: 1,
        }
    }

    pub fn transactions() -> Self {
        Request::Transaction {
            transaction: 1,
            subscribe: 1,
        }
    }

    pub fn forget(subscription_id: &str) -> Self {
        Request::Forget {
            forget: subscription_id.to_string(),
        }
    }

    pub fn forget_all(kinds: &[SubscriptionKind]) -> Self {
        Request::ForgetAll {
            forget_all: kinds.iter().map(|k| k.stream_name().to_string()).collect(),
        }
    }

    pub fn ping() -> Self {
        Request::Ping { ping: 1 }
    }

    /// Message family name, used for logging
    pub fn family(&self) -> &'static str {
        match self {
            Request::Authorize { .. } => "authorize",
            Request::Proposal(_) => "proposal",
            Request::Buy { .. } => "buy",
            Request::Sell { .. } => "sell",
            Request::Ticks { .. } => "ticks",
            Request::TicksHistory(_) => "ticks_history",
            Request::OpenContract { .. } => "proposal_open_contract",
            Request::Balance { .. } => "balance",
            Request::Transaction { .. } => "transaction",
            Request::Forget { .. } => "forget",
            Request::ForgetAll { .. } => "forget_all",
            Request::Ping { .. } => "ping",
        }
    }

    /// Stream kind and subject key when this request opens a subscription
    pub fn subscription(&self) -> Option<(SubscriptionKind, String)> {
        match self {
            Request::Ticks { ticks, .. } => Some((SubscriptionKind::Ticks, ticks.clone())),
            Request::OpenContract {
                contract_id,
                subscribe: Some(_),
                ..
            } => Some((SubscriptionKind::OpenContract, contract_id.to_string())),
            Request::Balance { .. } => Some((SubscriptionKind::Balance, "balance".to_string())),
            Request::Transaction { .. } => {
                Some((SubscriptionKind::Transaction, "transaction".to_string()))
            }
            _ => None,
        }
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Request::TicksHistory(_) => TimeoutClass::History,
            _ => TimeoutClass::Standard,
        }
    }

    /// Serialize with the correlation id attached
    pub fn encode(&self, req_id: u64) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        let object = value.as_object_mut().ok_or_else(|| {
            SessionError::Internal(format!("{} request is not a JSON object", self.family()))
        })?;
        object.insert("req_id".to_string(), Value::from(req_id));
        Ok(serde_json::to_string(&value)?)
    }
}

/// Error object any response may carry instead of its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueErrorBody {
    pub code: String,
    pub message: String,
}

impl From<VenueErrorBody> for SessionError {
    fn from(body: VenueErrorBody) -> Self {
        SessionError::Venue {
            code: body.code,
            message: body.message,
        }
    }
}

/// Stream handle attached to the first frame of a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
}

/// Account details returned by `authorize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    /// Account login id
    pub loginid: String,
    pub balance: Decimal,
    pub currency: String,
    /// Demo account
    #[serde(default, deserialize_with = "bool_from_flag")]
    pub is_virtual: bool,
}

/// Price quote for a contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Quote id to pass to `buy`
    pub id: String,
    /// Price to pay for the contract
    pub ask_price: Decimal,
    pub payout: Decimal,
    #[serde(default)]
    pub spot: Option<Decimal>,
    #[serde(default)]
    pub longcode: String,
}

/// Confirmation of a purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyReceipt {
    pub contract_id: ContractId,
    pub buy_price: Decimal,
    pub balance_after: Decimal,
    pub transaction_id: u64,
    #[serde(default)]
    pub longcode: String,
}

/// Confirmation of a sale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellReceipt {
    pub contract_id: ContractId,
    /// Amount credited for the contract
    pub sold_for: Decimal,
    pub balance_after: Decimal,
    pub transaction_id: u64,
}

/// Past ticks, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickHistory {
    pub prices: Vec<Decimal>,
    /// Epoch seconds, parallel to `prices`
    pub times: Vec<i64>,
}

/// Typed payload of an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Authorize(Authorization),
    Proposal(Proposal),
    Buy(BuyReceipt),
    Sell(SellReceipt),
    Tick(Tick),
    History(TickHistory),
    OpenContract(OpenContract),
    Balance(Balance),
    Transaction(Value),
    Forget(bool),
    ForgetAll(Vec<String>),
    Pong,
    /// Error frames carry no payload
    Empty,
    /// Payload of an unmodelled family, or one that failed to decode
    Unknown(Value),
}

impl Response {
    pub fn family(&self) -> &'static str {
        match self {
            Response::Authorize(_) => "authorize",
            Response::Proposal(_) => "proposal",
            Response::Buy(_) => "buy",
            Response::Sell(_) => "sell",
            Response::Tick(_) => "tick",
            Response::History(_) => "history",
            Response::OpenContract(_) => "proposal_open_contract",
            Response::Balance(_) => "balance",
            Response::Transaction(_) => "transaction",
            Response::Forget(_) => "forget",
            Response::ForgetAll(_) => "forget_all",
            Response::Pong => "ping",
            Response::Empty => "error",
            Response::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    req_id: Option<u64>,
    #[serde(default)]
    msg_type: Option<String>,
    #[serde(default)]
    error: Option<VenueErrorBody>,
    #[serde(default)]
    subscription: Option<SubscriptionInfo>,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub req_id: Option<u64>,
    pub msg_type: String,
    pub error: Option<VenueErrorBody>,
    pub subscription: Option<SubscriptionInfo>,
    pub response: Response,
}

impl InboundFrame {
    /// Decode a text frame
    ///
    /// Only a malformed envelope is an error. A payload that does not match
    /// its family is kept as [`Response::Unknown`] so a waiting caller is
    /// still settled.
    pub fn decode(text: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(text)?;
        let envelope = Envelope::deserialize(&value)?;
        let msg_type = envelope.msg_type.unwrap_or_default();

        let response = if envelope.error.is_some() {
            Response::Empty
        } else {
            let body = value
                .get_mut(msg_type.as_str())
                .map(Value::take)
                .unwrap_or(Value::Null);
            decode_body(&msg_type, body)
        };

        Ok(Self {
            req_id: envelope.req_id,
            msg_type,
            error: envelope.error,
            subscription: envelope.subscription,
            response,
        })
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.id.as_str())
    }

    /// Success payload, or the echoed venue error
    pub fn into_result(self) -> Result<Response> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.response),
        }
    }
}

fn decode_body(msg_type: &str, body: Value) -> Response {
    fn typed<T: serde::de::DeserializeOwned>(
        body: Value,
        wrap: fn(T) -> Response,
    ) -> Response {
        match serde_json::from_value::<T>(body.clone()) {
            Ok(parsed) => wrap(parsed),
            Err(_) => Response::Unknown(body),
        }
    }

    match msg_type {
        "authorize" => typed(body, Response::Authorize),
        "proposal" => typed(body, Response::Proposal),
        "buy" => typed(body, Response::Buy),
        "sell" => typed(body, Response::Sell),
        "tick" => typed(body, Response::Tick),
        "history" => typed(body, Response::History),
        "proposal_open_contract" => typed(body, Response::OpenContract),
        "balance" => typed(body, Response::Balance),
        "transaction" => Response::Transaction(body),
        "forget" => Response::Forget(match &body {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
            _ => false,
        }),
        "forget_all" => typed(body, Response::ForgetAll),
        "ping" => Response::Pong,
        _ => Response::Unknown(body),
    }
}
