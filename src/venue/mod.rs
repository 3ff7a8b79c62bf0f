//! Venue WebSocket session
//!
//! Layers, from the socket up:
//!
//! - [`connection`]: socket ownership, connection state, reconnect backoff
//! - [`messages`]: typed requests and decoded inbound frames
//! - [`correlator`]: request/response matching by `req_id`
//! - [`subscriptions`]: live server-push streams
//! - [`contracts`]: latest pushed state of purchased contracts
//! - [`session`]: the engine tying them together

pub mod connection;
pub mod contracts;
pub mod correlator;
pub mod messages;
pub mod session;
pub mod subscriptions;

pub use connection::{ConnectionManager, ReconnectPolicy};
pub use contracts::{ContractUpdate, OpenContractBook};
pub use correlator::{Reply, RequestCorrelator};
pub use messages::{
    Authorization, BuyReceipt, InboundFrame, Proposal, ProposalRequest, Request, Response,
    SellReceipt, SubscriptionKind, TickHistory,
};
pub use session::Session;
pub use subscriptions::{Subscription, SubscriptionRegistry};
