//! Wire protocol spoken over the offers WebSocket.
//!
//! Inbound frames are UTF-8 JSON envelopes `{"action": ..., "data": ...}`
//! whose `data` shape depends on the action. Outbound frames are JSON objects
//! carrying an `action` plus either a success payload (`offer`, `offers`,
//! `order_id`) or an `error` string.

mod command;
mod message;

pub use command::{
    parse_command, ClientCommand, CreateOfferPayload, OrderPayload, ProtocolError,
    UpdateOfferPayload,
};
pub use message::{Action, ServerMessage};

/// Reply for a recognized action whose payload failed to decode or validate.
pub const BAD_DATA: &str = "bad data";

/// Reply for an envelope naming an action the gateway does not know.
pub const UNKNOWN_ACTION: &str = "unknown action";

/// Reply for a frame that is not a JSON envelope at all.
pub const INVALID_FORMAT: &str = "invalid format";
