//! Real-time offer channel over WebSocket
//!
//! This crate provides the connection-side machinery of the offer gateway:
//!
//! - `SubscriptionRegistry`: which connections watch which orders, and
//!   best-effort fan-out of offer events to them
//! - `ConnectionSender`: the single-writer outbound queue of a connection
//! - `Dispatcher`: turns command frames into offer service calls, replies
//!   and broadcasts
//! - `Session`: authenticate, keep alive, read/dispatch, tear down
//!
//! The HTTP surface (routing, upgrade) lives in the gateway binary.

pub mod auth;
pub mod dispatcher;
pub mod registry;
pub mod sender;
pub mod session;

pub use auth::{extract_credential, DEFAULT_AUTH_COOKIE};
pub use dispatcher::Dispatcher;
pub use registry::{BroadcastReport, SubscriptionRegistry};
pub use sender::{ConnectionSender, Outbound, SendError};
pub use session::{
    CloseReason, Session, SessionConfig, SessionConfigError, SessionContext,
    MAX_SESSION_DURATION,
};

/// Re-export common types
pub use axum::extract::ws::{Message, WebSocket};
