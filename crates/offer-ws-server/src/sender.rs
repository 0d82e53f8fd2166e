//! Outbound side of a connection.
//!
//! Every write to a socket goes through that connection's bounded queue and is
//! performed by a single writer task, so the reply path, the keep-alive pinger
//! and broadcasts from other connections never write to the stream
//! concurrently.

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use offer_models::ConnectionId;
use serde::Serialize;
use snafu::prelude::*;
use std::{borrow::Cow, time::Duration};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, warn};

/// Error types for queueing outbound frames
#[derive(Debug, Snafu)]
pub enum SendError {
    #[snafu(display("Failed to serialize message: {}", source))]
    Serialization { source: serde_json::Error },

    #[snafu(display("Failed to send message: channel closed"))]
    ChannelClosed,

    #[snafu(display("Failed to send message: write deadline of {:?} exceeded", deadline))]
    WriteTimeout { deadline: Duration },
}

pub type Result<T, E = SendError> = std::result::Result<T, E>;

/// A frame waiting to be written by the connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    /// Write a close frame and stop the writer
    Close { code: u16, reason: Cow<'static, str> },
}

/// Cloneable handle for queueing frames to one connection.
///
/// The registry keeps one of these per subscription as its membership
/// record; it never touches the socket itself.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    write_wait: Duration,
}

impl ConnectionSender {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<Outbound>, write_wait: Duration) -> Self {
        Self {
            connection_id,
            tx,
            write_wait,
        }
    }

    /// Create a sender together with the receiving end of its queue.
    pub fn channel(
        connection_id: ConnectionId,
        capacity: usize,
        write_wait: Duration,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(connection_id, tx, write_wait), rx)
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Serialize `message` to JSON and queue it.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message).context(SerializationSnafu)?;
        self.send_json(json).await
    }

    /// Queue a pre-serialized JSON string.
    pub async fn send_json(&self, json: String) -> Result<()> {
        self.enqueue(Outbound::Text(json)).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.enqueue(Outbound::Ping).await
    }

    pub async fn close(&self, code: u16, reason: impl Into<Cow<'static, str>>) -> Result<()> {
        self.enqueue(Outbound::Close {
            code,
            reason: reason.into(),
        })
        .await
    }

    /// A full queue means the peer is not draining; give up after the write
    /// deadline instead of waiting forever.
    async fn enqueue(&self, frame: Outbound) -> Result<()> {
        self.tx
            .send_timeout(frame, self.write_wait)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendError::WriteTimeout {
                    deadline: self.write_wait,
                },
                SendTimeoutError::Closed(_) => SendError::ChannelClosed,
            })
    }
}

impl From<Outbound> for Message {
    fn from(frame: Outbound) -> Self {
        match frame {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Close { code, reason } => Message::Close(Some(CloseFrame { code, reason })),
        }
    }
}

/// Drain the queue into the socket until the queue closes, a close frame is
/// written, or a write fails or exceeds `write_wait`.
pub async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    connection_id: ConnectionId,
    write_wait: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, Outbound::Close { .. });

        match tokio::time::timeout(write_wait, sink.send(frame.into())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(connection_id = %connection_id, error = %e, "Socket write failed");
                return;
            }
            Err(_) => {
                warn!(connection_id = %connection_id, "Socket write exceeded deadline");
                return;
            }
        }

        if closing {
            break;
        }
    }

    let _ = tokio::time::timeout(write_wait, sink.close()).await;
    debug!(connection_id = %connection_id, "Socket writer task exited");
}
