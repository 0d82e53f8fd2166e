//! WebSocket session lifecycle
//!
//! `connecting -> authenticating -> serving -> closing -> closed`. A session
//! that fails authentication goes straight from `authenticating` to
//! `closing` and never reads a command frame.

use crate::{
    dispatcher::Dispatcher,
    registry::SubscriptionRegistry,
    sender::{write_loop, ConnectionSender},
};
use auth_client::{AuthError, AuthValidator};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{stream::SplitStream, StreamExt};
use offer_models::{ConnectionId, PrincipalId};
use offer_protocol::{ServerMessage, INVALID_FORMAT};
use snafu::prelude::*;
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    task::{AbortHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum SessionConfigError {
    #[snafu(display(
        "ping period {:?} must be shorter than the pong wait {:?}",
        ping_period,
        pong_wait
    ))]
    PingPeriodTooLong {
        ping_period: Duration,
        pong_wait: Duration,
    },

    #[snafu(display("{} must be greater than zero", field))]
    Zero { field: &'static str },

    #[snafu(display("{} must be at most {:?}", field, max))]
    TooLong { field: &'static str, max: Duration },
}

/// Upper bound for every session timing; deadlines are computed as
/// `Instant::now() + duration` and must not overflow.
pub const MAX_SESSION_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Liveness and back-pressure settings applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long the peer may stay silent before the session is closed
    pub pong_wait: Duration,
    /// Interval between liveness probes
    pub ping_period: Duration,
    /// Upper bound for queueing or writing a single outbound frame
    pub write_wait: Duration,
    /// Capacity of the per-connection outbound queue
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            outbound_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionConfigError> {
        ensure!(!self.pong_wait.is_zero(), ZeroSnafu { field: "pong_wait" });
        ensure!(!self.ping_period.is_zero(), ZeroSnafu { field: "ping_period" });
        ensure!(!self.write_wait.is_zero(), ZeroSnafu { field: "write_wait" });
        ensure!(self.outbound_buffer > 0, ZeroSnafu { field: "outbound_buffer" });
        for (field, value) in [
            ("pong_wait", self.pong_wait),
            ("ping_period", self.ping_period),
            ("write_wait", self.write_wait),
        ] {
            ensure!(
                value <= MAX_SESSION_DURATION,
                TooLongSnafu {
                    field,
                    max: MAX_SESSION_DURATION,
                }
            );
        }
        ensure!(
            self.ping_period < self.pong_wait,
            PingPeriodTooLongSnafu {
                ping_period: self.ping_period,
                pong_wait: self.pong_wait,
            }
        );
        Ok(())
    }
}

/// Everything a session needs, shared across all connections.
pub struct SessionContext {
    pub registry: Arc<SubscriptionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub auth: Arc<dyn AuthValidator>,
    pub config: SessionConfig,
    live_connections: AtomicUsize,
}

impl SessionContext {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<Dispatcher>,
        auth: Arc<dyn AuthValidator>,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            auth,
            config,
            live_connections: AtomicUsize::new(0),
        }
    }

    /// Sessions currently in the serving state.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Authenticating,
    Serving,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    MissingCredential,
    Unauthorized,
    AuthUnavailable,
    ClientClosed,
    StreamEnded,
    ReadError(String),
    LivenessTimeout,
    WriterStopped,
}

impl CloseReason {
    /// Close frame to send, if the stream is still writable.
    #[must_use]
    pub fn close_frame(&self) -> Option<(u16, &'static str)> {
        match self {
            Self::MissingCredential => Some((close_code::POLICY, "no auth")),
            Self::Unauthorized => Some((close_code::POLICY, "unauthorized")),
            Self::AuthUnavailable => Some((close_code::ERROR, "auth unavailable")),
            Self::LivenessTimeout => Some((close_code::AWAY, "liveness timeout")),
            Self::ClientClosed | Self::StreamEnded | Self::ReadError(_) | Self::WriterStopped => {
                None
            }
        }
    }
}

/// Releases a serving session's resources exactly once, in order: stop the
/// pinger, drop every subscription, then give up the live-connection slot.
/// Runs from `Drop` too, so a cancelled session cannot leak subscriptions.
struct Teardown {
    connection_id: ConnectionId,
    context: Arc<SessionContext>,
    pinger: AbortHandle,
    released: bool,
}

impl Teardown {
    fn new(connection_id: ConnectionId, context: Arc<SessionContext>, pinger: AbortHandle) -> Self {
        context.live_connections.fetch_add(1, Ordering::Relaxed);
        Self {
            connection_id,
            context,
            pinger,
            released: false,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.pinger.abort();
        let orders = self.context.registry.unsubscribe_all(self.connection_id);
        self.context.live_connections.fetch_sub(1, Ordering::Relaxed);

        debug!(
            connection_id = %self.connection_id,
            orders,
            "Session resources released"
        );
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct Session {
    id: ConnectionId,
    state: SessionState,
    context: Arc<SessionContext>,
}

impl Session {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            id: ConnectionId::new(),
            state: SessionState::Connecting,
            context,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Drive an upgraded socket until it closes.
    ///
    /// `credential` is the token taken from the handshake, if any.
    pub async fn run(mut self, mut socket: WebSocket, credential: Option<String>) -> CloseReason {
        self.transition(SessionState::Authenticating);

        let principal = match self.authenticate(credential).await {
            Ok(principal) => principal,
            Err(reason) => {
                self.transition(SessionState::Closing);
                self.reject(&mut socket, &reason).await;
                self.transition(SessionState::Closed);
                return reason;
            }
        };

        info!(
            connection_id = %self.id,
            principal = %principal,
            "Offer WebSocket connection established"
        );
        self.transition(SessionState::Serving);

        let config = self.context.config;
        let (sink, mut stream) = socket.split();
        let (sender, outgoing_rx) =
            ConnectionSender::channel(self.id, config.outbound_buffer, config.write_wait);

        let mut tasks = JoinSet::new();
        tasks.spawn(write_loop(sink, outgoing_rx, self.id, config.write_wait));
        let pinger = tasks.spawn(ping_loop(sender.clone(), config.ping_period));
        let mut teardown = Teardown::new(self.id, self.context.clone(), pinger);

        let reason = self.serve(&principal, &sender, &mut stream, &mut tasks).await;

        self.transition(SessionState::Closing);
        teardown.release();

        if let Some((code, text)) = reason.close_frame() {
            if let Err(e) = sender.close(code, text).await {
                debug!(connection_id = %self.id, error = %e, "Could not queue close frame");
            }
        }
        drop(sender);

        let drained = tokio::time::timeout(config.write_wait, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tasks.shutdown().await;
        }

        self.transition(SessionState::Closed);
        info!(
            connection_id = %self.id,
            principal = %principal,
            reason = ?reason,
            "Offer WebSocket connection closed"
        );
        reason
    }

    async fn authenticate(&self, credential: Option<String>) -> Result<PrincipalId, CloseReason> {
        let Some(token) = credential else {
            warn!(connection_id = %self.id, "Rejecting connection without credential");
            return Err(CloseReason::MissingCredential);
        };

        self.context.auth.validate(&token).await.map_err(|e| {
            warn!(connection_id = %self.id, error = %e, "Authentication failed");
            match e {
                AuthError::MissingCredential => CloseReason::MissingCredential,
                AuthError::Rejected { .. } => CloseReason::Unauthorized,
                AuthError::Unavailable { .. } => CloseReason::AuthUnavailable,
            }
        })
    }

    async fn reject(&self, socket: &mut WebSocket, reason: &CloseReason) {
        let Some((code, text)) = reason.close_frame() else {
            return;
        };
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(text),
        }));

        let write_wait = self.context.config.write_wait;
        if tokio::time::timeout(write_wait, socket.send(frame))
            .await
            .map_or(true, |sent| sent.is_err())
        {
            debug!(connection_id = %self.id, "Could not deliver close frame");
        }
    }

    /// Read and dispatch frames one at a time until the connection ends.
    async fn serve(
        &self,
        principal: &PrincipalId,
        sender: &ConnectionSender,
        stream: &mut SplitStream<WebSocket>,
        tasks: &mut JoinSet<()>,
    ) -> CloseReason {
        let pong_wait = self.context.config.pong_wait;
        let mut deadline = Instant::now() + pong_wait;

        loop {
            tokio::select! {
                Some(result) = tasks.join_next() => {
                    if let Err(e) = result {
                        warn!(connection_id = %self.id, error = %e, "Background task failed");
                    } else {
                        warn!(connection_id = %self.id, "Background task exited, closing connection");
                    }
                    return CloseReason::WriterStopped;
                }
                next = tokio::time::timeout_at(deadline, stream.next()) => {
                    let message = match next {
                        Err(_) => {
                            warn!(connection_id = %self.id, "Peer missed liveness deadline");
                            return CloseReason::LivenessTimeout;
                        }
                        Ok(None) => return CloseReason::StreamEnded,
                        Ok(Some(Err(e))) => {
                            warn!(connection_id = %self.id, error = %e, "WebSocket read failed");
                            return CloseReason::ReadError(e.to_string());
                        }
                        Ok(Some(Ok(message))) => message,
                    };

                    // Any traffic from the peer proves it is alive.
                    deadline = Instant::now() + pong_wait;

                    let reply = match message {
                        Message::Text(text) => {
                            self.context.dispatcher.dispatch(principal, sender, &text).await
                        }
                        Message::Binary(_) => ServerMessage::error(INVALID_FORMAT),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            info!(connection_id = %self.id, "Client closed connection");
                            return CloseReason::ClientClosed;
                        }
                    };

                    if let Err(e) = sender.send(&reply).await {
                        warn!(connection_id = %self.id, error = %e, "Failed to queue reply");
                        return CloseReason::WriterStopped;
                    }
                }
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            connection_id = %self.id,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }
}

/// Emit a liveness probe every `period` until the outbound queue rejects one.
async fn ping_loop(sender: ConnectionSender, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(e) = sender.ping().await {
            debug!(connection_id = %sender.connection_id(), error = %e, "Pinger stopped");
            return;
        }
    }
}
