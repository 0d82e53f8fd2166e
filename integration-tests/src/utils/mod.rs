use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use auth_client::StaticTokenValidator;
use ctor::ctor;
use futures_util::{SinkExt, StreamExt};
use offer_gateway::{
    init_logger,
    server::{build_router, AppState},
    GatewayArgs,
};
use offer_models::OrderId;
use offer_service_client::InMemoryOfferBackend;
use offer_ws_server::{SessionConfig, SubscriptionRegistry, DEFAULT_AUTH_COOKIE};
use serde_json::Value;
use tokio::{net::TcpListener, net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        protocol::CloseFrame,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::info;

pub const INTEGRATION_TEST_TIMEOUT_SECS: u64 = 10;

pub const ALICE_TOKEN: &str = "alice-token";
pub const BOB_TOKEN: &str = "bob-token";

pub type TestSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn get_free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("Should be able to bind to port");

    listener
        .local_addr()
        .expect("Should have a local address")
        .port()
}

/// Short timings so liveness can be observed within a test run.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        pong_wait: Duration::from_millis(400),
        ping_period: Duration::from_millis(150),
        write_wait: Duration::from_millis(500),
        outbound_buffer: 16,
    }
}

/// A gateway served in-process from an in-memory offer store.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: AppState,
    pub backend: Arc<InMemoryOfferBackend>,
    handle: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start() -> Self {
        Self::start_with(SessionConfig::default()).await
    }

    pub async fn start_with(config: SessionConfig) -> Self {
        let backend = Arc::new(InMemoryOfferBackend::new());
        let auth = Arc::new(
            StaticTokenValidator::default()
                .with_token(ALICE_TOKEN, "alice")
                .with_token(BOB_TOKEN, "bob"),
        );
        let state = AppState::new(backend.clone(), auth, config, DEFAULT_AUTH_COOKIE);

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("Should be able to bind to port");
        let addr = listener.local_addr().expect("Should have a local address");
        let app = build_router(state.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("Gateway should not crash");
        });
        info!("Test gateway listening on {}", addr);

        Self {
            addr,
            state,
            backend,
            handle,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.state.registry()
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/ws/offers", self.addr)
    }

    /// Open a socket that presents `token` in the session cookie.
    pub async fn connect(&self, token: &str) -> TestSocket {
        let mut request = self
            .ws_url()
            .into_client_request()
            .expect("Should build client request");
        request.headers_mut().insert(
            COOKIE,
            HeaderValue::from_str(&format!("{DEFAULT_AUTH_COOKIE}={token}"))
                .expect("Should be a valid header"),
        );

        let (socket, _) = connect_async(request)
            .await
            .expect("Upgrade should succeed");
        socket
    }

    pub async fn connect_anonymous(&self) -> TestSocket {
        let (socket, _) = connect_async(self.ws_url())
            .await
            .expect("Upgrade should succeed");
        socket
    }

    /// Connect and subscribe to `order_id`, consuming the acknowledgement.
    pub async fn subscriber(&self, token: &str, order_id: &str) -> TestSocket {
        let mut socket = self.connect(token).await;
        send_json(
            &mut socket,
            serde_json::json!({"action": "subscribe", "data": {"order_id": order_id}}),
        )
        .await;
        let ack = recv_json(&mut socket).await;
        assert_eq!(ack["action"], "subscribe");
        assert_eq!(ack["order_id"], order_id);
        socket
    }

    /// Wait until the registry reports `expected` watchers for the order.
    pub async fn wait_for_subscribers(&self, order_id: &str, expected: usize) {
        let order_id = OrderId::from(order_id);
        let timeout = Duration::from_secs(INTEGRATION_TEST_TIMEOUT_SECS);
        let start = Instant::now();

        while self.registry().subscriber_count(&order_id) != expected {
            assert!(
                start.elapsed() <= timeout,
                "Timeout waiting for {expected} subscribers on {order_id}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn send_json(socket: &mut TestSocket, value: Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("Should send frame");
}

/// Next data frame as JSON. Control frames are skipped.
pub async fn recv_json(socket: &mut TestSocket) -> Value {
    let timeout = Duration::from_secs(INTEGRATION_TEST_TIMEOUT_SECS);
    loop {
        let message = tokio::time::timeout(timeout, socket.next())
            .await
            .expect("Timeout waiting for frame")
            .expect("Stream ended")
            .expect("Read failed");

        match message {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Frame should be JSON");
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text frame, got {other:?}"),
        }
    }
}

/// Assert that no data frame arrives within `window`.
pub async fn assert_silent(socket: &mut TestSocket, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, socket.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("Expected no frame, got {other:?}"),
        }
    }
}

/// Read until the server's close frame arrives; fails on any data frame.
pub async fn expect_close(socket: &mut TestSocket) -> Option<CloseFrame<'static>> {
    let timeout = Duration::from_secs(INTEGRATION_TEST_TIMEOUT_SECS);
    loop {
        let message = tokio::time::timeout(timeout, socket.next())
            .await
            .expect("Timeout waiting for close frame");

        match message {
            Some(Ok(Message::Close(frame))) => return frame.map(CloseFrame::into_owned),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("Expected close frame, got {other:?}"),
            Some(Err(e)) => panic!("Read failed before close frame: {e}"),
            None => return None,
        }
    }
}

pub fn build_gateway_test_args(port: u16) -> GatewayArgs {
    use clap::Parser;

    GatewayArgs::parse_from([
        "offer-gateway",
        "--port",
        &port.to_string(),
        "--dev",
        "--dev-token",
        &format!("{ALICE_TOKEN}=alice"),
        "--dev-token",
        &format!("{BOB_TOKEN}=bob"),
    ])
}

pub async fn wait_for_gateway_to_be_ready(port: u16) {
    // Hit the gateway status endpoint every 100ms until it returns 200
    let client = reqwest::Client::new();
    let status_url = format!("http://127.0.0.1:{port}/status");

    let start_time = Instant::now();
    let timeout = Duration::from_secs(INTEGRATION_TEST_TIMEOUT_SECS);

    loop {
        assert!(
            start_time.elapsed() <= timeout,
            "Timeout waiting for offer gateway to become ready"
        );

        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Ok(response) = client.get(&status_url).send().await {
            if response.status().is_success() {
                return;
            }
        }
    }
}

#[ctor]
fn init_test_tracing() {
    let has_nocapture = std::env::args().any(|arg| arg == "--nocapture" || arg == "--show-output");
    if has_nocapture {
        init_logger("info,offer_gateway=debug,offer_ws_server=debug").expect("Logger should initialize");
    }
}
