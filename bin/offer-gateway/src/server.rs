use crate::{
    shutdown_signal, AuthServiceClientSnafu, ConfigurationSnafu, GatewayArgs,
    OfferServiceClientSnafu, Result, ServerBindSnafu, ServerStartSnafu, SessionConfigSnafu,
};
use auth_client::{AuthServiceClient, AuthValidator, StaticTokenValidator};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use offer_service_client::{InMemoryOfferBackend, OfferBackend, OfferServiceClient};
use offer_ws_server::{
    extract_credential, Dispatcher, Session, SessionConfig, SessionContext, SubscriptionRegistry,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionContext>,
    pub auth_cookie: Arc<str>,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn OfferBackend>,
        auth: Arc<dyn AuthValidator>,
        config: SessionConfig,
        auth_cookie: impl Into<Arc<str>>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), backend));

        Self {
            sessions: Arc::new(SessionContext::new(registry, dispatcher, auth, config)),
            auth_cookie: auth_cookie.into(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.sessions.registry
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Status {
    pub status: String,
    pub version: String,
    pub connections: usize,
    pub watched_orders: usize,
}

pub async fn run_server(args: GatewayArgs) -> Result<()> {
    info!("Starting offer gateway...");
    let addr = SocketAddr::from((args.host, args.port));

    let config = args.session_config();
    config.validate().context(SessionConfigSnafu)?;

    let (backend, auth) = build_services(&args)?;
    let state = AppState::new(backend, auth, config, args.auth_cookie.as_str());

    let mut app = build_router(state);
    if let Some(ref cors_domain) = args.cors_domain {
        app = app.layer(cors_layer(cors_domain));
        info!("CORS enabled for domain: {}", cors_domain);
    }

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(ServerBindSnafu)?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context(ServerStartSnafu)?;

    info!("Offer gateway stopped");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/status", get(status_handler))
        // WebSocket endpoint for offer negotiation
        .route("/api/ws/offers", get(offers_websocket_handler))
        .with_state(state)
}

fn build_services(args: &GatewayArgs) -> Result<(Arc<dyn OfferBackend>, Arc<dyn AuthValidator>)> {
    if args.dev {
        warn!(
            tokens = args.dev_tokens.len(),
            "Dev mode: offers are kept in memory and only static tokens are accepted"
        );
        let backend: Arc<dyn OfferBackend> = Arc::new(InMemoryOfferBackend::new());
        let auth: Arc<dyn AuthValidator> =
            Arc::new(StaticTokenValidator::new(args.dev_tokens.iter().cloned()));
        return Ok((backend, auth));
    }

    let offer_url = args
        .offer_service_url
        .as_deref()
        .context(ConfigurationSnafu {
            message: "OFFER_SERVICE_URL is required",
        })?;
    let auth_url = args
        .auth_service_url
        .as_deref()
        .context(ConfigurationSnafu {
            message: "AUTH_SERVICE_URL is required",
        })?;

    let backend: Arc<dyn OfferBackend> = Arc::new(
        OfferServiceClient::new(offer_url, args.backend_timeout())
            .context(OfferServiceClientSnafu)?,
    );
    let auth: Arc<dyn AuthValidator> = Arc::new(
        AuthServiceClient::new(auth_url, args.backend_timeout())
            .context(AuthServiceClientSnafu)?,
    );

    Ok((backend, auth))
}

fn cors_layer(cors_domain_pattern: &str) -> CorsLayer {
    let cors_domain = cors_domain_pattern.to_string();
    if cors_domain == "*" {
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any);
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _request_parts| {
            let origin_str = origin.to_str().unwrap_or("");
            origin_matches(&cors_domain, origin_str)
        }))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

fn origin_matches(pattern: &str, origin: &str) -> bool {
    if !pattern.contains('*') {
        return origin == pattern;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if !suffix.contains('*') {
            return origin.ends_with(suffix);
        }
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if !prefix.contains('*') {
            return origin.starts_with(prefix);
        }
    }
    // Middle wildcards like "*.example.*"
    pattern
        .split('*')
        .filter(|part| !part.is_empty())
        .all(|part| origin.contains(part))
}

async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(Status {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: state.sessions.live_connections(),
        watched_orders: state.registry().order_count(),
    })
}

/// Upgrade first, authenticate afterwards: a bad or missing credential is
/// answered with a policy-violation close frame on the socket itself.
async fn offers_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let credential = extract_credential(&headers, &state.auth_cookie);
    let context = state.sessions.clone();

    ws.on_upgrade(move |socket| async move {
        Session::new(context).run(socket, credential).await;
    })
}
