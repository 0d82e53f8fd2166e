use clap::Parser;
use offer_models::PrincipalId;
use offer_ws_server::{SessionConfig, SessionConfigError, DEFAULT_AUTH_COOKIE};
use snafu::prelude::*;
use std::{net::IpAddr, time::Duration};

pub mod server;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to initialize logger: {}", source))]
    LoggerFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("Failed to bind server"))]
    ServerBind { source: std::io::Error },

    #[snafu(display("Server failed to start"))]
    ServerStart { source: std::io::Error },

    #[snafu(display("Invalid session settings: {}", source))]
    SessionConfig { source: SessionConfigError },

    #[snafu(display("Configuration error: {}", message))]
    Configuration { message: String },

    #[snafu(display("Failed to create offer service client: {}", source))]
    OfferServiceClient {
        source: offer_service_client::BackendError,
    },

    #[snafu(display("Failed to create auth service client: {}", source))]
    AuthServiceClient { source: auth_client::AuthError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Parser, Debug, Clone)]
#[command(name = "offer-gateway")]
#[command(about = "Real-time offer negotiation gateway")]
pub struct GatewayArgs {
    /// Host to bind to
    #[arg(short = 'H', long, env = "HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(short, long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Base URL of the offer service, e.g. http://offers:9000/api/
    #[arg(long, env = "OFFER_SERVICE_URL", required_unless_present = "dev")]
    pub offer_service_url: Option<String>,

    /// Base URL of the auth service, e.g. http://auth:9001/auth/
    #[arg(long, env = "AUTH_SERVICE_URL", required_unless_present = "dev")]
    pub auth_service_url: Option<String>,

    /// Timeout for each offer/auth service call in milliseconds
    #[arg(long, env = "BACKEND_TIMEOUT_MS", default_value = "10000")]
    pub backend_timeout_ms: u64,

    /// How long a silent client is kept before disconnecting, in milliseconds
    #[arg(long, env = "PONG_WAIT_MS", default_value = "60000")]
    pub pong_wait_ms: u64,

    /// Interval between pings in milliseconds (defaults to 9/10 of the pong wait)
    #[arg(long, env = "PING_PERIOD_MS")]
    pub ping_period_ms: Option<u64>,

    /// Deadline for a single outbound write in milliseconds
    #[arg(long, env = "WRITE_WAIT_MS", default_value = "10000")]
    pub write_wait_ms: u64,

    /// Frames buffered per connection before writes start timing out
    #[arg(long, env = "OUTBOUND_BUFFER", default_value = "64")]
    pub outbound_buffer: usize,

    /// Cookie that carries the session token
    #[arg(long, env = "AUTH_COOKIE", default_value = DEFAULT_AUTH_COOKIE)]
    pub auth_cookie: String,

    /// Serve from an in-memory offer store and a static token table
    #[arg(long, env = "DEV_MODE")]
    pub dev: bool,

    /// Token accepted in dev mode, as TOKEN=PRINCIPAL (repeatable)
    #[arg(long = "dev-token", value_parser = parse_dev_token)]
    pub dev_tokens: Vec<(String, PrincipalId)>,

    /// CORS domain to allow (supports wildcards like "*.example.com")
    #[arg(long = "corsdomain", env = "CORS_DOMAIN")]
    pub cors_domain: Option<String>,
}

impl GatewayArgs {
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let pong_wait = Duration::from_millis(self.pong_wait_ms);
        let ping_period = self
            .ping_period_ms
            .map_or(pong_wait * 9 / 10, Duration::from_millis);

        SessionConfig {
            pong_wait,
            ping_period,
            write_wait: Duration::from_millis(self.write_wait_ms),
            outbound_buffer: self.outbound_buffer,
        }
    }

    #[must_use]
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

fn parse_dev_token(s: &str) -> Result<(String, PrincipalId), String> {
    let (token, principal) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TOKEN=PRINCIPAL, got '{s}'"))?;
    if token.is_empty() || principal.is_empty() {
        return Err(format!("expected TOKEN=PRINCIPAL, got '{s}'"));
    }
    Ok((token.to_string(), PrincipalId::from(principal)))
}

pub fn init_logger(log_level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .try_init()
        .context(LoggerFailedSnafu)?;

    Ok(())
}

/// Awaits the first shutdown signal (SIGTERM or SIGINT) and then returns.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install handler for SIGTERM");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to install handler for SIGINT");

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_mode_needs_no_service_urls() {
        let args = GatewayArgs::try_parse_from([
            "offer-gateway",
            "--dev",
            "--dev-token",
            "t-1=alice",
        ])
        .unwrap();

        assert!(args.dev);
        assert_eq!(
            args.dev_tokens,
            vec![("t-1".to_string(), PrincipalId::from("alice"))]
        );
        assert_eq!(args.auth_cookie, "token");
    }

    #[test]
    fn test_service_urls_required_outside_dev_mode() {
        assert!(GatewayArgs::try_parse_from(["offer-gateway"]).is_err());
        assert!(GatewayArgs::try_parse_from(["offer-gateway", "--dev-token", "nope"]).is_err());
    }

    #[test]
    fn test_session_config_from_args() {
        let args = GatewayArgs::try_parse_from([
            "offer-gateway",
            "--offer-service-url",
            "http://offers/",
            "--auth-service-url",
            "http://auth/",
            "--pong-wait-ms",
            "1000",
        ])
        .unwrap();

        let config = args.session_config();
        assert_eq!(config.pong_wait, Duration::from_secs(1));
        assert_eq!(config.ping_period, Duration::from_millis(900));
        assert!(config.validate().is_ok());

        let args = GatewayArgs {
            ping_period_ms: Some(2000),
            ..args
        };
        assert!(args.session_config().validate().is_err());
    }

    #[test]
    fn test_oversized_pong_wait_rejected() {
        let args = GatewayArgs::try_parse_from([
            "offer-gateway",
            "--dev",
            "--pong-wait-ms",
            &u64::MAX.to_string(),
        ])
        .unwrap();

        assert!(matches!(
            args.session_config().validate(),
            Err(SessionConfigError::TooLong {
                field: "pong_wait",
                ..
            })
        ));
    }
}
