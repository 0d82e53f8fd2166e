//! Credential extraction from the WebSocket handshake.

use axum::http::{header, HeaderMap};

/// Cookie carrying the session token unless configured otherwise.
pub const DEFAULT_AUTH_COOKIE: &str = "token";

/// Pull the session token out of the upgrade request.
///
/// Looks for the `cookie_name` cookie first, then an `Authorization: Bearer`
/// header. Returns `None` when neither carries a non-empty value.
pub fn extract_credential(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    cookie_value(headers, cookie_name).or_else(|| bearer_token(headers))
}

fn cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}
