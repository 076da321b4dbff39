//! Admission controller.
//!
//! A connection request is admitted only if it carries a valid HS256 device
//! token whose `device_id` claim equals the request's `Device-Id` header.
//! This runs before the WebSocket upgrade, so rejected requests never get a
//! socket.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use im_core::envelope::headers;
use im_core::{AuthError, TokenSigner};
use std::collections::HashMap;
use tracing::{debug, info};

const BEARER_PREFIX: &str = "Bearer ";

/// Query parameter → header mappings for browser clients, which cannot set
/// custom headers on a WebSocket handshake.
const QUERY_HEADERS: &[(&str, &str)] = &[
    ("device-id", headers::DEVICE_ID),
    ("client-id", headers::CLIENT_ID),
    ("session-id", headers::SESSION_ID),
    ("transport-type", headers::TRANSPORT_TYPE),
];

/// Validates bearer credentials against the shared secret.
#[derive(Debug, Clone)]
pub struct Admission {
    signer: TokenSigner,
    skip_expiry: bool,
}

impl Admission {
    pub fn new(signer: TokenSigner) -> Self {
        Self {
            signer,
            skip_expiry: false,
        }
    }

    /// Accept tokens whose `exp` has passed. Signatures are still checked.
    pub fn skip_expiry(mut self, skip: bool) -> Self {
        self.skip_expiry = skip;
        self
    }

    /// Authenticate a connection request, returning the token's user id.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<u64, AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::MissingBearer)?;
        let claims = self.signer.verify(token, self.skip_expiry)?;

        let requested = header_str(headers, headers::DEVICE_ID);
        if requested != claims.device_id {
            return Err(AuthError::DeviceMismatch {
                requested: requested.to_string(),
                token: claims.device_id,
            });
        }

        info!(user_id = claims.user_id, device_id = %claims.device_id, "device authenticated");
        Ok(claims.user_id)
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, headers::AUTHORIZATION)
        .strip_prefix(BEARER_PREFIX)
        .filter(|t| !t.is_empty())
}

/// Copy browser query parameters into the equivalent headers.
///
/// `token=<jwt>` becomes `Authorization: Bearer <jwt>` (and `Token`).
/// Empty parameters are ignored; present ones override existing headers.
pub fn apply_query_fallback(headers: &mut HeaderMap, query: &HashMap<String, String>) {
    for (param, header) in QUERY_HEADERS {
        if let Some(value) = query.get(*param).filter(|v| !v.is_empty()) {
            set_header(headers, header, value);
        }
    }
    if let Some(token) = query.get("token").filter(|v| !v.is_empty()) {
        set_header(headers, headers::AUTHORIZATION, &format!("{BEARER_PREFIX}{token}"));
        set_header(headers, headers::TOKEN, token);
    }
}

/// Header value as a string; empty when missing or not visible ASCII.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Insert or replace a header, skipping values that are not valid header text.
pub fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => debug!(header = name, "ignoring invalid header value"),
    }
}
