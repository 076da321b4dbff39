//! Device enrollment: `POST /api/device/bind`.
//!
//! A logged-in user presents a user token and a device id and gets back a
//! bind key plus a device token for that device. The device token is what the
//! device later presents at admission.

use crate::auth::bearer_token;
use axum::http::{HeaderMap, StatusCode};
use im_core::{generate_bind_key, validate_device_id, AuthError, TokenSigner};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BindResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            device_key: None,
            token: None,
            error: Some(error.into()),
        }
    }
}

/// Issue a bind key and device token for `request.device_id`.
pub fn bind(
    signer: &TokenSigner,
    secret: &[u8],
    ttl_secs: u64,
    headers: &HeaderMap,
    request: &BindRequest,
) -> (StatusCode, BindResponse) {
    let user_id = match bearer_token(headers)
        .ok_or(AuthError::MissingBearer)
        .and_then(|token| signer.verify_user(token))
    {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "device bind rejected");
            return (
                StatusCode::UNAUTHORIZED,
                BindResponse::failure(format!("Unauthorized: {e}")),
            );
        }
    };

    if !validate_device_id(&request.device_id) {
        return (
            StatusCode::BAD_REQUEST,
            BindResponse::failure("device_id must be 1-64 bytes"),
        );
    }

    let token = match signer.issue(user_id, &request.device_id, ttl_secs) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "issuing device token failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                BindResponse::failure("failed to issue device token"),
            );
        }
    };

    info!(user_id, device_id = %request.device_id, "device bound");
    (
        StatusCode::OK,
        BindResponse {
            success: true,
            device_key: Some(generate_bind_key(&request.device_id, secret, user_id)),
            token: Some(token),
            error: None,
        },
    )
}
