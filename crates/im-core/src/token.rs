//! Device tokens: HS256 JWTs binding a user to a device.
//!
//! Claims: `{ "user_id": u64, "device_id": string, "exp": unix, "iat": unix }`.
//! Only HMAC-SHA256 is accepted on verification.

use crate::error::{AuthError, ImError, ImResult};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Claims carried by a device token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub device_id: String,
    pub user_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Claims carried by a user token presented to the device bind API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaims {
    pub user_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Signs and verifies tokens with a shared symmetric secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issue a device token valid for `ttl_secs` from now.
    pub fn issue(&self, user_id: u64, device_id: &str, ttl_secs: u64) -> ImResult<String> {
        let now = now_secs();
        let claims = Claims {
            device_id: device_id.to_string(),
            user_id,
            exp: Some(now + ttl_secs as i64),
            iat: Some(now),
        };
        self.sign(&claims)
    }

    /// Sign an arbitrary claim set.
    pub fn sign<T: Serialize>(&self, claims: &T) -> ImResult<String> {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| ImError::Codec(format!("failed to sign token: {e}")))
    }

    /// Verify a device token and return its claims.
    ///
    /// With `skip_expiry` the signature is still checked but a past `exp`
    /// is accepted.
    pub fn verify(&self, token: &str, skip_expiry: bool) -> Result<Claims, AuthError> {
        self.decode(token, skip_expiry)
    }

    /// Verify a user token (bind API) and return its user id.
    pub fn verify_user(&self, token: &str) -> Result<u64, AuthError> {
        let claims: UserClaims = self.decode(token, false)?;
        Ok(claims.user_id)
    }

    fn decode<T: DeserializeOwned>(&self, token: &str, skip_expiry: bool) -> Result<T, AuthError> {
        if self.secret.is_empty() {
            return Err(AuthError::MissingSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.required_spec_claims.clear();
        validation.validate_exp = !skip_expiry;

        jsonwebtoken::decode::<T>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::Json(inner) => AuthError::InvalidClaims(inner.to_string()),
                _ => AuthError::InvalidToken(e.to_string()),
            })
    }
}

fn now_secs() -> i64 {
    jsonwebtoken::get_current_timestamp() as i64
}
