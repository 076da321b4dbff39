//! Device bind keys for enrollment.
//!
//! `hex(HMAC-SHA256(secret, "<device_id>:<user_id>:<unix_ts>"))`. The key is
//! handed to the device as an opaque provisioning artifact; the gateway
//! never verifies it.

use ring::hmac;

/// Maximum device id length in bytes.
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Derive a bind key for a device using the current time.
pub fn generate_bind_key(device_id: &str, secret: &[u8], user_id: u64) -> String {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    derive_bind_key(device_id, secret, user_id, ts)
}

/// Derive a bind key for a fixed timestamp.
pub fn derive_bind_key(device_id: &str, secret: &[u8], user_id: u64, timestamp: u64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let data = format!("{device_id}:{user_id}:{timestamp}");
    hex::encode(hmac::sign(&key, data.as_bytes()).as_ref())
}

/// Whether a device id is acceptable for binding (1–64 bytes).
pub fn validate_device_id(device_id: &str) -> bool {
    !device_id.is_empty() && device_id.len() <= MAX_DEVICE_ID_LEN
}
