//! im-core: shared protocol library for the IM gateway.
//!
//! Provides the bus envelope types and their JSON codec, device token
//! signing/verification, device bind-key derivation, and the error types
//! shared by the server.

pub mod bindkey;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod token;

// Re-export commonly used items at crate root.
pub use bindkey::{generate_bind_key, validate_device_id};
pub use codec::{decode_envelope, encode_envelope};
pub use envelope::{Envelope, EventType, FrameKind};
pub use error::{AuthError, ImError, ImResult};
pub use token::{Claims, TokenSigner, UserClaims};
