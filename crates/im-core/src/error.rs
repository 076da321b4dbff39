use thiserror::Error;

/// Reasons a connection request fails admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing or invalid Authorization header")]
    MissingBearer,

    #[error("token verification failed: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,

    #[error("invalid claims: {0}")]
    InvalidClaims(String),

    #[error("device id does not match token: request={requested}, token={token}")]
    DeviceMismatch { requested: String, token: String },

    #[error("secret key is not initialized")]
    MissingSecret,
}

/// Errors produced by the gateway protocol layer.
#[derive(Debug, Error)]
pub enum ImError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ImError {
    fn from(e: serde_json::Error) -> Self {
        ImError::Codec(e.to_string())
    }
}

pub type ImResult<T> = Result<T, ImError>;
