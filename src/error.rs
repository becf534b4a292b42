//! # Error taxonomy
//!
//! Every fallible operation in the crate returns [`RelayError`]. The variants
//! follow the caller-visible classes of failure:
//!
//! - [`RelayError::NotFound`]: chat or model absent, or the chat belongs to
//!   someone else. Client error, never retried.
//! - [`RelayError::BadRequest`]: the request itself is unusable (blank content,
//!   unknown branch point).
//! - [`RelayError::Misconfigured`]: no usable default model. Server error.
//! - [`RelayError::ProviderUnavailable`]: the upstream connection could not be
//!   established or answered with a non-success status. Raised before any
//!   stream session starts, so nothing has been written.
//! - [`RelayError::ProviderStream`]: the upstream failed after the stream
//!   opened. Inside the relay this never crosses the streaming boundary; it is
//!   turned into a persisted placeholder plus a terminal frame.
//! - [`RelayError::Storage`] / [`RelayError::Config`]: infrastructure.
//!
//! A single malformed upstream frame is *not* an error: the frame parser
//! reports it as an event and the upstream client logs and drops it.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Misconfigured: {0}")]
    Misconfigured(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider stream error: {0}")]
    ProviderStream(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Message that is safe to hand to the calling client.
    ///
    /// Infrastructure details (SQL errors, upstream URLs) stay in the logs.
    pub fn caller_message(&self) -> String {
        match self {
            RelayError::NotFound(message) | RelayError::BadRequest(message) => message.clone(),
            RelayError::Misconfigured(_) => "The default AI model is not configured.".to_string(),
            RelayError::ProviderUnavailable(_) => "Unable to connect to the AI provider.".to_string(),
            RelayError::ProviderStream(message) => {
                format!("The AI provider failed while streaming: {message}")
            }
            RelayError::Storage(_) | RelayError::Config(_) => "Internal server error.".to_string(),
        }
    }

    /// HTTP status for the request-style transport.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::NotFound(_) => 404,
            RelayError::BadRequest(_) => 400,
            RelayError::ProviderUnavailable(_) | RelayError::ProviderStream(_) => 502,
            RelayError::Misconfigured(_) | RelayError::Storage(_) | RelayError::Config(_) => 500,
        }
    }
}

impl From<diesel::result::Error> for RelayError {
    fn from(err: diesel::result::Error) -> Self {
        RelayError::Storage(err.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for RelayError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        RelayError::Storage(format!("connection pool: {err}"))
    }
}
