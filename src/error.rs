//! Error types for the route-auth gateway

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (malformed snapshot, missing required value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mandatory routing metadata missing or unusable
    #[error("Routing error: {0}")]
    Routing(String),

    /// Destination request failed at the transport layer
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Authentication provider could not be reached or configured
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Resolved identity cannot be carried in an HTTP header
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Request body exceeds `server.max_body_size`
    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    /// Request body could not be read
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status reported to the caller when this error ends a request
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
