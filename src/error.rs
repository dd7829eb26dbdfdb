// Error handling module
// Defines the typed failures of the token lifecycle, the grant client and the store

use std::path::PathBuf;
use thiserror::Error;

use crate::auth::GrantStage;

/// Errors surfaced to callers of `TokenManager::get_access_token`
#[derive(Error, Debug)]
pub enum AuthError {
    /// The authorization server rejected the grant
    #[error("{stage} grant rejected: {status} - {body}")]
    Authentication {
        stage: GrantStage,
        status: u16,
        body: String,
    },

    /// The authorization server was unreachable or answered unexpectedly
    #[error("{stage} grant transport failure: {message}")]
    Transport { stage: GrantStage, message: String },

    /// No credential source could supply what the grant needs
    #[error("Credentials unavailable for {stage} grant: {message}")]
    Credentials { stage: GrantStage, message: String },
}

impl AuthError {
    /// Stage of the lifecycle that failed
    pub fn stage(&self) -> GrantStage {
        match self {
            AuthError::Authentication { stage, .. }
            | AuthError::Transport { stage, .. }
            | AuthError::Credentials { stage, .. } => *stage,
        }
    }
}

/// Outcome of a single grant request that did not yield a token
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GrantError {
    /// HTTP 400 carrying `invalid_grant`: expired or revoked refresh token, bad credentials
    #[error("invalid grant: {status} - {body}")]
    InvalidGrant { status: u16, body: String },

    /// Any other non-success status
    #[error("unexpected status: {status} - {body}")]
    Rejected { status: u16, body: String },

    /// Connection, TLS or timeout failure before a response arrived
    #[error("request failed: {0}")]
    Network(String),

    /// Success status with a body that is not a complete token response
    #[error("malformed token response: {0}")]
    Decode(String),
}

/// Failures while persisting a token record
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("token file I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize token record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type alias for token lifecycle operations
pub type Result<T> = std::result::Result<T, AuthError>;
