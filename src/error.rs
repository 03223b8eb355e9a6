//! Error handling for the dispatcher.

use std::fmt;

/// Convenience alias used throughout the crate.
pub type DispatcherResult<T> = Result<T, DispatcherError>;

/// Errors that can occur while coordinating outbound requests.
#[derive(Debug, Clone)]
pub enum DispatcherError {
    /// `handle_request` was called on an instance that never started
    NotStarted,
    /// No client registered under the requested name
    UnknownClient(String),
    /// A client with this name already exists on this instance
    DuplicateClient(String),
    /// A client specification failed validation
    InvalidSpec(String),
    /// Redis connection or command error
    Redis(String),
    /// Serialization/deserialization error
    Serialization(String),
    /// Token cache encryption or decryption failure
    Crypto(String),
    /// OAuth2 token refresh failed
    AuthRefresh(String),
    /// The request was dropped before admission (originator gave up or
    /// its heartbeat lapsed on the controller)
    RequestAbandoned(String),
    /// The upstream answered with a non-success status and retries ran out
    HttpStatus { status: u16, body: String },
    /// Transport-level failure talking to the upstream
    Network(String),
}

impl fmt::Display for DispatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatcherError::NotStarted => write!(f, "dispatcher has not been started"),
            DispatcherError::UnknownClient(name) => write!(f, "unknown client: {}", name),
            DispatcherError::DuplicateClient(name) => {
                write!(f, "client already exists: {}", name)
            }
            DispatcherError::InvalidSpec(msg) => write!(f, "invalid client spec: {}", msg),
            DispatcherError::Redis(msg) => write!(f, "Redis error: {}", msg),
            DispatcherError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            DispatcherError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            DispatcherError::AuthRefresh(msg) => write!(f, "Auth refresh failed: {}", msg),
            DispatcherError::RequestAbandoned(id) => {
                write!(f, "request {} was abandoned before completion", id)
            }
            DispatcherError::HttpStatus { status, body } => {
                write!(f, "upstream responded with status {}: {}", status, body)
            }
            DispatcherError::Network(msg) => write!(f, "network error: {}", msg),
        }
    }
}

impl std::error::Error for DispatcherError {}

impl From<redis::RedisError> for DispatcherError {
    fn from(error: redis::RedisError) -> Self {
        DispatcherError::Redis(error.to_string())
    }
}

impl From<serde_json::Error> for DispatcherError {
    fn from(error: serde_json::Error) -> Self {
        DispatcherError::Serialization(error.to_string())
    }
}

impl From<reqwest::Error> for DispatcherError {
    fn from(error: reqwest::Error) -> Self {
        DispatcherError::Network(error.to_string())
    }
}
