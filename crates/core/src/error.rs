//! Error types for sandgate.

use thiserror::Error;

/// Result type alias using sandgate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the agent.
#[derive(Error, Debug)]
pub enum Error {
    /// An operation referenced a task id that is not in the registry.
    #[error("task not registered: {0}")]
    NotRegistered(String),

    /// A start request collided with a live task id.
    #[error("task already registered: {0}")]
    AlreadyRegistered(String),

    /// The container runtime connection or RPC failed.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The container runtime understood the request but refused it,
    /// e.g. an unknown handle or a policy rejection.
    #[error("backend rejected request: {0}")]
    BackendRejected(String),

    /// A malformed control-plane message or wire-level control request.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    /// A start request's limits failed policy validation.
    #[error("invalid task limits: {0}")]
    LimitInvalid(String),

    /// Message bus failure.
    #[error("message bus error: {0}")]
    Bus(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_registered(id: impl Into<String>) -> Self {
        Error::NotRegistered(id.into())
    }

    pub fn already_registered(id: impl Into<String>) -> Self {
        Error::AlreadyRegistered(id.into())
    }

    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Error::BackendUnavailable(msg.into())
    }

    pub fn backend_rejected(msg: impl Into<String>) -> Self {
        Error::BackendRejected(msg.into())
    }

    pub fn protocol_decode(msg: impl Into<String>) -> Self {
        Error::ProtocolDecode(msg.into())
    }

    pub fn limit_invalid(msg: impl Into<String>) -> Self {
        Error::LimitInvalid(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Error::Bus(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
