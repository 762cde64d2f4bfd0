//! Error types for agentrelay.

use thiserror::Error;

use crate::protocol::AgentId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No codec registered for message type '{0}'")]
    UnregisteredType(String),

    #[error("Malformed payload for '{type_name}': {reason}")]
    MalformedPayload { type_name: String, reason: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Agent type '{0}' is already registered")]
    DuplicateAgentType(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request {0} timed out")]
    RequestTimeout(String),

    #[error("Correlation id '{0}' already has a pending request")]
    DuplicateCorrelation(String),

    #[error("Destination unreachable: {destination} ({reason})")]
    DestinationUnreachable { destination: AgentId, reason: String },

    #[error("Runtime not started")]
    NotStarted,

    #[error("Runtime is shutting down")]
    Shutdown,

    #[error("Request {0} was cancelled")]
    Cancelled(String),

    #[error("Handler failed: {0}")]
    HandlerExecution(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn malformed(type_name: impl Into<String>, reason: impl ToString) -> Self {
        Error::MalformedPayload {
            type_name: type_name.into(),
            reason: reason.to_string(),
        }
    }
}
