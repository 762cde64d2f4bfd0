//! Message envelopes with correlation IDs for request/response routing.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::identity::AgentId;
use crate::error::Error;

/// Content type of every payload produced by the JSON codec.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Type name carried by acknowledgement envelopes.
pub const ACK_TYPE_NAME: &str = "Ack";

/// Type name carried by fault envelopes.
pub const FAULT_TYPE_NAME: &str = "Fault";

/// Role of an envelope in a request/response exchange.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Request expecting a response
    Request,
    /// Typed response produced by a handler
    Response,
    /// Handler finished without producing a value
    Ack,
    /// Dispatch or handler failure on the receiving side
    Fault,
}

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    UnregisteredType,
    MalformedPayload,
    UnknownAgent,
    HandlerExecution,
}

/// Error description carried by a fault envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fault {
    pub code: FaultCode,
    pub message: String,
}

impl Fault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Describe a dispatch error for the requester.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::UnregisteredType(_) => Self::new(FaultCode::UnregisteredType, error.to_string()),
            Error::MalformedPayload { reason, .. } => {
                Self::new(FaultCode::MalformedPayload, reason.clone())
            }
            Error::UnknownAgent(_) => Self::new(FaultCode::UnknownAgent, error.to_string()),
            Error::HandlerExecution(message) => {
                Self::new(FaultCode::HandlerExecution, message.clone())
            }
            other => Self::new(FaultCode::HandlerExecution, other.to_string()),
        }
    }

    /// Turn a received fault back into a local error.
    pub fn into_error(self, type_name: &str, destination: &AgentId) -> Error {
        match self.code {
            FaultCode::UnregisteredType => Error::UnregisteredType(type_name.to_string()),
            FaultCode::MalformedPayload => Error::malformed(type_name, self.message),
            FaultCode::UnknownAgent => Error::UnknownAgent(destination.clone()),
            FaultCode::HandlerExecution => Error::HandlerExecution(self.message),
        }
    }
}

/// Wire-level unit carrying an encoded message plus routing metadata.
///
/// The payload is opaque to the host; it is copied byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Unique envelope ID (ULID)
    pub id: String,
    pub kind: EnvelopeKind,
    /// Logical message type, resolved against the receiver's codec registry
    pub type_name: String,
    pub content_type: String,
    #[serde(with = "payload_encoding")]
    pub payload: Vec<u8>,
    pub destination: AgentId,
    /// Reply address (None for fire-and-forget envelopes)
    #[serde(default)]
    pub sender: Option<AgentId>,
    /// Correlation ID shared by a request and its response
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    /// Creation timestamp (unix ms)
    pub created_at: i64,
}

impl Envelope {
    /// Create a request envelope.
    pub fn request(
        type_name: impl Into<String>,
        content_type: impl Into<String>,
        payload: Vec<u8>,
        destination: AgentId,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            kind: EnvelopeKind::Request,
            type_name: type_name.into(),
            content_type: content_type.into(),
            payload,
            destination,
            sender: None,
            correlation_id: correlation_id.into(),
            fault: None,
            created_at: current_timestamp(),
        }
    }

    /// Set the reply address.
    pub fn with_sender(mut self, sender: AgentId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Create a typed response envelope. None when the request has no reply address.
    pub fn create_response(
        &self,
        type_name: impl Into<String>,
        content_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Option<Self> {
        self.reply(EnvelopeKind::Response, type_name.into(), content_type.into(), payload, None)
    }

    /// Create an acknowledgement for a handler without a return value.
    pub fn create_ack(&self) -> Option<Self> {
        self.reply(
            EnvelopeKind::Ack,
            ACK_TYPE_NAME.to_string(),
            JSON_CONTENT_TYPE.to_string(),
            Vec::new(),
            None,
        )
    }

    /// Create a fault envelope reporting why the request could not be served.
    pub fn create_fault(&self, fault: Fault) -> Option<Self> {
        self.reply(
            EnvelopeKind::Fault,
            FAULT_TYPE_NAME.to_string(),
            JSON_CONTENT_TYPE.to_string(),
            Vec::new(),
            Some(fault),
        )
    }

    fn reply(
        &self,
        kind: EnvelopeKind,
        type_name: String,
        content_type: String,
        payload: Vec<u8>,
        fault: Option<Fault>,
    ) -> Option<Self> {
        let to = self.sender.clone()?;
        Some(Self {
            id: generate_id(),
            kind,
            type_name,
            content_type,
            payload,
            destination: to,
            sender: Some(self.destination.clone()),
            correlation_id: self.correlation_id.clone(),
            fault,
            created_at: current_timestamp(),
        })
    }

    /// True for envelopes that complete a pending request.
    pub fn is_reply(&self) -> bool {
        !matches!(self.kind, EnvelopeKind::Request)
    }
}

mod payload_encoding {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
