//! Agent communication protocol for agentrelay.
//!
//! This module defines what travels between workers and the rendezvous host:
//! - Agent identities `(type_name, instance_key)`
//! - Message envelopes with correlation IDs
//! - Line-delimited JSON frames over TCP

pub mod envelope;
pub mod identity;
pub mod wire;

pub use envelope::{Envelope, EnvelopeKind, Fault, FaultCode, JSON_CONTENT_TYPE};
pub use identity::{AgentId, DEFAULT_INSTANCE_KEY};
pub use wire::{Frame, FrameReader, FrameWriter};
