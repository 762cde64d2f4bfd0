//! agentrelay library root.
//!
//! Typed agents exchange request/response messages through per-worker routing
//! runtimes, relayed between processes by a rendezvous host.

pub mod agent;
pub mod cli;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod providers;
pub mod runtime;
pub mod sql;

pub use agent::{Agent, Handler, HandlerError, MessageContext, Reply, Routes};
pub use cli::Commands;
pub use codec::{Codec, CodecRegistry, JsonCodec, Message};
pub use config::{CompletionConfig, ConnectPolicy, HostConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use host::RendezvousHost;
pub use protocol::{AgentId, Envelope};
pub use providers::Provider;
pub use runtime::{SendOptions, WorkerRuntime};
