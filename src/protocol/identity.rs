//! Logical agent identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Instance key used when an agent type is announced without an explicit key.
pub const DEFAULT_INSTANCE_KEY: &str = "default";

/// Agent type used for the per-runtime reply address.
pub const RUNTIME_AGENT_TYPE: &str = "runtime";

/// Address of a reachable agent: `(type_name, instance_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    type_name: String,
    instance_key: String,
}

impl AgentId {
    pub fn new(type_name: impl Into<String>, instance_key: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            instance_key: instance_key.into(),
        }
    }

    /// Identity of the default instance of an agent type.
    pub fn default_instance(type_name: impl Into<String>) -> Self {
        Self::new(type_name, DEFAULT_INSTANCE_KEY)
    }

    /// A fresh reply address for one runtime.
    pub(crate) fn runtime_reply_address() -> Self {
        Self::new(RUNTIME_AGENT_TYPE, ulid::Ulid::new().to_string())
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn instance_key(&self) -> &str {
        &self.instance_key
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.instance_key)
    }
}
