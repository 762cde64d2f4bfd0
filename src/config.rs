//! Configuration for the host, worker runtimes and the translator.
//!
//! Values arrive through CLI flags backed by environment variables (see
//! `cli`); these structs carry them into the library with defaults and
//! validation.

use std::time::Duration;

use crate::error::{Error, Result};

pub const ENV_HOST_ADDRESS: &str = "HOST_ADDRESS";
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";

/// Default bind address of the rendezvous host.
pub const DEFAULT_HOST_BIND: &str = "0.0.0.0:50051";

/// Default address workers dial.
pub const DEFAULT_HOST_CONNECT: &str = "host:50051";

/// Retry policy for the initial host connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    /// Delay before the second attempt; doubled for every later one.
    pub backoff_ms: u64,
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff_ms() -> u64 {
    1000
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: default_connect_attempts(),
            backoff_ms: default_connect_backoff_ms(),
        }
    }
}

impl ConnectPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Worker runtime configuration.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Host to connect to. `None` runs the runtime host-local.
    pub host_address: Option<String>,

    pub request_timeout_ms: u64,

    pub sweep_interval_ms: u64,

    pub connect: ConnectPolicy,

    pub outbound_capacity: usize,
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_outbound_capacity() -> usize {
    256
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host_address: None,
            request_timeout_ms: default_request_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            connect: ConnectPolicy::default(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl RuntimeConfig {
    /// Runtime that relays through the host at `address`.
    pub fn connected(address: impl Into<String>) -> Self {
        Self {
            host_address: Some(address.into()),
            ..Default::default()
        }
    }

    /// Runtime without a host; every destination must be local.
    pub fn local() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_policy(mut self, connect: ConnectPolicy) -> Self {
        self.connect = connect;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request timeout must be positive".to_string()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep interval must be positive".to_string()));
        }
        if self.connect.attempts == 0 {
            return Err(Error::Config("connect attempts must be at least 1".to_string()));
        }
        if self.outbound_capacity == 0 {
            return Err(Error::Config("outbound queue capacity must be positive".to_string()));
        }
        if let Some(address) = &self.host_address {
            if address.trim().is_empty() {
                return Err(Error::Config(format!("{} is empty", ENV_HOST_ADDRESS)));
            }
        }
        Ok(())
    }
}

/// Rendezvous host configuration.
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub bind_address: String,

    /// Frames buffered per connection; relays beyond it are nacked.
    pub connection_queue: usize,

    /// Interval of the "host is alive" status line; 0 disables it.
    pub status_interval_secs: u64,
}

fn default_bind_address() -> String {
    DEFAULT_HOST_BIND.to_string()
}

fn default_connection_queue() -> usize {
    256
}

fn default_status_interval_secs() -> u64 {
    10
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            connection_queue: default_connection_queue(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

impl HostConfig {
    pub fn bind(address: impl Into<String>) -> Self {
        Self {
            bind_address: address.into(),
            ..Default::default()
        }
    }

    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_queue == 0 {
            return Err(Error::Config("connection queue must be positive".to_string()));
        }
        Ok(())
    }
}

/// Completion service settings used by the translator.
#[derive(Clone, Debug)]
pub struct CompletionConfig {
    pub api_key: String,

    pub model: String,

    pub base_url: String,

    pub timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_completion_timeout_secs() -> u64 {
    120
}

impl CompletionConfig {
    /// Build from an optional API key; a missing or blank key is a configuration error.
    pub fn from_api_key(api_key: Option<String>) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::Config(format!("{} environment variable not set", ENV_API_KEY)))?;

        Ok(Self {
            api_key,
            model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_completion_timeout_secs(),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
