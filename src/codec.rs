//! Typed messages and the codec registry that turns them into payload bytes.
//!
//! Codecs are keyed by the logical type name carried in every envelope. The
//! routing runtime encodes through the registry before sending and decodes by
//! `envelope.type_name` on receipt, so an unknown type name is always an
//! explicit `UnregisteredType` error.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::JSON_CONTENT_TYPE;

/// A message type that can travel inside an envelope.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical type name used on the wire.
    const TYPE_NAME: &'static str;

    /// Caller-assigned identifier to use as the correlation id, if the message carries one.
    fn correlation_hint(&self) -> Option<&str> {
        None
    }

    /// Semantic checks applied after a successful parse.
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Encode/decode pair bound to one message type name.
pub trait Codec: Send + Sync {
    fn type_name(&self) -> &str;

    fn content_type(&self) -> &str;

    fn encode(&self, message: &dyn Any) -> Result<Vec<u8>>;

    fn decode(&self, payload: &[u8]) -> Result<Box<dyn Any + Send>>;
}

/// serde_json codec for any [`Message`].
pub struct JsonCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M: Message> JsonCodec<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M: Message> Default for JsonCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Message> Codec for JsonCodec<M> {
    fn type_name(&self) -> &str {
        M::TYPE_NAME
    }

    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, message: &dyn Any) -> Result<Vec<u8>> {
        let message = message
            .downcast_ref::<M>()
            .ok_or_else(|| Error::malformed(M::TYPE_NAME, "value does not match the codec type"))?;
        Ok(serde_json::to_vec(message)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<Box<dyn Any + Send>> {
        let message: M =
            serde_json::from_slice(payload).map_err(|e| Error::malformed(M::TYPE_NAME, e))?;
        message
            .validate()
            .map_err(|reason| Error::malformed(M::TYPE_NAME, reason))?;
        Ok(Box::new(message))
    }
}

/// Output of [`CodecRegistry::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub type_name: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// Thread-safe map from type name to codec. The newest registration wins.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn Codec>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the JSON codec for `M`.
    pub fn register<M: Message>(&self) {
        self.register_codec(Arc::new(JsonCodec::<M>::new()));
    }

    /// Register a codec, returning the one it replaced.
    pub fn register_codec(&self, codec: Arc<dyn Codec>) -> Option<Arc<dyn Codec>> {
        let type_name = codec.type_name().to_string();
        let previous = self.codecs.write().insert(type_name.clone(), codec);
        if previous.is_some() {
            tracing::debug!(type_name = %type_name, "Replaced codec registration");
        }
        previous
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.codecs.read().contains_key(type_name)
    }

    fn lookup(&self, type_name: &str) -> Result<Arc<dyn Codec>> {
        self.codecs
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| Error::UnregisteredType(type_name.to_string()))
    }

    pub fn encode<M: Message>(&self, message: &M) -> Result<Encoded> {
        self.encode_any(M::TYPE_NAME, message)
    }

    /// Encode a type-erased value under its declared type name.
    pub fn encode_any(&self, type_name: &str, message: &dyn Any) -> Result<Encoded> {
        let codec = self.lookup(type_name)?;
        let payload = codec.encode(message)?;
        Ok(Encoded {
            type_name: type_name.to_string(),
            content_type: codec.content_type().to_string(),
            payload,
        })
    }

    pub fn decode_any(&self, type_name: &str, payload: &[u8]) -> Result<Box<dyn Any + Send>> {
        self.lookup(type_name)?.decode(payload)
    }

    pub fn decode<M: Message>(&self, type_name: &str, payload: &[u8]) -> Result<M> {
        let value = self.decode_any(type_name, payload)?;
        value.downcast::<M>().map(|m| *m).map_err(|_| {
            Error::malformed(
                type_name,
                format!("decoded value is not a {}", M::TYPE_NAME),
            )
        })
    }
}
