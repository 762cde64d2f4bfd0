//! Typed agents, their handler dispatch tables, and the per-runtime agent registry.
//!
//! An agent type implements [`Handler<TIn, TOut>`] once per message type it
//! accepts and lists those implementations in [`Agent::routes`]. The registry
//! binds a zero-argument factory to a type name and hands out one cached
//! instance per [`AgentId`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::codec::{CodecRegistry, Message};
use crate::error::{Error, Result};
use crate::protocol::{AgentId, Envelope, EnvelopeKind};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Failure raised inside handler logic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<Error> for HandlerError {
    fn from(e: Error) -> Self {
        Self(e.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-delivery information handed to a handler.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Reply address of the requester, if any
    pub sender: Option<AgentId>,
    /// Identity the message was addressed to
    pub recipient: AgentId,
    pub correlation_id: String,
    /// Cancelled when the owning runtime stops
    pub cancellation: CancellationToken,
}

/// A type-erased handler result waiting to be encoded.
pub struct Outgoing {
    pub type_name: &'static str,
    pub value: Box<dyn Any + Send + Sync>,
}

impl Outgoing {
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            type_name: M::TYPE_NAME,
            value: Box::new(message),
        }
    }
}

/// Handler output: a typed response message, or `()` for no reply value.
pub trait Reply: Send + Sized + 'static {
    fn into_outgoing(self) -> Option<Outgoing>;

    /// Rebuild the value from a response envelope on the requester side.
    fn from_envelope(codecs: &CodecRegistry, envelope: &Envelope) -> Result<Self>;
}

impl<M: Message> Reply for M {
    fn into_outgoing(self) -> Option<Outgoing> {
        Some(Outgoing::new(self))
    }

    fn from_envelope(codecs: &CodecRegistry, envelope: &Envelope) -> Result<Self> {
        if envelope.kind != EnvelopeKind::Response {
            return Err(Error::malformed(
                M::TYPE_NAME,
                format!("expected a response, got {:?}", envelope.kind),
            ));
        }
        codecs.decode::<M>(&envelope.type_name, &envelope.payload)
    }
}

impl Reply for () {
    fn into_outgoing(self) -> Option<Outgoing> {
        None
    }

    fn from_envelope(_codecs: &CodecRegistry, _envelope: &Envelope) -> Result<Self> {
        Ok(())
    }
}

/// Handles one message type for an agent.
#[async_trait]
pub trait Handler<TIn: Message, TOut: Reply>: Send + Sync + 'static {
    async fn handle(&self, message: TIn, ctx: MessageContext) -> std::result::Result<TOut, HandlerError>;
}

/// An addressable agent type.
pub trait Agent: Send + Sync + Sized + 'static {
    /// Fill the dispatch table with this agent's handlers.
    fn routes(routes: &mut Routes<Self>);
}

type RouteFn<A> = Box<
    dyn Fn(Arc<A>, Box<dyn Any + Send>, MessageContext) -> BoxFuture<std::result::Result<Option<Outgoing>, HandlerError>>
        + Send
        + Sync,
>;

/// Dispatch table from message type name to handler.
pub struct Routes<A> {
    table: HashMap<&'static str, RouteFn<A>>,
}

impl<A: Send + Sync + 'static> Routes<A> {
    fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Route messages of type `TIn` to `A`'s `Handler<TIn, TOut>` implementation.
    pub fn handle<TIn, TOut>(&mut self) -> &mut Self
    where
        A: Handler<TIn, TOut>,
        TIn: Message,
        TOut: Reply,
    {
        let route: RouteFn<A> = Box::new(|agent, message, ctx| {
            Box::pin(async move {
                let message = message.downcast::<TIn>().map_err(|_| {
                    HandlerError::new(format!("expected a {} message", TIn::TYPE_NAME))
                })?;
                let output = <A as Handler<TIn, TOut>>::handle(&agent, *message, ctx).await?;
                Ok(output.into_outgoing())
            })
        });

        if self.table.insert(TIn::TYPE_NAME, route).is_some() {
            tracing::warn!(message_type = TIn::TYPE_NAME, "Handler route replaced");
        }
        self
    }

    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.table.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

trait AgentInstance: Send + Sync {
    fn handles(&self, type_name: &str) -> bool;

    fn dispatch(
        &self,
        type_name: &str,
        message: Box<dyn Any + Send>,
        ctx: MessageContext,
    ) -> BoxFuture<std::result::Result<Option<Outgoing>, HandlerError>>;
}

struct BoundAgent<A> {
    agent: Arc<A>,
    routes: Arc<Routes<A>>,
}

impl<A: Agent> AgentInstance for BoundAgent<A> {
    fn handles(&self, type_name: &str) -> bool {
        self.routes.table.contains_key(type_name)
    }

    fn dispatch(
        &self,
        type_name: &str,
        message: Box<dyn Any + Send>,
        ctx: MessageContext,
    ) -> BoxFuture<std::result::Result<Option<Outgoing>, HandlerError>> {
        match self.routes.table.get(type_name) {
            Some(route) => route(self.agent.clone(), message, ctx),
            None => {
                let err = HandlerError::new(format!(
                    "agent '{}' has no handler for '{}'",
                    ctx.recipient, type_name
                ));
                Box::pin(async move { Err(err) })
            }
        }
    }
}

trait AgentFactory: Send + Sync {
    fn create(&self) -> Arc<dyn AgentInstance>;
}

struct TypedFactory<A, F> {
    factory: F,
    routes: Arc<Routes<A>>,
}

impl<A, F> AgentFactory for TypedFactory<A, F>
where
    A: Agent,
    F: Fn() -> A + Send + Sync + 'static,
{
    fn create(&self) -> Arc<dyn AgentInstance> {
        Arc::new(BoundAgent {
            agent: Arc::new((self.factory)()),
            routes: self.routes.clone(),
        })
    }
}

/// A resolved local agent instance.
#[derive(Clone)]
pub struct LocalAgent {
    instance: Arc<dyn AgentInstance>,
}

impl LocalAgent {
    pub fn handles(&self, type_name: &str) -> bool {
        self.instance.handles(type_name)
    }

    /// Run the handler registered for `type_name`.
    pub(crate) fn dispatch(
        &self,
        type_name: &str,
        message: Box<dyn Any + Send>,
        ctx: MessageContext,
    ) -> BoxFuture<std::result::Result<Option<Outgoing>, HandlerError>> {
        self.instance.dispatch(type_name, message, ctx)
    }
}

/// Result of resolving an identity against the local registry.
pub enum Resolution {
    Local(LocalAgent),
    /// Not registered here; the host has to relay it.
    Remote,
}

#[derive(Default)]
struct RegistryState {
    factories: HashMap<String, Arc<dyn AgentFactory>>,
    instances: HashMap<AgentId, LocalAgent>,
}

/// Agent factories and cached instances for one runtime.
///
/// A type name can be bound once; a second registration is rejected and the
/// first binding stays in place.
#[derive(Default)]
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A, F>(&self, type_name: impl Into<String>, factory: F) -> Result<()>
    where
        A: Agent,
        F: Fn() -> A + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        let mut routes = Routes::new();
        A::routes(&mut routes);

        let mut state = self.state.lock();
        if state.factories.contains_key(&type_name) {
            return Err(Error::DuplicateAgentType(type_name));
        }

        tracing::debug!(
            agent_type = %type_name,
            handles = ?routes.message_types(),
            "Registered agent type"
        );
        state.factories.insert(
            type_name,
            Arc::new(TypedFactory {
                factory,
                routes: Arc::new(routes),
            }),
        );
        Ok(())
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.state.lock().factories.contains_key(type_name)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.state.lock().factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Resolve an identity, creating its instance on first use.
    pub fn resolve(&self, id: &AgentId) -> Resolution {
        let mut state = self.state.lock();
        if let Some(agent) = state.instances.get(id) {
            return Resolution::Local(agent.clone());
        }

        let Some(factory) = state.factories.get(id.type_name()).cloned() else {
            return Resolution::Remote;
        };

        let agent = LocalAgent {
            instance: factory.create(),
        };
        tracing::debug!(agent = %id, "Created agent instance");
        state.instances.insert(id.clone(), agent.clone());
        Resolution::Local(agent)
    }

    /// Resolve an identity that must be hosted locally.
    pub fn resolve_local(&self, id: &AgentId) -> Result<LocalAgent> {
        match self.resolve(id) {
            Resolution::Local(agent) => Ok(agent),
            Resolution::Remote => Err(Error::UnknownAgent(id.clone())),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    impl Message for Add {
        const TYPE_NAME: &'static str = "Add";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sum {
        value: i64,
    }

    impl Message for Sum {
        const TYPE_NAME: &'static str = "Sum";
    }

    static CREATED: AtomicUsize = AtomicUsize::new(0);

    struct Calculator {
        seen: Mutex<Vec<i64>>,
    }

    impl Calculator {
        fn new() -> Self {
            CREATED.fetch_add(1, Ordering::SeqCst);
            Self {
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Handler<Add, Sum> for Calculator {
        async fn handle(&self, message: Add, _ctx: MessageContext) -> std::result::Result<Sum, HandlerError> {
            if message.a < 0 {
                return Err(HandlerError::new("negative input"));
            }
            Ok(Sum {
                value: message.a + message.b,
            })
        }
    }

    #[async_trait]
    impl Handler<Sum, ()> for Calculator {
        async fn handle(&self, message: Sum, _ctx: MessageContext) -> std::result::Result<(), HandlerError> {
            self.seen.lock().push(message.value);
            Ok(())
        }
    }

    impl Agent for Calculator {
        fn routes(routes: &mut Routes<Self>) {
            routes.handle::<Add, Sum>().handle::<Sum, ()>();
        }
    }

    fn ctx(recipient: &AgentId) -> MessageContext {
        MessageContext {
            sender: None,
            recipient: recipient.clone(),
            correlation_id: "c-1".to_string(),
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = AgentRegistry::new();
        registry.register("calc", Calculator::new).unwrap();
        assert!(matches!(
            registry.register("calc", Calculator::new),
            Err(Error::DuplicateAgentType(name)) if name == "calc"
        ));
        assert_eq!(registry.registered_types(), vec!["calc".to_string()]);
    }

    #[test]
    fn test_instances_are_cached_per_identity() {
        let registry = AgentRegistry::new();
        registry.register("calc", Calculator::new).unwrap();
        let before = CREATED.load(Ordering::SeqCst);

        let default = AgentId::default_instance("calc");
        let other = AgentId::new("calc", "other");
        let a = registry.resolve_local(&default).unwrap();
        let b = registry.resolve_local(&default).unwrap();
        let c = registry.resolve_local(&other).unwrap();

        assert!(Arc::ptr_eq(&a.instance, &b.instance));
        assert!(!Arc::ptr_eq(&a.instance, &c.instance));
        assert_eq!(registry.instance_count(), 2);
        assert!(CREATED.load(Ordering::SeqCst) >= before + 2);
    }

    #[test]
    fn test_unregistered_type_is_remote() {
        let registry = AgentRegistry::new();
        let id = AgentId::default_instance("sql_translator");
        assert!(matches!(registry.resolve(&id), Resolution::Remote));
        assert!(matches!(
            registry.resolve_local(&id),
            Err(Error::UnknownAgent(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_dispatch_by_message_type() {
        let registry = AgentRegistry::new();
        registry.register("calc", Calculator::new).unwrap();
        let id = AgentId::default_instance("calc");
        let agent = registry.resolve_local(&id).unwrap();
        assert!(agent.handles("Add"));
        assert!(agent.handles("Sum"));
        assert!(!agent.handles("Mul"));

        let out = agent
            .dispatch("Add", Box::new(Add { a: 2, b: 3 }), ctx(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.type_name, "Sum");
        assert_eq!(out.value.downcast_ref::<Sum>(), Some(&Sum { value: 5 }));

        let none = agent
            .dispatch("Sum", Box::new(Sum { value: 5 }), ctx(&id))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_handler_failures_are_returned() {
        let registry = AgentRegistry::new();
        registry.register("calc", Calculator::new).unwrap();
        let id = AgentId::default_instance("calc");
        let agent = registry.resolve_local(&id).unwrap();

        let err = agent
            .dispatch("Add", Box::new(Add { a: -1, b: 3 }), ctx(&id))
            .await
            .err()
            .unwrap();
        assert_eq!(err, HandlerError::new("negative input"));

        let err = agent
            .dispatch("Mul", Box::new(Add { a: 1, b: 1 }), ctx(&id))
            .await
            .err()
            .unwrap();
        assert!(err.0.contains("no handler"));
    }

    #[test]
    fn test_reply_from_envelope() {
        let codecs = CodecRegistry::new();
        codecs.register::<Sum>();
        let encoded = codecs.encode(&Sum { value: 9 }).unwrap();

        let request = Envelope::request(
            "Add",
            "application/json",
            b"{}".to_vec(),
            AgentId::default_instance("calc"),
            "c-1",
        )
        .with_sender(AgentId::new("runtime", "r"));
        let response = request
            .create_response(encoded.type_name, encoded.content_type, encoded.payload)
            .unwrap();

        let sum = <Sum as Reply>::from_envelope(&codecs, &response).unwrap();
        assert_eq!(sum, Sum { value: 9 });

        let ack = request.create_ack().unwrap();
        assert!(<Sum as Reply>::from_envelope(&codecs, &ack).is_err());
        <() as Reply>::from_envelope(&codecs, &ack).unwrap();
    }
}
