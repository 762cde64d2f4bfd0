//! Worker routing runtime.
//!
//! One `WorkerRuntime` per worker process owns the codec registry, the agent
//! registry and the pending-request table. It is an explicit context object:
//! construct it, register codecs and agents, `start()` it, pass clones around,
//! and `stop()` it on shutdown. Several runtimes can live in one process.
//!
//! Connected mode keeps one TCP connection to the rendezvous host with three
//! background tasks: a writer draining the outbound queue, the inbound
//! dispatch loop, and the sweeper that expires unanswered requests.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentRegistry, MessageContext, Outgoing, Reply};
use crate::codec::{CodecRegistry, Message};
use crate::config::{ConnectPolicy, RuntimeConfig};
use crate::correlation::Correlator;
use crate::error::{Error, Result};
use crate::protocol::wire::drain_outbound;
use crate::protocol::{AgentId, Envelope, EnvelopeKind, Fault, FaultCode, Frame, FrameReader, FrameWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Per-call overrides for [`WorkerRuntime::send_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Correlation id to use instead of the message's own id or a fresh one.
    pub correlation_id: Option<String>,
    /// Overrides the runtime's request timeout.
    pub timeout: Option<Duration>,
    /// Cancelling the token abandons the request and frees its correlation entry.
    pub cancel: Option<CancellationToken>,
}

struct Inner {
    config: RuntimeConfig,
    codecs: CodecRegistry,
    agents: AgentRegistry,
    correlator: Arc<Correlator>,
    reply_to: AgentId,
    lifecycle: Mutex<Lifecycle>,
    /// Identities announced to the host. Held while announcing so the hello
    /// frame and later register frames go out in order.
    exposed: tokio::sync::Mutex<BTreeSet<AgentId>>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Routing runtime for one worker.
#[derive(Clone)]
pub struct WorkerRuntime {
    inner: Arc<Inner>,
}

impl WorkerRuntime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                codecs: CodecRegistry::new(),
                agents: AgentRegistry::new(),
                correlator: Correlator::new(),
                reply_to: AgentId::runtime_reply_address(),
                lifecycle: Mutex::new(Lifecycle::Created),
                exposed: tokio::sync::Mutex::new(BTreeSet::new()),
                outbound: Mutex::new(None),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.inner.codecs
    }

    /// Register the JSON codec for `M`.
    pub fn add_codec<M: Message>(&self) {
        self.inner.codecs.register::<M>();
    }

    /// Identity responses to this runtime's requests are addressed to.
    pub fn reply_address(&self) -> &AgentId {
        &self.inner.reply_to
    }

    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle.lock() == Lifecycle::Running
    }

    /// Number of sends still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.len()
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.inner.agents.registered_types()
    }

    /// Bind an agent factory to `type_name` and announce its default instance.
    ///
    /// A type name can only be registered once per runtime.
    pub async fn register<A, F>(&self, type_name: impl Into<String>, factory: F) -> Result<AgentId>
    where
        A: Agent,
        F: Fn() -> A + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        self.inner.agents.register(type_name.clone(), factory)?;
        let id = AgentId::default_instance(type_name);
        self.expose(id.clone()).await?;
        Ok(id)
    }

    /// Announce an additional instance key of a registered agent type.
    pub async fn expose(&self, id: AgentId) -> Result<()> {
        if !self.inner.agents.is_registered(id.type_name()) {
            return Err(Error::UnknownAgent(id));
        }

        let mut exposed = self.inner.exposed.lock().await;
        if !exposed.insert(id.clone()) {
            return Ok(());
        }

        let sender = self.inner.outbound.lock().clone();
        if let Some(sender) = sender {
            debug!(agent = %id, "Announcing agent to host");
            sender
                .send(Frame::Register { agents: vec![id] })
                .await
                .map_err(|_| Error::Connection("connection to host closed".to_string()))?;
        }
        Ok(())
    }

    /// Connect to the host (connected mode) and start the background tasks.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => return Err(Error::Shutdown),
            }
        }

        if let Err(e) = self.start_tasks().await {
            *self.inner.lifecycle.lock() = Lifecycle::Created;
            return Err(e);
        }
        Ok(())
    }

    async fn start_tasks(&self) -> Result<()> {
        let mut handles = vec![tokio::spawn(sweep_loop(
            self.inner.correlator.clone(),
            self.inner.config.sweep_interval(),
            self.inner.shutdown.clone(),
        ))];

        match self.inner.config.host_address.clone() {
            Some(address) => {
                let stream = match connect_with_retry(&address, &self.inner.config.connect).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        for handle in handles {
                            handle.abort();
                        }
                        return Err(e);
                    }
                };
                let (read_half, write_half) = stream.into_split();
                let (tx, rx) = mpsc::channel(self.inner.config.outbound_capacity);

                {
                    let exposed = self.inner.exposed.lock().await;
                    let mut agents: Vec<AgentId> = exposed.iter().cloned().collect();
                    agents.push(self.inner.reply_to.clone());
                    tx.send(Frame::Hello { agents })
                        .await
                        .map_err(|_| Error::Connection("outbound queue closed".to_string()))?;
                    *self.inner.outbound.lock() = Some(tx);
                }

                handles.push(tokio::spawn(drain_outbound(
                    FrameWriter::new(write_half),
                    rx,
                    self.inner.shutdown.clone(),
                )));
                handles.push(tokio::spawn(self.clone().read_loop(FrameReader::new(read_half))));

                info!(
                    host = %address,
                    reply_to = %self.inner.reply_to,
                    "Worker runtime connected to host"
                );
            }
            None => {
                info!(reply_to = %self.inner.reply_to, "Worker runtime started in host-local mode");
            }
        }

        self.inner.tasks.lock().extend(handles);
        Ok(())
    }

    /// Stop the runtime. In-flight sends fail with `Shutdown`.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle == Lifecycle::Stopped {
                return Ok(());
            }
            *lifecycle = Lifecycle::Stopped;
        }

        self.inner.shutdown.cancel();
        self.inner.outbound.lock().take();
        let failed = self.inner.correlator.fail_all(|| Error::Shutdown);

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Runtime task panicked");
                }
            }
        }

        info!(failed_requests = failed, "Worker runtime stopped");
        Ok(())
    }

    /// Send `message` to `destination` and wait for the handler's typed response.
    pub async fn send<M: Message, R: Reply>(&self, message: &M, destination: &AgentId) -> Result<R> {
        self.send_with(message, destination, SendOptions::default()).await
    }

    pub async fn send_with<M: Message, R: Reply>(
        &self,
        message: &M,
        destination: &AgentId,
        options: SendOptions,
    ) -> Result<R> {
        self.ensure_running()?;

        let encoded = self.inner.codecs.encode(message)?;
        let correlation_id = options
            .correlation_id
            .or_else(|| message.correlation_hint().map(str::to_string))
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.request_timeout());

        let deadline = Instant::now() + timeout;
        let waiter = self
            .inner
            .correlator
            .register_pending(correlation_id.clone(), deadline)?;
        // stop() may have drained the table between the first check and registration.
        self.ensure_running()?;

        let envelope = Envelope::request(
            encoded.type_name,
            encoded.content_type,
            encoded.payload,
            destination.clone(),
            correlation_id.clone(),
        )
        .with_sender(self.inner.reply_to.clone());

        debug!(
            correlation_id = %correlation_id,
            destination = %destination,
            message_type = M::TYPE_NAME,
            "Sending request"
        );
        // A stalled host connection must not hold the caller past its deadline.
        match tokio::time::timeout_at(deadline, self.route(envelope)).await {
            Ok(routed) => routed?,
            Err(_) => return Err(Error::RequestTimeout(correlation_id)),
        }

        let response = waiter.wait(options.cancel.as_ref()).await?;
        match response.kind {
            EnvelopeKind::Fault => {
                let fault = response.fault.clone().unwrap_or_else(|| {
                    Fault::new(FaultCode::HandlerExecution, "fault without description")
                });
                Err(fault.into_error(M::TYPE_NAME, destination))
            }
            _ => R::from_envelope(&self.inner.codecs, &response),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.inner.lifecycle.lock() {
            Lifecycle::Running => Ok(()),
            Lifecycle::Created => Err(Error::NotStarted),
            Lifecycle::Stopped => Err(Error::Shutdown),
        }
    }

    /// Deliver an envelope: resolve our own replies, dispatch local agents
    /// directly, and hand everything else to the host.
    async fn route(&self, envelope: Envelope) -> Result<()> {
        if envelope.destination == self.inner.reply_to {
            let correlation_id = envelope.correlation_id.clone();
            self.inner.correlator.resolve(&correlation_id, envelope);
            return Ok(());
        }

        if self.inner.agents.is_registered(envelope.destination.type_name()) {
            self.handle_inbound(envelope);
            return Ok(());
        }

        let sender = self.inner.outbound.lock().clone();
        match sender {
            Some(sender) => tokio::select! {
                _ = self.inner.shutdown.cancelled() => Err(Error::Shutdown),
                sent = sender.send(Frame::Envelope(envelope)) => {
                    sent.map_err(|_| Error::Connection("connection to host closed".to_string()))
                }
            },
            None if self.inner.config.host_address.is_none() => {
                Err(Error::UnknownAgent(envelope.destination))
            }
            None if !self.is_running() => Err(Error::Shutdown),
            None => Err(Error::Connection("not connected to host".to_string())),
        }
    }

    /// Entry point of the dispatch loop for one inbound envelope.
    fn handle_inbound(&self, envelope: Envelope) {
        if envelope.is_reply() {
            let correlation_id = envelope.correlation_id.clone();
            self.inner.correlator.resolve(&correlation_id, envelope);
            return;
        }

        let runtime = self.clone();
        tokio::spawn(async move {
            let correlation_id = envelope.correlation_id.clone();
            let Some(reply) = runtime.serve(envelope).await else {
                return;
            };
            if let Err(e) = runtime.route(reply).await {
                warn!(correlation_id = %correlation_id, error = %e, "Failed to deliver response");
            }
        });
    }

    /// Decode, dispatch and build the response envelope for a request.
    async fn serve(&self, request: Envelope) -> Option<Envelope> {
        let reply = match self.invoke(&request).await {
            Ok(Some(outgoing)) => self.encode_reply(&request, outgoing),
            Ok(None) => request.create_ack(),
            Err(e) => {
                warn!(
                    correlation_id = %request.correlation_id,
                    destination = %request.destination,
                    error = %e,
                    "Request failed"
                );
                request.create_fault(Fault::from_error(&e))
            }
        };

        if reply.is_none() {
            debug!(correlation_id = %request.correlation_id, "Request has no reply address");
        }
        reply
    }

    async fn invoke(&self, request: &Envelope) -> Result<Option<Outgoing>> {
        let message = self
            .inner
            .codecs
            .decode_any(&request.type_name, &request.payload)?;
        let agent = self.inner.agents.resolve_local(&request.destination)?;

        let ctx = MessageContext {
            sender: request.sender.clone(),
            recipient: request.destination.clone(),
            correlation_id: request.correlation_id.clone(),
            cancellation: self.inner.shutdown.child_token(),
        };

        // Run the handler as its own task so a panic becomes a fault.
        let handle = tokio::spawn(agent.dispatch(&request.type_name, message, ctx));
        match handle.await {
            Ok(result) => result.map_err(|e| Error::HandlerExecution(e.0)),
            Err(e) => Err(Error::HandlerExecution(format!("handler aborted: {}", e))),
        }
    }

    fn encode_reply(&self, request: &Envelope, outgoing: Outgoing) -> Option<Envelope> {
        let value: &dyn std::any::Any = &*outgoing.value;
        match self.inner.codecs.encode_any(outgoing.type_name, value) {
            Ok(encoded) => {
                request.create_response(encoded.type_name, encoded.content_type, encoded.payload)
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode handler response");
                request.create_fault(Fault::from_error(&e))
            }
        }
    }

    async fn read_loop(self, mut reader: FrameReader<OwnedReadHalf>) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = reader.next_frame() => frame,
            };

            match frame {
                Ok(Some(Frame::Envelope(envelope))) => self.handle_inbound(envelope),
                Ok(Some(Frame::Nack {
                    correlation_id,
                    destination,
                    reason,
                })) => {
                    warn!(
                        correlation_id = %correlation_id,
                        destination = %destination,
                        reason = %reason,
                        "Host could not relay request"
                    );
                    self.inner.correlator.fail(
                        &correlation_id,
                        Error::DestinationUnreachable { destination, reason },
                    );
                }
                Ok(Some(other)) => warn!(frame = ?other, "Unexpected frame from host"),
                Ok(None) => {
                    warn!("Host closed the connection");
                    self.connection_lost();
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read from host");
                    self.connection_lost();
                    break;
                }
            }
        }
    }

    fn connection_lost(&self) {
        self.inner.outbound.lock().take();
        let failed = self
            .inner
            .correlator
            .fail_all(|| Error::Connection("connection to host lost".to_string()));
        if failed > 0 {
            warn!(failed_requests = failed, "Failed pending requests after connection loss");
        }
    }
}

async fn connect_with_retry(address: &str, policy: &ConnectPolicy) -> Result<TcpStream> {
    let mut last_error: Option<std::io::Error> = None;

    for attempt in 1..=policy.attempts {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => {
                warn!(
                    "Connect attempt {}/{} to {} failed: {}",
                    attempt, policy.attempts, address, e
                );
                last_error = Some(e);
            }
        }

        if attempt < policy.attempts {
            tokio::time::sleep(policy.backoff_after(attempt)).await;
        }
    }

    Err(Error::Connection(format!(
        "host {} unreachable after {} attempts: {}",
        address,
        policy.attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

async fn sweep_loop(correlator: Arc<Correlator>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let expired = correlator.sweep_expired(Instant::now());
                if expired > 0 {
                    debug!(expired, "Swept expired requests");
                }
            }
        }
    }
}
