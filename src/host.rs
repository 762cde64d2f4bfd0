//! Rendezvous host.
//!
//! Accepts worker connections, learns which agent identities each one serves
//! from its hello and register frames, and relays envelopes to the connection
//! serving their destination. Payload bytes are never decoded here.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::protocol::wire::drain_outbound;
use crate::protocol::{AgentId, Envelope, EnvelopeKind, Frame, FrameReader, FrameWriter};

type ConnectionId = u64;

/// Nack reason when the destination's queue has no room.
pub const QUEUE_FULL: &str = "destination queue full";

#[derive(Clone)]
struct Route {
    connection: ConnectionId,
    outbound: mpsc::Sender<Frame>,
}

struct Connection {
    peer: SocketAddr,
    agents: BTreeSet<AgentId>,
}

/// Identity to connection map. The newest claim of an identity wins.
#[derive(Default)]
struct Directory {
    routes: HashMap<AgentId, Route>,
    connections: HashMap<ConnectionId, Connection>,
}

impl Directory {
    fn claim(&mut self, id: AgentId, route: Route) {
        let connection = route.connection;
        if let Some(previous) = self.routes.insert(id.clone(), route) {
            if previous.connection != connection {
                warn!(
                    agent = %id,
                    previous = previous.connection,
                    connection,
                    "Identity claimed by a newer connection"
                );
                if let Some(old) = self.connections.get_mut(&previous.connection) {
                    old.agents.remove(&id);
                }
            }
        }
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.agents.insert(id);
        }
    }

    /// Forget a connection and the identities that still point at it.
    fn disconnect(&mut self, connection: ConnectionId) -> usize {
        let Some(conn) = self.connections.remove(&connection) else {
            return 0;
        };
        let mut removed = 0;
        for id in conn.agents {
            if self.routes.get(&id).map(|r| r.connection) == Some(connection) {
                self.routes.remove(&id);
                removed += 1;
            }
        }
        removed
    }

    fn lookup(&self, id: &AgentId) -> Option<Route> {
        self.routes.get(id).cloned()
    }
}

struct HostInner {
    config: HostConfig,
    directory: Mutex<Directory>,
    next_connection: AtomicU64,
    shutdown: CancellationToken,
}

/// A running rendezvous host.
pub struct RendezvousHost {
    inner: Arc<HostInner>,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RendezvousHost {
    /// Bind the listener and start accepting workers.
    pub async fn start(config: HostConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
            Error::Connection(format!("failed to bind {}: {}", config.bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(HostInner {
            config,
            directory: Mutex::new(Directory::default()),
            next_connection: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let mut tasks = vec![tokio::spawn(accept_loop(inner.clone(), listener))];
        if let Some(interval) = inner.config.status_interval() {
            tasks.push(tokio::spawn(status_loop(inner.clone(), interval)));
        }

        info!("Rendezvous host listening on {}", local_addr);
        Ok(Self {
            inner,
            local_addr,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.inner.directory.lock().connections.len()
    }

    pub fn identity_count(&self) -> usize {
        self.inner.directory.lock().routes.len()
    }

    /// Whether some connected worker currently serves `id`.
    pub fn reachable(&self, id: &AgentId) -> bool {
        self.inner.directory.lock().routes.contains_key(id)
    }

    /// Stop accepting, close every connection, and wait for the tasks to end.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Host task panicked");
                }
            }
        }
        info!("Rendezvous host stopped");
    }
}

async fn accept_loop(inner: Arc<HostInner>, listener: TcpListener) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = inner.next_connection.fetch_add(1, Ordering::Relaxed);
                    connections.spawn(serve_connection(inner.clone(), id, stream, peer));
                }
                Err(e) => {
                    // Usually fd exhaustion; keep accepting.
                    warn!(error = %e, "Failed to accept connection");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
}

async fn status_loop(inner: Arc<HostInner>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let (connections, identities) = {
                    let directory = inner.directory.lock();
                    (directory.connections.len(), directory.routes.len())
                };
                info!(connections, identities, "Host is alive");
            }
        }
    }
}

async fn serve_connection(inner: Arc<HostInner>, id: ConnectionId, stream: TcpStream, peer: SocketAddr) {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(inner.config.connection_queue);
    let closing = inner.shutdown.child_token();
    let writer = tokio::spawn(drain_outbound(FrameWriter::new(write_half), rx, closing.clone()));
    let mut reader = FrameReader::new(read_half);

    // The handshake must come first.
    let hello = tokio::select! {
        _ = closing.cancelled() => None,
        frame = reader.next_frame() => match frame {
            Ok(Some(Frame::Hello { agents })) => Some(agents),
            Ok(Some(other)) => {
                warn!(connection = id, %peer, frame = ?other, "Expected hello frame");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(connection = id, %peer, error = %e, "Failed to read hello frame");
                None
            }
        },
    };

    if let Some(agents) = hello {
        {
            let mut directory = inner.directory.lock();
            directory.connections.insert(
                id,
                Connection {
                    peer,
                    agents: BTreeSet::new(),
                },
            );
            for agent in agents.iter().cloned() {
                directory.claim(
                    agent,
                    Route {
                        connection: id,
                        outbound: tx.clone(),
                    },
                );
            }
        }
        info!(connection = id, %peer, agents = ?agents, "Worker connected");

        relay_frames(&inner, id, &mut reader, &tx, &closing).await;

        let (removed, peer) = {
            let mut directory = inner.directory.lock();
            let peer = directory.connections.get(&id).map(|c| c.peer).unwrap_or(peer);
            (directory.disconnect(id), peer)
        };
        info!(connection = id, %peer, identities_removed = removed, "Worker disconnected");
    }

    drop(tx);
    closing.cancel();
    let _ = writer.await;
}

async fn relay_frames(
    inner: &HostInner,
    id: ConnectionId,
    reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
    origin: &mpsc::Sender<Frame>,
    closing: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closing.cancelled() => return,
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Some(Frame::Envelope(envelope))) => relay(inner, envelope, origin),
            Ok(Some(Frame::Register { agents })) => {
                let mut directory = inner.directory.lock();
                for agent in agents {
                    debug!(connection = id, agent = %agent, "Registered identity");
                    directory.claim(
                        agent,
                        Route {
                            connection: id,
                            outbound: origin.clone(),
                        },
                    );
                }
            }
            Ok(Some(other)) => warn!(connection = id, frame = ?other, "Ignoring unexpected frame"),
            Ok(None) => return,
            Err(e) => {
                warn!(connection = id, error = %e, "Closing connection after read error");
                return;
            }
        }
    }
}

/// Forward an envelope to the connection serving its destination, or tell
/// the requester it could not be delivered.
///
/// Never waits on the destination: a full queue is answered with a nack so one
/// stalled worker cannot hold up this connection's relays to other workers.
fn relay(inner: &HostInner, envelope: Envelope, origin: &mpsc::Sender<Frame>) {
    let destination = envelope.destination.clone();
    let correlation_id = envelope.correlation_id.clone();
    let is_request = envelope.kind == EnvelopeKind::Request;

    let route = inner.directory.lock().lookup(&destination);
    let failure = match route {
        Some(route) => match route.outbound.try_send(Frame::Envelope(envelope)) {
            Ok(()) => {
                debug!(
                    correlation_id = %correlation_id,
                    destination = %destination,
                    connection = route.connection,
                    "Relayed envelope"
                );
                return;
            }
            Err(TrySendError::Full(_)) => QUEUE_FULL.to_string(),
            Err(TrySendError::Closed(_)) => "destination connection closed".to_string(),
        },
        None => "no connected worker serves this agent".to_string(),
    };

    if !is_request {
        warn!(
            correlation_id = %correlation_id,
            destination = %destination,
            reason = %failure,
            "Dropping undeliverable reply"
        );
        return;
    }

    warn!(
        correlation_id = %correlation_id,
        destination = %destination,
        reason = %failure,
        "Destination unreachable"
    );
    let nack = Frame::Nack {
        correlation_id,
        destination,
        reason: failure,
    };
    if let Err(e) = origin.try_send(nack) {
        debug!(error = %e, "Could not queue nack for origin");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JSON_CONTENT_TYPE;
    use std::time::Duration;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    async fn start_host() -> RendezvousHost {
        let mut config = HostConfig::bind("127.0.0.1:0");
        config.status_interval_secs = 0;
        RendezvousHost::start(config).await.unwrap()
    }

    async fn connect(
        host: &RendezvousHost,
        agents: Vec<AgentId>,
    ) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        let stream = TcpStream::connect(host.local_addr()).await.unwrap();
        let (r, w) = stream.into_split();
        let mut writer = FrameWriter::new(w);
        writer.write_frame(&Frame::Hello { agents }).await.unwrap();
        (FrameReader::new(r), writer)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn request(destination: &AgentId, sender: &AgentId, payload: &[u8]) -> Envelope {
        Envelope::request(
            "SQLTranslationRequest",
            JSON_CONTENT_TYPE,
            payload.to_vec(),
            destination.clone(),
            "c-1",
        )
        .with_sender(sender.clone())
    }

    #[test]
    fn test_directory_newest_claim_wins() {
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let id = AgentId::default_instance("sql_translator");

        let mut directory = Directory::default();
        for conn in [1, 2] {
            directory.connections.insert(
                conn,
                Connection {
                    peer,
                    agents: BTreeSet::new(),
                },
            );
        }
        directory.claim(id.clone(), Route { connection: 1, outbound: tx1 });
        directory.claim(id.clone(), Route { connection: 2, outbound: tx2 });
        assert_eq!(directory.lookup(&id).unwrap().connection, 2);

        // The old connection leaving must not drop the new owner's route.
        assert_eq!(directory.disconnect(1), 0);
        assert_eq!(directory.lookup(&id).unwrap().connection, 2);
        assert_eq!(directory.disconnect(2), 1);
        assert!(directory.lookup(&id).is_none());
    }

    #[tokio::test]
    async fn test_relays_payload_bytes_unchanged() {
        let host = start_host().await;
        let translator = AgentId::default_instance("sql_translator");
        let reply_to = AgentId::new("runtime", "worker-1");

        let (mut serving, _serving_w) = connect(&host, vec![translator.clone()]).await;
        let (_req_r, mut requesting) = connect(&host, vec![reply_to.clone()]).await;
        wait_until(|| host.reachable(&translator) && host.reachable(&reply_to)).await;

        let payload = br#"{"natural_language_query":"q","database_schema":{},"request_id":"c-1"}"#;
        let sent = request(&translator, &reply_to, payload);
        requesting.write_frame(&Frame::Envelope(sent.clone())).await.unwrap();

        match serving.next_frame().await.unwrap() {
            Some(Frame::Envelope(received)) => {
                assert_eq!(received.payload, payload.to_vec());
                assert_eq!(received, sent);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        host.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_nacked() {
        let host = start_host().await;
        let reply_to = AgentId::new("runtime", "worker-1");
        let (mut reader, mut writer) = connect(&host, vec![reply_to.clone()]).await;
        wait_until(|| host.reachable(&reply_to)).await;

        let missing = AgentId::default_instance("nobody");
        writer
            .write_frame(&Frame::Envelope(request(&missing, &reply_to, b"{}")))
            .await
            .unwrap();

        match reader.next_frame().await.unwrap() {
            Some(Frame::Nack {
                correlation_id,
                destination,
                ..
            }) => {
                assert_eq!(correlation_id, "c-1");
                assert_eq!(destination, missing);
            }
            other => panic!("expected nack, got {:?}", other),
        }
        host.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_removes_identities() {
        let host = start_host().await;
        let translator = AgentId::default_instance("sql_translator");
        let (reader, writer) = connect(&host, vec![translator.clone()]).await;
        wait_until(|| host.reachable(&translator)).await;
        assert_eq!(host.connection_count(), 1);

        drop(writer);
        drop(reader);
        wait_until(|| !host.reachable(&translator)).await;
        assert_eq!(host.connection_count(), 0);
        host.stop().await;
    }

    #[tokio::test]
    async fn test_register_adds_identities() {
        let host = start_host().await;
        let (_reader, mut writer) = connect(&host, vec![]).await;
        let extra = AgentId::new("sql_translator", "tenant-a");

        writer
            .write_frame(&Frame::Register {
                agents: vec![extra.clone()],
            })
            .await
            .unwrap();
        wait_until(|| host.reachable(&extra)).await;
        assert_eq!(host.identity_count(), 1);
        host.stop().await;
    }

    #[tokio::test]
    async fn test_relay_preserves_order_between_two_connections() {
        let host = start_host().await;
        let translator = AgentId::default_instance("sql_translator");
        let reply_to = AgentId::new("runtime", "worker-1");

        let (mut serving, _serving_w) = connect(&host, vec![translator.clone()]).await;
        let (_req_r, mut requesting) = connect(&host, vec![reply_to.clone()]).await;
        wait_until(|| host.reachable(&translator) && host.reachable(&reply_to)).await;

        for i in 0..50 {
            let envelope = Envelope::request(
                "SQLTranslationRequest",
                JSON_CONTENT_TYPE,
                format!("{{\"n\":{}}}", i).into_bytes(),
                translator.clone(),
                format!("c-{}", i),
            )
            .with_sender(reply_to.clone());
            requesting.write_frame(&Frame::Envelope(envelope)).await.unwrap();
        }

        for i in 0..50 {
            match serving.next_frame().await.unwrap() {
                Some(Frame::Envelope(received)) => assert_eq!(received.correlation_id, format!("c-{}", i)),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        host.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_destination_does_not_block_other_relays() {
        let mut config = HostConfig::bind("127.0.0.1:0");
        config.status_interval_secs = 0;
        config.connection_queue = 4;
        let host = RendezvousHost::start(config).await.unwrap();

        let stalled = AgentId::default_instance("stalled");
        let healthy = AgentId::default_instance("healthy");
        let reply_to = AgentId::new("runtime", "worker-1");

        // Never read from this connection.
        let (_stalled_r, _stalled_w) = connect(&host, vec![stalled.clone()]).await;
        let (mut healthy_r, _healthy_w) = connect(&host, vec![healthy.clone()]).await;
        let (mut origin_r, mut origin_w) = connect(&host, vec![reply_to.clone()]).await;
        wait_until(|| host.reachable(&stalled) && host.reachable(&healthy) && host.reachable(&reply_to)).await;

        // Enough to fill the socket buffers and the destination queue.
        let bulk = vec![b'x'; 512 * 1024];
        for _ in 0..64 {
            origin_w
                .write_frame(&Frame::Envelope(request(&stalled, &reply_to, &bulk)))
                .await
                .unwrap();
        }
        origin_w
            .write_frame(&Frame::Envelope(request(&healthy, &reply_to, b"{}")))
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(3), healthy_r.next_frame())
            .await
            .expect("healthy destination starved by a stalled one")
            .unwrap();
        assert!(matches!(delivered, Some(Frame::Envelope(e)) if e.destination == healthy));

        let reason = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match origin_r.next_frame().await.unwrap() {
                    Some(Frame::Nack { reason, .. }) => break reason,
                    Some(_) => continue,
                    None => panic!("origin connection closed"),
                }
            }
        })
        .await
        .expect("no nack for the full queue");
        assert_eq!(reason, QUEUE_FULL);

        tokio::time::timeout(Duration::from_secs(5), host.stop())
            .await
            .expect("host stop hung on a stalled peer");
    }
}
