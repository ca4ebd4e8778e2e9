use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;
use crate::buffers::buffer_pool::{BufferPool, PooledBuf};
use crate::channels::SendOutcome;
use crate::config::UdpConfig;
use crate::connection::status::{ConnectionInfo, ConnectionStatus};
use crate::connection::UdpConnection;
use crate::datagram::{Datagram, DeliveryType, MessageType};
use crate::event_dispatcher::ConnectionHandler;
use crate::network_simulation::SimulatedFate;
use crate::send_pipeline::{classify_socket_error, PeerSocket, SendPipeline, SendSocket, SocketErrorKind};

/// UdpPeer is where everything comes together: it owns the UDP socket, routes incoming
///  datagrams to their connections, and drives all connections' periodic housekeeping.
///
/// A peer can both accept incoming connections and initiate outgoing ones. There is at most one
///  connection per remote address.
#[derive(Clone)]
pub struct UdpPeer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    config: Arc<UdpConfig>,
    socket: Arc<PeerSocket>,
    buffer_pool: Arc<BufferPool>,
    pipeline: Arc<SendPipeline>,
    handler: Arc<dyn ConnectionHandler>,
    connections: RwLock<FxHashMap<SocketAddr, Arc<UdpConnection>>>,
    next_connection_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl UdpPeer {
    pub async fn new(config: UdpConfig, handler: Arc<dyn ConnectionHandler>) -> anyhow::Result<UdpPeer> {
        config.validate()?;

        let socket = Arc::new(PeerSocket::bind(config.self_addr).await?);
        if config.network_simulation.is_some() {
            warn!("network simulation is active - this is for testing and should never be used in production");
        }
        if !config.encryption {
            info!("initializing without encryption");
        }

        let buffer_pool = Arc::new(BufferPool::new(config.max_datagram_size, config.buffer_pool_size));
        let pipeline = Arc::new(SendPipeline::new(socket.clone(), config.network_simulation.clone()));
        let (shutdown, _) = watch::channel(false);

        Ok(UdpPeer {
            inner: Arc::new(PeerInner {
                config: Arc::new(config),
                socket,
                buffer_pool,
                pipeline,
                handler,
                connections: Default::default(),
                next_connection_id: AtomicU64::new(1),
                shutdown,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.socket.local_addr()
    }

    fn new_connection(&self, peer_addr: SocketAddr, connection_key: u16) -> Arc<UdpConnection> {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(UdpConnection::new(
            ConnectionInfo { id, peer_addr },
            connection_key,
            self.inner.config.clone(),
            self.inner.buffer_pool.clone(),
            self.inner.pipeline.clone(),
            self.inner.handler.clone(),
        ))
    }

    /// Opens a connection to a remote peer, returning when the handshake is complete.
    ///
    /// NB: This relies on [UdpPeer::run] running concurrently to receive the peer's response
    pub async fn connect(&self, peer_addr: SocketAddr) -> anyhow::Result<Arc<UdpConnection>> {
        let connection = {
            let mut connections = self.inner.connections.write().await;
            if let Some(existing) = connections.get(&peer_addr) {
                if existing.status().await != ConnectionStatus::Disconnected {
                    bail!("there is already a connection to {:?}", peer_addr);
                }
            }

            let connection = self.new_connection(peer_addr, rand::random());
            connections.insert(peer_addr, connection.clone());
            connection
        };

        connection.connect().await?;
        Ok(connection)
    }

    pub async fn connection(&self, peer_addr: SocketAddr) -> Option<Arc<UdpConnection>> {
        self.inner.connections.read().await
            .get(&peer_addr)
            .cloned()
    }

    pub async fn connections(&self) -> Vec<Arc<UdpConnection>> {
        self.inner.connections.read().await
            .values()
            .cloned()
            .collect()
    }

    pub async fn send_to(&self, peer_addr: SocketAddr, message: &[u8], delivery_type: DeliveryType, channel: u8) -> anyhow::Result<SendOutcome> {
        match self.connection(peer_addr).await {
            Some(connection) => connection.send(message, delivery_type, channel).await,
            None => bail!("no connection to {:?}", peer_addr),
        }
    }

    /// Signals [UdpPeer::run] to close all connections and terminate
    pub fn shutdown(&self) {
        info!("shutting down peer on {:?}", self.local_addr());
        self.inner.shutdown.send_replace(true);
    }

    /// The peer's main loop: receives datagrams and polls connections until [UdpPeer::shutdown]
    ///  is called. An unexpected failure while polling closes all connections and terminates the
    ///  loop with an error.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("starting receive loop on {:?}", self.local_addr());

        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = self.inner.buffer_pool.acquire();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            buf.maximize_len();
            let socket = self.inner.socket.current();

            select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        error!("unexpected error polling connections, shutting down: {}", e);
                        self.close_all().await;
                        return Err(e);
                    }
                }
                received = socket.recv_from(buf.as_mut()) => match received {
                    Ok((num_read, from)) => {
                        buf.truncate(num_read);
                        let received = std::mem::replace(&mut buf, self.inner.buffer_pool.acquire());
                        self.on_received(received, from).await;
                    }
                    Err(e) => self.on_receive_error(e).await,
                },
            }
        }

        self.close_all().await;
        info!("receive loop on {:?} terminated", self.local_addr());
        Ok(())
    }

    async fn on_received(&self, buf: PooledBuf, from: SocketAddr) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

        if let Some(simulation) = &self.inner.config.network_simulation {
            match simulation.fate() {
                SimulatedFate::Lost => {
                    trace!(parent: &span, "simulation: dropping incoming datagram from {:?}", from);
                    return;
                }
                SimulatedFate::Delayed(delay) if !delay.is_zero() => {
                    let peer = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        peer.on_datagram(buf, from).await;
                    }.instrument(span));
                    return;
                }
                SimulatedFate::Delayed(_) => {}
            }
        }

        self.on_datagram(buf, from)
            .instrument(span)
            .await;
    }

    async fn on_datagram(&self, buf: PooledBuf, from: SocketAddr) {
        trace!("received {} bytes from {:?}", buf.len(), from);

        let datagram = match Datagram::decode(buf) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("dropping malformed datagram from {:?}: {}", from, e);
                return;
            }
        };

        let existing = self.connection(from).await;
        let connection = match existing {
            Some(connection) if connection.connection_key() == datagram.connection_key() => connection,
            _ if datagram.message_type() == MessageType::ConnectReq => {
                match self.accept_connection(from, datagram.connection_key()).await {
                    Some(connection) => connection,
                    None => return,
                }
            }
            Some(_) => {
                debug!("dropping {:?} from {:?} with unknown connection key {}", datagram.message_type(), from, datagram.connection_key());
                return;
            }
            None => {
                debug!("dropping {:?} from {:?} without a connection", datagram.message_type(), from);
                return;
            }
        };

        connection.on_datagram(datagram)
            .instrument(Span::current())
            .await;
    }

    /// Registers a new incoming connection for a ConnectReq. A connection request with a new key
    ///  replaces an existing connection only if that is closed.
    async fn accept_connection(&self, peer_addr: SocketAddr, connection_key: u16) -> Option<Arc<UdpConnection>> {
        if !self.inner.config.accept_incoming_connections {
            debug!("dropping connection request from {:?}: incoming connections are disabled", peer_addr);
            return None;
        }

        let mut connections = self.inner.connections.write().await;
        if let Some(existing) = connections.get(&peer_addr) {
            if existing.connection_key() == connection_key {
                return Some(existing.clone());
            }
            if existing.status().await != ConnectionStatus::Disconnected {
                debug!("dropping connection request from {:?}: there is an open connection with a different key", peer_addr);
                return None;
            }
            debug!("replacing closed connection {} by a new incoming connection", existing.info());
        }

        let connection = self.new_connection(peer_addr, connection_key);
        connections.insert(peer_addr, connection.clone());
        Some(connection)
    }

    async fn on_receive_error(&self, e: io::Error) {
        match classify_socket_error(&e) {
            SocketErrorKind::Benign => {
                debug!("transient socket error on receive: {}", e);
            }
            SocketErrorKind::Recoverable => {
                warn!("socket error on receive: {} - re-binding", e);
                if let Err(e) = self.inner.socket.rebind().await {
                    error!("error re-binding socket: {}", e);
                }
            }
            SocketErrorKind::Fatal => {
                // ICMP 'unreachable' reported on receive: the affected peer is not known here
                debug!("peer unreachable: {}", e);
            }
        }
    }

    async fn poll(&self) -> anyhow::Result<()> {
        for connection in self.connections().await {
            connection.poll_events().await?;
        }
        self.purge_disconnected().await;
        Ok(())
    }

    async fn purge_disconnected(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (addr, connection) in self.inner.connections.read().await.iter() {
            if let Some(disconnected_at) = connection.disconnected_at().await {
                if now.duration_since(disconnected_at) >= self.inner.config.linger_timeout {
                    expired.push((*addr, connection.info().id));
                }
            }
        }
        if expired.is_empty() {
            return;
        }

        let mut connections = self.inner.connections.write().await;
        for (addr, id) in expired {
            // the connection may have been replaced in the meantime
            if connections.get(&addr).map(|c| c.info().id) == Some(id) {
                debug!("purging closed connection #{} to {:?}", id, addr);
                connections.remove(&addr);
            }
        }
    }

    async fn close_all(&self) {
        for connection in self.connections().await {
            connection.shutdown().await;
        }
    }
}
