use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::BufMut;
use crate::buffers::buffer_pool::BufferPool;
use crate::config::UdpConfig;
use crate::connection::status::{CloseReason, ConnectionInfo, ConnectionStatus};
use crate::connection::UdpConnection;
use crate::datagram::{Datagram, DatagramHeader, DeliveryType, MessageType};
use crate::event_dispatcher::{ConnectionEvent, ConnectionHandler};
use crate::send_pipeline::{SendPipeline, SendSocket};

pub fn client_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4001))
}

pub fn server_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4002))
}

pub fn test_config(self_addr: SocketAddr) -> UdpConfig {
    UdpConfig::default_for(self_addr)
}

/// Collects outgoing datagrams instead of sending them, optionally failing with a given error
#[derive(Default)]
pub struct RecordingSocket {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    fail_with: Mutex<Option<io::ErrorKind>>,
}

impl RecordingSocket {
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn fail_with(&self, kind: Option<io::ErrorKind>) {
        *self.fail_with.lock().unwrap() = kind;
    }
}

#[async_trait]
impl SendSocket for RecordingSocket {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<()> {
        if let Some(kind) = *self.fail_with.lock().unwrap() {
            return Err(io::Error::from(kind));
        }
        self.sent.lock().unwrap().push((to, packet_buf.to_vec()));
        Ok(())
    }

    async fn rebind(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records all events, accepting or rejecting incoming connections as configured
pub struct RecordingHandler {
    accept: bool,
    events: Mutex<Vec<(ConnectionInfo, ConnectionEvent)>>,
}

impl RecordingHandler {
    pub fn new(accept: bool) -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler {
            accept,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().unwrap().iter()
            .map(|(_, evt)| evt.clone())
            .collect()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.events().into_iter()
            .filter_map(|evt| match evt {
                ConnectionEvent::MessageReceived { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Option<(CloseReason, Option<Vec<u8>>)> {
        self.events().into_iter()
            .find_map(|evt| match evt {
                ConnectionEvent::Closed { reason, payload } => Some((reason, payload)),
                _ => None,
            })
    }
}

#[async_trait]
impl ConnectionHandler for RecordingHandler {
    fn accept_connection(&self, _peer_addr: SocketAddr) -> bool {
        self.accept
    }

    async fn on_connection_opened(&self, connection: ConnectionInfo) {
        self.events.lock().unwrap().push((connection, ConnectionEvent::Opened));
    }

    async fn on_message_received(&self, connection: ConnectionInfo, message: &[u8], delivery_type: DeliveryType, channel: u8) {
        self.events.lock().unwrap().push((connection, ConnectionEvent::MessageReceived {
            message: message.to_vec(),
            delivery_type,
            channel,
        }));
    }

    async fn on_status_changed(&self, connection: ConnectionInfo, old_status: ConnectionStatus, new_status: ConnectionStatus) {
        self.events.lock().unwrap().push((connection, ConnectionEvent::StatusChanged { old_status, new_status }));
    }

    async fn on_connection_closed(&self, connection: ConnectionInfo, reason: CloseReason, payload: Option<Vec<u8>>) {
        self.events.lock().unwrap().push((connection, ConnectionEvent::Closed { reason, payload }));
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    ToServer,
    ToClient,
}

pub fn decode(pool: &Arc<BufferPool>, bytes: &[u8]) -> Datagram {
    let mut buf = pool.acquire();
    buf.put_slice(bytes);
    Datagram::decode(buf).unwrap()
}

/// Two connections wired to each other through recording sockets. Datagrams travel only when
///  the test pumps them, so tests control loss and reordering.
pub struct ConnectionPair {
    pub client: UdpConnection,
    pub server: UdpConnection,
    pub client_socket: Arc<RecordingSocket>,
    pub server_socket: Arc<RecordingSocket>,
    pub client_handler: Arc<RecordingHandler>,
    pub server_handler: Arc<RecordingHandler>,
    pool: Arc<BufferPool>,
}

impl ConnectionPair {
    pub fn new(client_config: UdpConfig, server_config: UdpConfig) -> ConnectionPair {
        ConnectionPair::with_server_policy(client_config, server_config, true)
    }

    pub fn with_server_policy(client_config: UdpConfig, server_config: UdpConfig, accept: bool) -> ConnectionPair {
        let pool = Arc::new(BufferPool::new(client_config.max_datagram_size.max(server_config.max_datagram_size), 64));
        let client_socket = Arc::new(RecordingSocket::default());
        let server_socket = Arc::new(RecordingSocket::default());
        let client_handler = RecordingHandler::new(true);
        let server_handler = RecordingHandler::new(accept);

        let connection_key = 4711;
        let client = UdpConnection::new(
            ConnectionInfo { id: 1, peer_addr: server_addr() },
            connection_key,
            Arc::new(client_config),
            pool.clone(),
            Arc::new(SendPipeline::new(client_socket.clone(), None)),
            client_handler.clone(),
        );
        let server = UdpConnection::new(
            ConnectionInfo { id: 2, peer_addr: client_addr() },
            connection_key,
            Arc::new(server_config),
            pool.clone(),
            Arc::new(SendPipeline::new(server_socket.clone(), None)),
            server_handler.clone(),
        );

        ConnectionPair {
            client,
            server,
            client_socket,
            server_socket,
            client_handler,
            server_handler,
            pool,
        }
    }

    pub fn default_pair() -> ConnectionPair {
        ConnectionPair::new(test_config(client_addr()), test_config(server_addr()))
    }

    pub async fn connected_pair() -> ConnectionPair {
        let result = ConnectionPair::default_pair();
        result.establish().await;
        result
    }

    pub async fn establish(&self) {
        let pending = self.client.start_connect().await.unwrap();
        self.pump().await;
        pending.wait().await.unwrap();
    }

    pub fn datagram(&self, header: DatagramHeader, payload: &[u8]) -> Datagram {
        Datagram::new(&self.pool, header, payload).unwrap()
    }

    pub fn decode(&self, bytes: &[u8]) -> Datagram {
        decode(&self.pool, bytes)
    }

    pub fn message_types(&self, sent: &[(SocketAddr, Vec<u8>)]) -> Vec<MessageType> {
        sent.iter()
            .map(|(_, bytes)| self.decode(bytes).message_type())
            .collect()
    }

    /// Delivers datagrams in both directions until there are none left
    pub async fn pump(&self) {
        self.pump_with(|_, _| true, false).await
    }

    /// Delivers datagrams until there are none left. `filter` decides for each datagram
    ///  whether it arrives, and `reverse` delivers each batch in reverse order.
    pub async fn pump_with(&self, mut filter: impl FnMut(Direction, &Datagram) -> bool, reverse: bool) {
        for _ in 0..1000 {
            let mut to_server = self.client_socket.take();
            let mut to_client = self.server_socket.take();
            if to_server.is_empty() && to_client.is_empty() {
                return;
            }
            if reverse {
                to_server.reverse();
                to_client.reverse();
            }

            for (_, bytes) in to_server {
                let datagram = self.decode(&bytes);
                if filter(Direction::ToServer, &datagram) {
                    self.server.on_datagram(datagram).await;
                }
            }
            for (_, bytes) in to_client {
                let datagram = self.decode(&bytes);
                if filter(Direction::ToClient, &datagram) {
                    self.client.on_datagram(datagram).await;
                }
            }
        }
        panic!("datagrams kept flowing");
    }

    /// Advances time, polls both sides and pumps the resulting datagrams
    pub async fn tick(&self, duration: std::time::Duration) {
        tokio::time::advance(duration).await;
        self.client.poll_events().await.unwrap();
        self.server.poll_events().await.unwrap();
        self.pump().await;
    }
}
