use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, PoisonError};
use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};
use crate::config::NetworkSimulation;
use crate::network_simulation::SimulatedFate;

/// How a socket error affects the transport
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketErrorKind {
    /// transient, the datagram is lost but everything else is fine
    Benign,
    /// the socket is unusable and needs to be re-bound
    Recoverable,
    /// the peer is unreachable, and the connection to it is closed
    Fatal,
}

pub fn classify_socket_error(e: &io::Error) -> SocketErrorKind {
    match e.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => SocketErrorKind::Fatal,
        io::ErrorKind::NotConnected | io::ErrorKind::AddrNotAvailable | io::ErrorKind::BrokenPipe => SocketErrorKind::Recoverable,
        _ => SocketErrorKind::Benign,
    }
}

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<()>;

    /// replace an unusable socket by a new one bound to the same local address
    async fn rebind(&self) -> anyhow::Result<()>;
}

/// The peer's UDP socket. The socket can be replaced after an error that renders it unusable,
///  so users fetch the current socket for each operation.
pub struct PeerSocket {
    local_addr: SocketAddr,
    socket: RwLock<Arc<UdpSocket>>,
}

impl PeerSocket {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<PeerSocket> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("bound socket to {:?}", local_addr);

        Ok(PeerSocket {
            local_addr,
            socket: RwLock::new(Arc::new(socket)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn current(&self) -> Arc<UdpSocket> {
        self.socket.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl SendSocket for PeerSocket {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);
        self.current().send_to(packet_buf, to).await
            .map(|_| ())
    }

    async fn rebind(&self) -> anyhow::Result<()> {
        warn!("re-binding socket to {:?}", self.local_addr);
        let socket = UdpSocket::bind(self.local_addr).await?;
        *self.socket.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(socket);
        Ok(())
    }
}

/// All outgoing datagrams go through here: optional network simulation, and translating socket
///  errors into their effect on the transport
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    simulation: Option<NetworkSimulation>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, simulation: Option<NetworkSimulation>) -> SendPipeline {
        SendPipeline { socket, simulation }
    }

    /// Returns an error only if the failure is fatal for the connection to `to`. Other failures
    ///  are logged and handled here.
    pub async fn send(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        if let Some(simulation) = &self.simulation {
            match simulation.fate() {
                SimulatedFate::Lost => {
                    trace!("simulation: dropping outgoing datagram to {:?}", to);
                    return Ok(());
                }
                SimulatedFate::Delayed(delay) if !delay.is_zero() => {
                    let socket = self.socket.clone();
                    let packet_buf = packet_buf.to_vec();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = socket.send_packet(to, &packet_buf).await {
                            debug!("simulation: error sending delayed datagram to {:?}: {}", to, e);
                        }
                    });
                    return Ok(());
                }
                SimulatedFate::Delayed(_) => {}
            }
        }

        let Err(e) = self.socket.send_packet(to, packet_buf).await else {
            return Ok(());
        };

        match classify_socket_error(&e) {
            SocketErrorKind::Benign => {
                debug!("transient error sending to {:?}: {}", to, e);
                Ok(())
            }
            SocketErrorKind::Recoverable => {
                warn!("socket error sending to {:?}: {} - re-binding", to, e);
                if let Err(e) = self.socket.rebind().await {
                    error!("error re-binding socket: {}", e);
                }
                Ok(())
            }
            SocketErrorKind::Fatal => {
                warn!("peer {:?} is unreachable: {}", to, e);
                Err(anyhow!("peer {:?} is unreachable: {}", to, e))
            }
        }
    }
}
