use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

/// The connection state machine only ever moves forward:
///
/// ```ascii
/// Waiting -> Connecting -> Connected -> Disconnecting -> Disconnected
/// ```
///
/// Some steps can be skipped (e.g. a server goes from `Waiting` straight to `Connected`, and a
///  timeout goes to `Disconnected` from any state), but a connection never moves backwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ConnectionStatus {
    Waiting,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::Disconnecting)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseReason {
    Error,
    ClosedByThisPeer,
    ClosedByOtherPeer,
    Timeout,
}

/// Identifies a connection towards the application
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer_addr: SocketAddr,
}

impl Display for ConnectionInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}@{}", self.id, self.peer_addr)
    }
}
