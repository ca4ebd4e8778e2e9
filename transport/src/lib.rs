//! A message-oriented transport on top of UDP, with connections, multiplexed channels and
//!  per-channel delivery guarantees. It is designed for peers that exchange many small messages
//!  (e.g. game state or RPC traffic) and value low latency over strict stream semantics.
//!
//! ## Overview
//!
//! * A [peer::UdpPeer] owns a single UDP socket and multiplexes any number of connections over
//!    it, at most one per remote address
//! * A [connection::UdpConnection] goes through an explicit handshake, is kept alive by pings
//!    (which also measure latency), discovers the path MTU and is closed gracefully or by timeout
//! * Each connection has up to 8 channels per delivery type. A channel provides one of the
//!    following guarantees:
//!   * `Unreliable`: fire and forget, messages may be lost, duplicated or reordered
//!   * `UnreliableSequenced`: messages may be lost, but stale messages are never delivered
//!   * `ReliableUnordered`: every message is delivered exactly once, in arbitrary order
//!   * `ReliableOrdered`: every message is delivered exactly once and in send order
//! * Reliable channels use a sliding window of 64 datagrams with selective acks and
//!    retransmission. Messages that do not fit into the connection's MTU are fragmented
//! * Messages can optionally be encrypted with AES-256-GCM, using a session key from an X25519
//!    key agreement during the handshake
//!
//! ## Header
//!
//! All numbers are in network byte order (BE).
//!
//! ```ascii
//! 0: service flags (u8)
//!    * bit 5-7: delivery type
//!    * bit 2-4: channel (0-7)
//!    * bit 1:   reserved, must be 0
//!    * bit 0:   fragmented
//! 1: message type (bits 4-7, bits 0-3 must be 0)
//! 2: connection key (u16) - chosen at random by the connecting side
//! 4: sequence number (u16) - 0..=65534, wrapping
//! ```
//!
//! Fragmented datagrams carry an additional 6 bytes after the header:
//!
//! ```ascii
//! 6:  fragment group id (u16)
//! 8:  frame number (u16), 1-based
//! 10: number of frames in the group (u16)
//! ```
//!
//! ## Message types
//!
//! * `UserData`: application payload
//! * `DeliveryAck`: acknowledges a datagram on a reliable channel, echoing its sequence number
//! * `ConnectReq` / `ConnectResp`: handshake, payload is the sender's public key if encryption
//!    is enabled
//! * `DisconnectReq` / `DisconnectResp`: graceful close, the request carries an optional payload
//!    for the peer's application
//! * `Ping` / `Pong`: keep-alive and latency measurement
//! * `ExpandMtuRequest` / `ExpandMtuSuccess`: MTU discovery
//!
//! ## Encryption
//!
//! If enabled, each application message is encrypted before it is fragmented:
//!
//! ```ascii
//! 0: ciphertext, including the 16 byte AES-GCM tag
//! *: nonce (12 bytes)
//! ```
//!
//! The datagram header is transmitted in the clear.

pub mod buffers;
pub mod channels;
pub mod config;
pub mod connection;
pub mod datagram;
pub mod event_dispatcher;
pub mod fragmentation;
pub mod network_simulation;
pub mod peer;
pub mod safe_converter;
pub mod send_pipeline;
pub mod sequence_number;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            // .with_max_level(Level::DEBUG)
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
