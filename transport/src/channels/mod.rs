//! Channels implement the per-(channel, delivery type) delivery guarantees on top of a
//!  connection. A connection creates its channels lazily on first use, and routes datagrams
//!  to them by [ChannelDescriptor].

pub mod reliable;
pub mod unreliable;

use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::buffers::buffer_pool::BufferPool;
use crate::channels::reliable::ReliableChannel;
use crate::channels::unreliable::{UnreliableChannel, UnreliableSequencedChannel};
use crate::datagram::{Datagram, DeliveryType, MAX_CHANNEL};

/// The key of a connection's channel table
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ChannelDescriptor {
    pub channel: u8,
    pub delivery_type: DeliveryType,
}

impl ChannelDescriptor {
    pub fn new(channel: u8, delivery_type: DeliveryType) -> anyhow::Result<ChannelDescriptor> {
        if channel > MAX_CHANNEL {
            bail!("channel {} is out of range (max {})", channel, MAX_CHANNEL);
        }
        Ok(ChannelDescriptor { channel, delivery_type })
    }

    pub fn check_datagram(&self, datagram: &Datagram) -> anyhow::Result<()> {
        if datagram.descriptor() != *self {
            bail!("datagram for {:?} was routed to channel {:?}", datagram.descriptor(), self);
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    /// the datagram(s) went out on the socket
    Sent,
    /// the send window is full, and the datagram(s) will be sent as the window advances
    Queued,
    /// the message was discarded, e.g. because it exceeded the MTU on an unreliable channel
    Dropped,
}

/// This is the abstraction through which channels put datagrams on the wire. It is implemented
///  by the connection and introduced to facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramLink: Send + Sync + 'static {
    /// An `Err` means the datagram could not be sent, and there is no point in retrying
    async fn transmit(&self, datagram: &Datagram) -> anyhow::Result<()>;

    /// The delay after which an unacknowledged datagram is sent again, derived from the
    ///  connection's latency
    fn resend_delay(&self) -> Duration;
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn descriptor(&self) -> ChannelDescriptor;

    /// Handles an incoming datagram, returning those datagrams that are released to the
    ///  connection as a result, in delivery order. This may be empty (the datagram was
    ///  dropped or buffered) or contain several datagrams (the datagram filled a gap).
    async fn on_datagram(&self, datagram: Datagram) -> anyhow::Result<Vec<Datagram>>;

    async fn send_datagram(&self, datagram: Datagram) -> anyhow::Result<SendOutcome>;

    async fn on_ack_received(&self, ack: &Datagram) -> anyhow::Result<()>;

    /// periodic housekeeping, e.g. retransmission
    async fn poll_events(&self) -> anyhow::Result<()>;
}

pub fn create_channel(
    descriptor: ChannelDescriptor,
    connection_key: u16,
    buffer_pool: Arc<BufferPool>,
    link: Arc<dyn DatagramLink>,
) -> Arc<dyn Channel> {
    match descriptor.delivery_type {
        DeliveryType::Unreliable => Arc::new(UnreliableChannel::new(descriptor, link)),
        DeliveryType::UnreliableSequenced => Arc::new(UnreliableSequencedChannel::new(descriptor, link)),
        DeliveryType::ReliableOrdered | DeliveryType::ReliableUnordered =>
            Arc::new(ReliableChannel::new(descriptor, connection_key, buffer_pool, link)),
    }
}
