use std::sync::Arc;
use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;
use crate::channels::{Channel, ChannelDescriptor, DatagramLink, SendOutcome};
use crate::datagram::Datagram;
use crate::sequence_number::SequenceNumber;

/// Fire-and-forget: every datagram is sent once, and every received datagram is delivered
pub struct UnreliableChannel {
    descriptor: ChannelDescriptor,
    link: Arc<dyn DatagramLink>,
    next_sequence_out: Mutex<SequenceNumber>,
}

impl UnreliableChannel {
    pub fn new(descriptor: ChannelDescriptor, link: Arc<dyn DatagramLink>) -> UnreliableChannel {
        UnreliableChannel {
            descriptor,
            link,
            next_sequence_out: Mutex::new(SequenceNumber::ZERO),
        }
    }
}

async fn send_with_next_sequence(next_sequence_out: &Mutex<SequenceNumber>, link: &dyn DatagramLink, mut datagram: Datagram) -> anyhow::Result<SendOutcome> {
    {
        let mut next = next_sequence_out.lock().await;
        datagram.set_sequence(*next);
        *next = next.next();
    }
    link.transmit(&datagram).await?;
    Ok(SendOutcome::Sent)
}

#[async_trait]
impl Channel for UnreliableChannel {
    fn descriptor(&self) -> ChannelDescriptor {
        self.descriptor
    }

    async fn on_datagram(&self, datagram: Datagram) -> anyhow::Result<Vec<Datagram>> {
        self.descriptor.check_datagram(&datagram)?;
        Ok(vec![datagram])
    }

    async fn send_datagram(&self, datagram: Datagram) -> anyhow::Result<SendOutcome> {
        self.descriptor.check_datagram(&datagram)?;
        send_with_next_sequence(&self.next_sequence_out, self.link.as_ref(), datagram).await
    }

    async fn on_ack_received(&self, _ack: &Datagram) -> anyhow::Result<()> {
        bail!("acks are not supported on unreliable channel {:?}", self.descriptor)
    }

    async fn poll_events(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Unreliable, but never delivers a datagram that is older than (or a duplicate of) one that
///  was already delivered
pub struct UnreliableSequencedChannel {
    descriptor: ChannelDescriptor,
    link: Arc<dyn DatagramLink>,
    next_sequence_out: Mutex<SequenceNumber>,
    last_accepted: Mutex<Option<SequenceNumber>>,
}

impl UnreliableSequencedChannel {
    pub fn new(descriptor: ChannelDescriptor, link: Arc<dyn DatagramLink>) -> UnreliableSequencedChannel {
        UnreliableSequencedChannel {
            descriptor,
            link,
            next_sequence_out: Mutex::new(SequenceNumber::ZERO),
            last_accepted: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for UnreliableSequencedChannel {
    fn descriptor(&self) -> ChannelDescriptor {
        self.descriptor
    }

    async fn on_datagram(&self, datagram: Datagram) -> anyhow::Result<Vec<Datagram>> {
        self.descriptor.check_datagram(&datagram)?;

        let mut last_accepted = self.last_accepted.lock().await;
        if let Some(last) = *last_accepted {
            if datagram.sequence().relative_to(last) <= 0 {
                trace!("dropping stale datagram #{} on {:?}, last accepted was #{}", datagram.sequence(), self.descriptor, last);
                return Ok(vec![]);
            }
        }
        *last_accepted = Some(datagram.sequence());
        Ok(vec![datagram])
    }

    async fn send_datagram(&self, datagram: Datagram) -> anyhow::Result<SendOutcome> {
        self.descriptor.check_datagram(&datagram)?;
        send_with_next_sequence(&self.next_sequence_out, self.link.as_ref(), datagram).await
    }

    async fn on_ack_received(&self, _ack: &Datagram) -> anyhow::Result<()> {
        bail!("acks are not supported on unreliable channel {:?}", self.descriptor)
    }

    async fn poll_events(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
