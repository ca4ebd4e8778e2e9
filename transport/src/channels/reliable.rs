//! Sliding-window ARQ for the reliable delivery types.
//!
//! The sender keeps up to [WINDOW_SIZE] datagrams in flight, retransmitting each one until it
//!  is acknowledged. Datagrams beyond the window are queued and go out as the window advances.
//!
//! The receiver acknowledges every datagram inside its window immediately (including duplicates,
//!  since the original ack may have been lost). For `ReliableOrdered`, datagrams arriving ahead
//!  of a gap are withheld until the gap is filled; for `ReliableUnordered` they are delivered
//!  right away, and only a flag is kept to filter out duplicates.
//!
//! Window slots live in fixed-size arrays. A sequence number's slot is its ring position relative
//!  to the window base (`base_slot + relative(sequence, base)`), rather than `sequence % WINDOW_SIZE`:
//!  the sequence space is not a multiple of the window size, so the latter would collide when the
//!  window straddles the wrap-around point.

use std::collections::VecDeque;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::buffers::buffer_pool::BufferPool;
use crate::channels::{Channel, ChannelDescriptor, DatagramLink, SendOutcome};
use crate::datagram::{Datagram, DeliveryType};
use crate::safe_converter::PrecheckedCast;
use crate::sequence_number::SequenceNumber;

pub const WINDOW_SIZE: usize = 64;
const WINDOW_SIZE_I32: i32 = WINDOW_SIZE as i32;

struct PendingPacket {
    datagram: Datagram,
    sent_at: Instant,
    resend_count: u32,
    ack_received: bool,
}

struct SendState {
    next_sequence_out: SequenceNumber,
    /// datagrams that did not fit into the send window, in submission order
    delayed: VecDeque<Datagram>,
}

struct AckState {
    window_start: SequenceNumber,
    base_slot: usize,
    pending: Vec<Option<PendingPacket>>,
}

impl AckState {
    fn slot(&self, relative: i32) -> usize {
        (self.base_slot + relative.prechecked_cast()) % WINDOW_SIZE
    }

    fn advance(&mut self) {
        self.window_start = self.window_start.next();
        self.base_slot = (self.base_slot + 1) % WINDOW_SIZE;
    }

    fn num_in_flight(&self, next_sequence_out: SequenceNumber) -> i32 {
        next_sequence_out.relative_to(self.window_start)
    }
}

struct ReceiveState {
    window_start: SequenceNumber,
    base_slot: usize,
    /// ordered only: datagrams that arrived ahead of a gap
    withheld: Vec<Option<Datagram>>,
    /// unordered only: datagrams ahead of the window base that were delivered already
    early_arrived: Vec<bool>,
}

impl ReceiveState {
    fn slot(&self, relative: i32) -> usize {
        (self.base_slot + relative.prechecked_cast()) % WINDOW_SIZE
    }

    fn advance(&mut self) {
        self.window_start = self.window_start.next();
        self.base_slot = (self.base_slot + 1) % WINDOW_SIZE;
    }
}

/// NB: Operations that need both send and ack state acquire them in this order: send, then ack.
pub struct ReliableChannel {
    descriptor: ChannelDescriptor,
    ordered: bool,
    connection_key: u16,
    buffer_pool: Arc<BufferPool>,
    link: Arc<dyn DatagramLink>,
    send_state: Mutex<SendState>,
    ack_state: Mutex<AckState>,
    receive_state: Mutex<ReceiveState>,
}

impl ReliableChannel {
    pub fn new(
        descriptor: ChannelDescriptor,
        connection_key: u16,
        buffer_pool: Arc<BufferPool>,
        link: Arc<dyn DatagramLink>,
    ) -> ReliableChannel {
        assert!(descriptor.delivery_type.is_reliable());

        ReliableChannel {
            descriptor,
            ordered: descriptor.delivery_type == DeliveryType::ReliableOrdered,
            connection_key,
            buffer_pool,
            link,
            send_state: Mutex::new(SendState {
                next_sequence_out: SequenceNumber::ZERO,
                delayed: VecDeque::new(),
            }),
            ack_state: Mutex::new(AckState {
                window_start: SequenceNumber::ZERO,
                base_slot: 0,
                pending: (0..WINDOW_SIZE).map(|_| None).collect(),
            }),
            receive_state: Mutex::new(ReceiveState {
                window_start: SequenceNumber::ZERO,
                base_slot: 0,
                withheld: (0..WINDOW_SIZE).map(|_| None).collect(),
                early_arrived: vec![false; WINDOW_SIZE],
            }),
        }
    }

    /// Assigns the next sequence number, registers the datagram as in flight and transmits it.
    ///  The caller ensures that there is room in the window.
    async fn transmit_new(&self, send_state: &mut SendState, ack_state: &mut AckState, mut datagram: Datagram) -> anyhow::Result<()> {
        let sequence = send_state.next_sequence_out;
        datagram.set_sequence(sequence);
        send_state.next_sequence_out = sequence.next();

        let slot = ack_state.slot(ack_state.num_in_flight(sequence));
        trace!("sending #{} on {:?} in slot {}", sequence, self.descriptor, slot);

        let result = self.link.transmit(&datagram).await;
        // the datagram stays in flight even if transmission failed: it is retransmitted later
        ack_state.pending[slot] = Some(PendingPacket {
            datagram,
            sent_at: Instant::now(),
            resend_count: 0,
            ack_received: false,
        });
        result
    }

    async fn flush_delayed(&self, send_state: &mut SendState) -> anyhow::Result<()> {
        if send_state.delayed.is_empty() {
            return Ok(());
        }

        let mut ack_state = self.ack_state.lock().await;
        while ack_state.num_in_flight(send_state.next_sequence_out) < WINDOW_SIZE_I32 {
            let Some(datagram) = send_state.delayed.pop_front() else {
                break;
            };
            self.transmit_new(send_state, &mut ack_state, datagram).await?;
        }
        Ok(())
    }

    async fn send_ack(&self, sequence: SequenceNumber) -> anyhow::Result<()> {
        let ack = Datagram::new_ack(&self.buffer_pool, self.connection_key, self.descriptor, sequence)?;
        self.link.transmit(&ack).await
    }

    async fn resend_overdue(&self) -> anyhow::Result<()> {
        let resend_delay = self.link.resend_delay();
        let now = Instant::now();

        let mut ack_state = self.ack_state.lock().await;
        for pending in ack_state.pending.iter_mut().flatten() {
            if pending.ack_received {
                continue;
            }
            if now.duration_since(pending.sent_at) >= resend_delay * (pending.resend_count + 1) {
                debug!("resending #{} on {:?} (resend #{})", pending.datagram.sequence(), self.descriptor, pending.resend_count + 1);
                pending.resend_count += 1;
                self.link.transmit(&pending.datagram).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for ReliableChannel {
    fn descriptor(&self) -> ChannelDescriptor {
        self.descriptor
    }

    async fn on_datagram(&self, datagram: Datagram) -> anyhow::Result<Vec<Datagram>> {
        self.descriptor.check_datagram(&datagram)?;
        let sequence = datagram.sequence();

        let mut receive_state = self.receive_state.lock().await;
        let relative = sequence.relative_to(receive_state.window_start);

        if relative >= WINDOW_SIZE_I32 {
            debug!("dropping #{} on {:?}: too far ahead of the receive window at #{}", sequence, self.descriptor, receive_state.window_start);
            return Ok(vec![]);
        }

        self.send_ack(sequence).await?;

        if relative < 0 {
            trace!("dropping duplicate #{} on {:?}", sequence, self.descriptor);
            return Ok(vec![]);
        }

        let mut delivered = Vec::new();
        if relative == 0 {
            delivered.push(datagram);
            receive_state.advance();

            if self.ordered {
                loop {
                    let base_slot = receive_state.base_slot;
                    let Some(withheld) = receive_state.withheld[base_slot].take() else {
                        break;
                    };
                    delivered.push(withheld);
                    receive_state.advance();
                }
            }
            else {
                loop {
                    let base_slot = receive_state.base_slot;
                    if !receive_state.early_arrived[base_slot] {
                        break;
                    }
                    receive_state.early_arrived[base_slot] = false;
                    receive_state.advance();
                }
            }
            return Ok(delivered);
        }

        let slot = receive_state.slot(relative);
        if self.ordered {
            if receive_state.withheld[slot].is_some() {
                trace!("dropping duplicate #{} on {:?}", sequence, self.descriptor);
            }
            else {
                trace!("withholding #{} on {:?} until #{} arrives", sequence, self.descriptor, receive_state.window_start);
                receive_state.withheld[slot] = Some(datagram);
            }
        }
        else if receive_state.early_arrived[slot] {
            trace!("dropping duplicate #{} on {:?}", sequence, self.descriptor);
        }
        else {
            receive_state.early_arrived[slot] = true;
            delivered.push(datagram);
        }
        Ok(delivered)
    }

    async fn send_datagram(&self, datagram: Datagram) -> anyhow::Result<SendOutcome> {
        self.descriptor.check_datagram(&datagram)?;

        let mut send_state = self.send_state.lock().await;
        self.flush_delayed(&mut send_state).await?;
        if !send_state.delayed.is_empty() {
            send_state.delayed.push_back(datagram);
            return Ok(SendOutcome::Queued);
        }

        let mut ack_state = self.ack_state.lock().await;
        if ack_state.num_in_flight(send_state.next_sequence_out) >= WINDOW_SIZE_I32 {
            trace!("send window on {:?} is full, queueing datagram", self.descriptor);
            send_state.delayed.push_back(datagram);
            return Ok(SendOutcome::Queued);
        }

        self.transmit_new(&mut send_state, &mut ack_state, datagram).await?;
        Ok(SendOutcome::Sent)
    }

    async fn on_ack_received(&self, ack: &Datagram) -> anyhow::Result<()> {
        self.descriptor.check_datagram(ack)?;
        let sequence = ack.sequence();

        let window_advanced = {
            let mut ack_state = self.ack_state.lock().await;
            let relative = sequence.relative_to(ack_state.window_start);

            if relative < 0 {
                trace!("ignoring stale ack #{} on {:?}", sequence, self.descriptor);
                return Ok(());
            }
            if relative >= WINDOW_SIZE_I32 {
                debug!("ignoring ack #{} on {:?}: outside the send window", sequence, self.descriptor);
                return Ok(());
            }

            let slot = ack_state.slot(relative);
            let in_flight = matches!(&ack_state.pending[slot], Some(pending) if pending.datagram.sequence() == sequence);
            if !in_flight {
                debug!("ignoring ack #{} on {:?}: no such datagram in flight", sequence, self.descriptor);
                return Ok(());
            }

            if relative > 0 {
                trace!("early ack #{} on {:?}", sequence, self.descriptor);
                if let Some(pending) = ack_state.pending[slot].as_mut() {
                    pending.ack_received = true;
                }
                return Ok(());
            }

            ack_state.pending[slot] = None;
            ack_state.advance();
            loop {
                let base_slot = ack_state.base_slot;
                if !matches!(&ack_state.pending[base_slot], Some(pending) if pending.ack_received) {
                    break;
                }
                ack_state.pending[base_slot] = None;
                ack_state.advance();
            }
            trace!("send window on {:?} advanced to #{}", self.descriptor, ack_state.window_start);
            true
        };

        if window_advanced {
            let mut send_state = self.send_state.lock().await;
            self.flush_delayed(&mut send_state).await?;
        }
        Ok(())
    }

    async fn poll_events(&self) -> anyhow::Result<()> {
        {
            let mut send_state = self.send_state.lock().await;
            self.flush_delayed(&mut send_state).await?;
        }
        self.resend_overdue().await
    }
}

#[cfg(test)]
impl ReliableChannel {
    async fn ack_window_start(&self) -> SequenceNumber {
        self.ack_state.lock().await.window_start
    }

    async fn num_delayed(&self) -> usize {
        self.send_state.lock().await.delayed.len()
    }
}
