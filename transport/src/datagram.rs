use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::buffers::buffer_pool::{BufferPool, PooledBuf};
use crate::channels::ChannelDescriptor;
use crate::sequence_number::{SequenceNumber, MAX_SEQUENCE};

pub const HEADER_SIZE: usize = 6;
pub const FRAGMENTED_HEADER_SIZE: usize = HEADER_SIZE + 6;
pub const MAX_CHANNEL: u8 = 7;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct ServiceFlags: u8 {
        const FRAGMENTED    = 0b0000_0001;
        const RESERVED      = 0b0000_0010;
        const MASK_CHANNEL  = 0b0001_1100;
        const MASK_DELIVERY = 0b1110_0000;
    }
}

const SHIFT_CHANNEL: u8 = 2;
const SHIFT_DELIVERY: u8 = 5;
const SHIFT_MESSAGE_TYPE: u8 = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeliveryType {
    Unreliable = 0,
    UnreliableSequenced = 1,
    ReliableOrdered = 2,
    ReliableUnordered = 3,
}

impl DeliveryType {
    pub fn is_reliable(&self) -> bool {
        matches!(self, DeliveryType::ReliableOrdered | DeliveryType::ReliableUnordered)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
    Ping = 4,
    Pong = 5,
    ExpandMtuRequest = 6,
    ExpandMtuSuccess = 7,
    DeliveryAck = 8,
    UserData = 9,
}

/// Position of a frame inside a fragmented message. `frame` is 1-based.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FragmentInfo {
    pub group_id: u16,
    pub frame: u16,
    pub frames: u16,
}

/// The header at the start of every datagram. All numbers are in network byte order (BE):
///
/// ```ascii
/// 0: service flags
///    * bit 0:   fragmented
///    * bit 1:   reserved, must be 0
///    * bit 2-4: channel
///    * bit 5-7: delivery type
/// 1: message type in the upper four bits, lower four bits must be 0
/// 2: connection key (u16)
/// 4: sequence (u16)
/// 6: fragmented datagrams only: group id (u16), frame (u16, 1-based), number of frames (u16)
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DatagramHeader {
    pub delivery_type: DeliveryType,
    pub channel: u8,
    pub message_type: MessageType,
    pub connection_key: u16,
    pub sequence: SequenceNumber,
    pub fragment: Option<FragmentInfo>,
}

impl DatagramHeader {
    /// header for a control message, which is always sent unreliably on channel 0
    pub fn control(message_type: MessageType, connection_key: u16, sequence: SequenceNumber) -> DatagramHeader {
        DatagramHeader {
            delivery_type: DeliveryType::Unreliable,
            channel: 0,
            message_type,
            connection_key,
            sequence,
            fragment: None,
        }
    }

    pub fn user_data(descriptor: ChannelDescriptor, connection_key: u16, fragment: Option<FragmentInfo>) -> DatagramHeader {
        DatagramHeader {
            delivery_type: descriptor.delivery_type,
            channel: descriptor.channel,
            message_type: MessageType::UserData,
            connection_key,
            sequence: SequenceNumber::ZERO,
            fragment,
        }
    }

    pub fn serialized_len(&self) -> usize {
        if self.fragment.is_some() {
            FRAGMENTED_HEADER_SIZE
        }
        else {
            HEADER_SIZE
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.channel <= MAX_CHANNEL);
        let mut flags = ServiceFlags::from_bits_retain(u8::from(self.delivery_type) << SHIFT_DELIVERY)
            | ServiceFlags::from_bits_retain(self.channel << SHIFT_CHANNEL);
        if self.fragment.is_some() {
            flags |= ServiceFlags::FRAGMENTED;
        }
        buf.put_u8(flags.bits());
        buf.put_u8(u8::from(self.message_type) << SHIFT_MESSAGE_TYPE);
        buf.put_u16(self.connection_key);
        buf.put_u16(self.sequence.to_raw());

        if let Some(fragment) = &self.fragment {
            buf.put_u16(fragment.group_id);
            buf.put_u16(fragment.frame);
            buf.put_u16(fragment.frames);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        let flags = ServiceFlags::from_bits_retain(buf.try_get_u8()?);
        if flags.contains(ServiceFlags::RESERVED) {
            bail!("reserved service flag is set");
        }
        let delivery_type = DeliveryType::try_from((flags & ServiceFlags::MASK_DELIVERY).bits() >> SHIFT_DELIVERY)
            .map_err(|e| anyhow!("invalid delivery type {}", e.number))?;
        let channel = (flags & ServiceFlags::MASK_CHANNEL).bits() >> SHIFT_CHANNEL;

        let raw_message_type = buf.try_get_u8()?;
        if raw_message_type & 0x0f != 0 {
            bail!("reserved message type bits are set");
        }
        let message_type = MessageType::try_from(raw_message_type >> SHIFT_MESSAGE_TYPE)
            .map_err(|e| anyhow!("invalid message type {}", e.number))?;

        let connection_key = buf.try_get_u16()?;
        let raw_sequence = buf.try_get_u16()?;
        let sequence = SequenceNumber::from_raw(raw_sequence)
            .ok_or_else(|| anyhow!("sequence number {} is outside the sequence space (max {})", raw_sequence, MAX_SEQUENCE))?;

        let fragment = if flags.contains(ServiceFlags::FRAGMENTED) {
            let group_id = buf.try_get_u16()?;
            let frame = buf.try_get_u16()?;
            let frames = buf.try_get_u16()?;
            if frames == 0 || frame == 0 || frame > frames {
                bail!("invalid fragment info: frame {} of {}", frame, frames);
            }
            Some(FragmentInfo { group_id, frame, frames })
        }
        else {
            None
        };

        Ok(DatagramHeader {
            delivery_type,
            channel,
            message_type,
            connection_key,
            sequence,
            fragment,
        })
    }
}

/// A single protocol datagram: the encoded bytes in a pooled buffer together with the parsed
///  header. A datagram is exclusively owned, and its buffer returns to the pool when it is
///  dropped.
pub struct Datagram {
    header: DatagramHeader,
    buf: PooledBuf,
}

impl Debug for Datagram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DGRAM{{{:?}:{:?}@{}/{}#{}", self.header.message_type, self.header.delivery_type, self.header.channel, self.header.connection_key, self.header.sequence)?;
        if let Some(fragment) = &self.header.fragment {
            write!(f, "[{}:{}/{}]", fragment.group_id, fragment.frame, fragment.frames)?;
        }
        write!(f, " {} bytes}}", self.payload().len())
    }
}

impl Datagram {
    pub fn new(pool: &Arc<BufferPool>, header: DatagramHeader, payload: &[u8]) -> anyhow::Result<Datagram> {
        let len = header.serialized_len() + payload.len();
        if len > pool.buf_size() {
            bail!("datagram of {} bytes exceeds the maximum datagram size of {} bytes", len, pool.buf_size());
        }

        let mut buf = pool.acquire();
        header.ser(&mut *buf);
        buf.put_slice(payload);
        Ok(Datagram { header, buf })
    }

    pub fn new_ack(pool: &Arc<BufferPool>, connection_key: u16, descriptor: ChannelDescriptor, sequence: SequenceNumber) -> anyhow::Result<Datagram> {
        let header = DatagramHeader {
            delivery_type: descriptor.delivery_type,
            channel: descriptor.channel,
            message_type: MessageType::DeliveryAck,
            connection_key,
            sequence,
            fragment: None,
        };
        Datagram::new(pool, header, &[])
    }

    /// Parses a received buffer. On failure, the buffer goes back to the pool.
    pub fn decode(buf: PooledBuf) -> anyhow::Result<Datagram> {
        let header = DatagramHeader::deser(&mut buf.as_ref())?;
        Ok(Datagram { header, buf })
    }

    pub fn header(&self) -> &DatagramHeader {
        &self.header
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn connection_key(&self) -> u16 {
        self.header.connection_key
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.header.sequence
    }

    pub fn fragment(&self) -> Option<FragmentInfo> {
        self.header.fragment
    }

    pub fn descriptor(&self) -> ChannelDescriptor {
        ChannelDescriptor {
            channel: self.header.channel,
            delivery_type: self.header.delivery_type,
        }
    }

    /// Changes the sequence number both in the parsed header and in the encoded bytes
    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.header.sequence = sequence;
        self.buf.as_mut()[4..6].copy_from_slice(&sequence.to_raw().to_be_bytes());
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.as_ref()[self.header.serialized_len()..]
    }

    /// the full encoded datagram, as it goes over the wire
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(64, 4))
    }

    fn decode_bytes(pool: &Arc<BufferPool>, bytes: &[u8]) -> anyhow::Result<Datagram> {
        let mut buf = pool.acquire();
        buf.put_slice(bytes);
        Datagram::decode(buf)
    }

    fn seq(raw: u16) -> SequenceNumber {
        SequenceNumber::from_raw(raw).unwrap()
    }

    #[rstest]
    #[case::connect_req(DatagramHeader::control(MessageType::ConnectReq, 0x1234, seq(0)), vec![0b000_000_00, 0x00, 0x12,0x34, 0,0])]
    #[case::ping(DatagramHeader::control(MessageType::Ping, 1, seq(258)), vec![0, 0x40, 0,1, 1,2])]
    #[case::reliable_ordered_channel_5(DatagramHeader {
        delivery_type: DeliveryType::ReliableOrdered,
        channel: 5,
        message_type: MessageType::UserData,
        connection_key: 0xabcd,
        sequence: seq(65534),
        fragment: None,
    }, vec![0b010_101_00, 0x90, 0xab,0xcd, 0xff,0xfe])]
    #[case::fragmented(DatagramHeader {
        delivery_type: DeliveryType::ReliableUnordered,
        channel: 7,
        message_type: MessageType::UserData,
        connection_key: 2,
        sequence: seq(3),
        fragment: Some(FragmentInfo { group_id: 9, frame: 2, frames: 3 }),
    }, vec![0b011_111_01, 0x90, 0,2, 0,3, 0,9, 0,2, 0,3])]
    #[case::ack(DatagramHeader {
        delivery_type: DeliveryType::ReliableUnordered,
        channel: 1,
        message_type: MessageType::DeliveryAck,
        connection_key: 2,
        sequence: seq(7),
        fragment: None,
    }, vec![0b011_001_00, 0x80, 0,2, 0,7])]
    fn test_header_ser(#[case] header: DatagramHeader, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        header.ser(&mut buf);
        assert_eq!(buf, expected);
        assert_eq!(buf.len(), header.serialized_len());

        let deser = DatagramHeader::deser(&mut buf.as_slice()).unwrap();
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_header(vec![0, 0x90, 0])]
    #[case::reserved_flag(vec![0b000_000_10, 0x90, 0,1, 0,1])]
    #[case::unknown_delivery_type(vec![0b100_000_00, 0x90, 0,1, 0,1])]
    #[case::unknown_message_type(vec![0, 0xa0, 0,1, 0,1])]
    #[case::reserved_message_type_bits(vec![0, 0x91, 0,1, 0,1])]
    #[case::sequence_out_of_range(vec![0, 0x90, 0,1, 0xff,0xff])]
    #[case::truncated_fragment_info(vec![0b010_000_01, 0x90, 0,1, 0,1, 0,1, 0,1])]
    #[case::frame_zero(vec![0b010_000_01, 0x90, 0,1, 0,1, 0,1, 0,0, 0,3])]
    #[case::frame_beyond_count(vec![0b010_000_01, 0x90, 0,1, 0,1, 0,1, 0,4, 0,3])]
    #[case::zero_frames(vec![0b010_000_01, 0x90, 0,1, 0,1, 0,1, 0,1, 0,0])]
    fn test_decode_malformed(#[case] bytes: Vec<u8>) {
        let pool = pool();
        assert!(decode_bytes(&pool, &bytes).is_err());
        assert_eq!(pool.num_pooled(), 1);
    }

    #[test]
    fn test_decode_payload() {
        let pool = pool();
        let datagram = decode_bytes(&pool, &[0b001_011_00, 0x90, 0,5, 0,9, 1,2,3]).unwrap();

        assert_eq!(datagram.message_type(), MessageType::UserData);
        assert_eq!(datagram.descriptor(), ChannelDescriptor { channel: 3, delivery_type: DeliveryType::UnreliableSequenced });
        assert_eq!(datagram.connection_key(), 5);
        assert_eq!(datagram.sequence(), seq(9));
        assert_eq!(datagram.payload(), &[1, 2, 3]);
        assert_eq!(datagram.len(), 9);
    }

    #[test]
    fn test_set_sequence_rewrites_bytes() {
        let pool = pool();
        let descriptor = ChannelDescriptor { channel: 2, delivery_type: DeliveryType::ReliableOrdered };
        let mut datagram = Datagram::new(&pool, DatagramHeader::user_data(descriptor, 7, None), b"abc").unwrap();

        datagram.set_sequence(seq(0x0102));
        assert_eq!(datagram.sequence(), seq(0x0102));
        assert_eq!(&datagram.as_bytes()[4..6], &[1, 2]);
        assert_eq!(datagram.payload(), b"abc");
    }

    #[test]
    fn test_new_rejects_oversized() {
        let pool = pool();
        let header = DatagramHeader::control(MessageType::Ping, 1, seq(0));
        assert!(Datagram::new(&pool, header, &[0; 58]).is_ok());
        assert!(Datagram::new(&pool, header, &[0; 59]).is_err());
    }

    #[test]
    fn test_drop_returns_buffer() {
        let pool = pool();
        let datagram = Datagram::new(&pool, DatagramHeader::control(MessageType::Pong, 1, seq(0)), &[]).unwrap();
        assert_eq!(pool.num_pooled(), 0);
        drop(datagram);
        assert_eq!(pool.num_pooled(), 1);
    }
}
