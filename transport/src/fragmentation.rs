use std::collections::BTreeMap;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::datagram::{Datagram, FragmentInfo, FRAGMENTED_HEADER_SIZE};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Splits a message into frames that fit into datagrams of `mtu` bytes including the fragment
///  header. Frame numbers are 1-based.
pub fn split_message(message: &[u8], mtu: usize, group_id: u16) -> anyhow::Result<Vec<(FragmentInfo, &[u8])>> {
    if mtu <= FRAGMENTED_HEADER_SIZE {
        bail!("MTU of {} leaves no room for payload in fragmented datagrams", mtu);
    }
    let frame_size = mtu - FRAGMENTED_HEADER_SIZE;

    let num_frames = message.len().div_ceil(frame_size);
    if num_frames > u16::MAX as usize {
        bail!("message of {} bytes would need {} fragments, exceeding the maximum of {}", message.len(), num_frames, u16::MAX);
    }
    let frames: u16 = num_frames.prechecked_cast();

    Ok(message.chunks(frame_size)
        .enumerate()
        .map(|(idx, chunk)| {
            let info = FragmentInfo {
                group_id,
                frame: (idx + 1).prechecked_cast(),
                frames,
            };
            (info, chunk)
        })
        .collect())
}

/// The frames of one fragmented message that were received so far. Frames are stored sparsely,
///  so memory is proportional to what was actually received.
struct FragmentHolder {
    group_id: u16,
    frames: u16,
    received: BTreeMap<u16, Datagram>,
}

impl FragmentHolder {
    fn new(group_id: u16, frames: u16) -> FragmentHolder {
        FragmentHolder {
            group_id,
            frames,
            received: BTreeMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        let frames: usize = self.frames.safe_cast();
        self.received.len() == frames
    }

    /// concatenates the frames' payloads, releasing their buffers
    fn assemble(self) -> Vec<u8> {
        let total_len = self.received.values()
            .map(|d| d.payload().len())
            .sum();

        let mut result = Vec::with_capacity(total_len);
        for frame in self.received.into_values() {
            result.extend_from_slice(frame.payload());
        }
        result
    }
}

/// Reassembly of fragmented messages for a connection, keyed by fragment group
pub struct FragmentReassembly {
    max_frames: usize,
    holders: FxHashMap<u16, FragmentHolder>,
}

impl FragmentReassembly {
    /// `max_frames` is the largest frame count that is accepted for a message
    pub fn new(max_frames: usize) -> FragmentReassembly {
        FragmentReassembly {
            max_frames,
            holders: FxHashMap::default(),
        }
    }

    /// Adds a frame, returning the reassembled message if this frame completed it. Duplicate
    ///  frames are dropped; frames that are inconsistent with previously received frames of the
    ///  same group are rejected.
    pub fn add_frame(&mut self, datagram: Datagram) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(info) = datagram.fragment() else {
            bail!("datagram {:?} is not fragmented", datagram);
        };
        if info.frame == 0 || info.frame > info.frames {
            bail!("frame {} is out of range for a message of {} frames", info.frame, info.frames);
        }
        let frames: usize = info.frames.safe_cast();
        if frames > self.max_frames {
            bail!("message of {} frames exceeds the maximum of {}", info.frames, self.max_frames);
        }

        let holder = self.holders
            .entry(info.group_id)
            .or_insert_with(|| FragmentHolder::new(info.group_id, info.frames));

        if holder.group_id != info.group_id {
            bail!("frame for group {} was routed to holder for group {}", info.group_id, holder.group_id);
        }
        if holder.frames != info.frames {
            bail!("frame count mismatch for group {}: {} vs. {}", info.group_id, info.frames, holder.frames);
        }

        if holder.received.contains_key(&info.frame) {
            trace!("dropping duplicate frame {} of group {}", info.frame, info.group_id);
            return Ok(None);
        }
        holder.received.insert(info.frame, datagram);

        if !holder.is_complete() {
            return Ok(None);
        }

        match self.holders.remove(&info.group_id) {
            Some(holder) => {
                debug!("reassembled message from {} frames of group {}", holder.frames, holder.group_id);
                Ok(Some(holder.assemble()))
            }
            None => Ok(None),
        }
    }

    pub fn num_incomplete(&self) -> usize {
        self.holders.len()
    }
}
