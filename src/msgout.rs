//! Outbound message construction.
//!
//! A user buffer is chopped into an ordered chain of transmit frames at
//! creation time. Each frame is a complete DATA datagram carrying one or
//! more segments; frames up to `max_gso_size` payload bytes rely on
//! segmentation offload downstream. Priorities are chosen at transmit
//! time, so frames are built without them.

use crate::config::HomaConfig;
use crate::type_alias::*;
use crate::wire::{self, CommonHeader, PktType, MAX_DATA_PER_PACKET, RETRANSMIT_OFFSET};

/// One prebuilt DATA datagram.
pub(crate) struct Frame {
    /// Message offset of the first payload byte in this frame.
    pub offset: usize,

    /// Payload bytes carried by this frame.
    pub data_len: usize,

    /// The datagram, ready for the driver.
    pub datagram: Vec<u8>,
}

impl Frame {
    /// Bytes this frame occupies on the wire.
    #[inline]
    pub(crate) fn wire_len(&self) -> usize {
        self.datagram.len()
    }

    /// A copy of the datagram with the retransmit flag set, for answering
    /// RESENDs.
    pub(crate) fn retransmit_copy(&self) -> Vec<u8> {
        let mut copy = self.datagram.clone();
        copy[RETRANSMIT_OFFSET] = 1;
        copy
    }
}

/// State of a message being sent, for requests and responses alike.
pub(crate) struct MsgOut {
    /// Total bytes in the message.
    pub length: usize,

    /// All frames of the message, ascending by offset.
    pub frames: Vec<Frame>,

    /// Index of the first frame not yet transmitted.
    pub next: usize,

    /// Initial bytes sent without waiting for grants.
    pub unscheduled: usize,

    /// Bytes we are currently permitted to send. Starts at the
    /// unscheduled window, raised by GRANTs, never exceeds `length`.
    pub granted: usize,

    /// Priority for scheduled frames, as dictated by the latest GRANT.
    pub sched_priority: Priority,
}

impl MsgOut {
    /// Chop `message` into frames addressed from `sport` to
    /// `(dport, id)`. `peer_cutoff_version` is echoed in every frame so
    /// the receiver can detect staleness.
    pub(crate) fn new(
        config: &HomaConfig,
        sport: Port,
        dport: Port,
        id: RpcId,
        peer_cutoff_version: u16,
        message: &[u8],
    ) -> Self {
        let length = message.len();
        let unscheduled = config.unscheduled_bytes();
        let granted = length.min(unscheduled);

        let common = CommonHeader::new(sport, dport, PktType::Data, id);
        let mut frames = Vec::new();
        let mut offset = 0;
        loop {
            let frame_len = (length - offset).min(config.max_gso_size);
            let frame_end = offset + frame_len;
            // The receiver can count on everything through the end of
            // this frame arriving without further grants.
            let incoming = length.min(unscheduled.max(frame_end));

            let mut segments: Vec<(u32, &[u8])> = Vec::new();
            let mut seg_off = offset;
            loop {
                let seg_len = (frame_end - seg_off).min(MAX_DATA_PER_PACKET);
                segments.push((seg_off as u32, &message[seg_off..seg_off + seg_len]));
                seg_off += seg_len;
                if seg_off >= frame_end {
                    break;
                }
            }

            frames.push(Frame {
                offset,
                data_len: frame_len,
                datagram: wire::build_data(
                    common,
                    length as u32,
                    incoming as u32,
                    peer_cutoff_version,
                    false,
                    &segments,
                ),
            });

            offset = frame_end;
            if offset >= length {
                break;
            }
        }

        Self {
            length,
            frames,
            next: 0,
            unscheduled,
            granted,
            sched_priority: config.max_sched_prio,
        }
    }

    /// Message offset of the next frame to transmit; `length` when the
    /// whole message has been handed to the network.
    #[inline]
    pub(crate) fn next_offset(&self) -> usize {
        self.frames
            .get(self.next)
            .map_or(self.length, |f| f.offset)
    }

    #[inline]
    pub(crate) fn is_fully_sent(&self) -> bool {
        self.next >= self.frames.len()
    }

    #[inline]
    pub(crate) fn is_fully_granted(&self) -> bool {
        self.granted >= self.length
    }

    /// Apply a GRANT: `granted` is monotone and clamped to the message
    /// length, and the grant dictates the priority of future scheduled
    /// frames.
    pub(crate) fn grant(&mut self, offset: usize, priority: Priority) {
        let clamped = offset.min(self.length);
        if clamped > self.granted {
            self.granted = clamped;
        }
        self.sched_priority = priority;
    }

    /// Start transmission over from the beginning (RESTART recovery).
    pub(crate) fn reset(&mut self) {
        self.next = 0;
        self.granted = self.length.min(self.unscheduled);
    }

    /// Frames overlapping the byte range `[offset, offset + length)`,
    /// clamped to the message end.
    pub(crate) fn frames_in_range(
        &self,
        offset: usize,
        length: usize,
    ) -> impl Iterator<Item = &Frame> {
        let end = offset.saturating_add(length).min(self.length);
        self.frames
            .iter()
            .filter(move |f| f.offset < end && f.offset + f.data_len.max(1) > offset)
    }
}
