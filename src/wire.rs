//! Wire format for Homa packets.
//!
//! Every packet begins with a 28-byte common header whose layout is
//! bit-compatible with a TCP header prefix, so that receive-side scaling
//! and segmentation-offload hardware treat Homa packets as TCP. The two
//! reserved 32-bit words after the ports sit where TCP keeps its sequence
//! and acknowledgment numbers; offload hardware may rewrite them, so Homa
//! never stores anything there. All multi-byte fields are big-endian on
//! the wire.
//!
//! # Common header layout
//!
//! | Offset | Size | Field                                   |
//! | -----: | ---: | --------------------------------------- |
//! |      0 |    2 | source port                             |
//! |      2 |    2 | destination port                        |
//! |      4 |    8 | reserved (TCP seq/ack positions)        |
//! |     12 |    1 | doff (high nibble; DATA only)           |
//! |     13 |    1 | packet type                             |
//! |     14 |    2 | unused                                  |
//! |     16 |    2 | reserved (TCP checksum position)        |
//! |     18 |    2 | unused                                  |
//! |     20 |    8 | RPC id                                  |

use thiserror::Error;

use crate::type_alias::*;

/// Largest permissible message size, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1_000_000;

/// Number of in-network priority levels available to the protocol.
pub const NUM_PRIORITIES: usize = 8;

/// Payload bytes carried by one full-size data segment. Chosen so that a
/// segment plus all headers fits in a 1500-byte Ethernet payload.
pub(crate) const MAX_DATA_PER_PACKET: usize = 1400;

pub(crate) const COMMON_HDR_LEN: usize = 28;
pub(crate) const DATA_HDR_LEN: usize = 40;
pub(crate) const SEG_HDR_LEN: usize = 8;
pub(crate) const GRANT_HDR_LEN: usize = COMMON_HDR_LEN + 5;
pub(crate) const RESEND_HDR_LEN: usize = COMMON_HDR_LEN + 9;
pub(crate) const CUTOFFS_HDR_LEN: usize = COMMON_HDR_LEN + 4 * NUM_PRIORITIES + 2;

/// Every Homa packet is at least this long on the wire. Receivers discard
/// (and count) anything shorter; senders pad to this length.
pub(crate) const MIN_PACKET_LEN: usize = 64;

/// Byte offset of the retransmit flag within a DATA datagram. Used to
/// patch prebuilt frames when answering a RESEND.
pub(crate) const RETRANSMIT_OFFSET: usize = 38;

/// Packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PktType {
    /// Message payload segments.
    Data = 20,

    /// Authorization from receiver to sender for additional bytes.
    Grant = 21,

    /// Receiver believes data was lost; asks for retransmission.
    Resend = 22,

    /// Server lost its RPC state; client must start over.
    Restart = 23,

    /// Liveness probe: the sender is alive but has nothing new to send.
    Busy = 24,

    /// Publishes the receiver's unscheduled-priority cutoff vector.
    Cutoffs = 25,

    /// Debugging hook; no protocol effect.
    Freeze = 26,
}

impl PktType {
    /// Index into per-type metric arrays.
    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self as usize - PktType::Data as usize
    }
}

impl TryFrom<u8> for PktType {
    type Error = WireError;

    fn try_from(val: u8) -> Result<Self, WireError> {
        match val {
            20 => Ok(Self::Data),
            21 => Ok(Self::Grant),
            22 => Ok(Self::Resend),
            23 => Ok(Self::Restart),
            24 => Ok(Self::Busy),
            25 => Ok(Self::Cutoffs),
            26 => Ok(Self::Freeze),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// Errors produced when parsing a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum WireError {
    #[error("packet too short: got {got} bytes, need {need}")]
    Short { need: usize, got: usize },

    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

/// Fields common to all packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommonHeader {
    pub sport: Port,
    pub dport: Port,
    pub pkt_type: PktType,
    pub id: RpcId,
}

impl CommonHeader {
    pub(crate) fn new(sport: Port, dport: Port, pkt_type: PktType, id: RpcId) -> Self {
        Self {
            sport,
            dport,
            pkt_type,
            id,
        }
    }

    /// Append the encoded header to `buf`. The doff nibble is only
    /// meaningful for DATA packets, where it must cover the data header up
    /// to (but not including) the first segment.
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sport.to_be_bytes());
        buf.extend_from_slice(&self.dport.to_be_bytes());
        // Reserved words at the TCP seq/ack positions stay zero.
        buf.extend_from_slice(&[0u8; 8]);
        let doff = if self.pkt_type == PktType::Data {
            ((DATA_HDR_LEN / 4) as u8) << 4
        } else {
            0
        };
        buf.push(doff);
        buf.push(self.pkt_type as u8);
        // unused3, checksum slot, unused4.
        buf.extend_from_slice(&[0u8; 6]);
        buf.extend_from_slice(&self.id.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < COMMON_HDR_LEN {
            return Err(WireError::Short {
                need: COMMON_HDR_LEN,
                got: buf.len(),
            });
        }
        Ok(Self {
            sport: u16::from_be_bytes([buf[0], buf[1]]),
            dport: u16::from_be_bytes([buf[2], buf[3]]),
            pkt_type: PktType::try_from(buf[13])?,
            id: u64::from_be_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

/// One data segment inside a DATA packet, borrowing its payload from the
/// received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataSegment<'a> {
    /// Offset of the first payload byte within the message.
    pub offset: u32,
    pub data: &'a [u8],
}

/// A parsed view of a received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Packet<'a> {
    Data {
        common: CommonHeader,
        message_length: u32,
        /// Bytes the sender will transmit without further grants.
        incoming: u32,
        /// Cutoff version the sender last saw from us.
        cutoff_version: u16,
        retransmit: bool,
        segments: Vec<DataSegment<'a>>,
    },
    Grant {
        common: CommonHeader,
        offset: u32,
        priority: Priority,
    },
    Resend {
        common: CommonHeader,
        offset: u32,
        length: u32,
        priority: Priority,
    },
    Restart {
        common: CommonHeader,
    },
    Busy {
        common: CommonHeader,
    },
    Cutoffs {
        common: CommonHeader,
        cutoffs: [u32; NUM_PRIORITIES],
        version: u16,
    },
    Freeze {
        common: CommonHeader,
    },
}

impl Packet<'_> {
    pub(crate) fn common(&self) -> &CommonHeader {
        match self {
            Packet::Data { common, .. }
            | Packet::Grant { common, .. }
            | Packet::Resend { common, .. }
            | Packet::Restart { common }
            | Packet::Busy { common }
            | Packet::Cutoffs { common, .. }
            | Packet::Freeze { common } => common,
        }
    }
}

#[inline]
fn be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[..4].try_into().unwrap())
}

#[inline]
fn be16(buf: &[u8]) -> u16 {
    u16::from_be_bytes(buf[..2].try_into().unwrap())
}

fn need(buf: &[u8], len: usize) -> Result<(), WireError> {
    if buf.len() < len {
        Err(WireError::Short {
            need: len,
            got: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Parse a received datagram into a [`Packet`] view.
///
/// The caller is responsible for the minimum-length rule: datagrams
/// shorter than [`MIN_PACKET_LEN`] must be discarded before parsing.
pub(crate) fn parse(datagram: &[u8]) -> Result<Packet<'_>, WireError> {
    let common = CommonHeader::decode(datagram)?;
    match common.pkt_type {
        PktType::Data => {
            need(datagram, DATA_HDR_LEN)?;
            let message_length = be32(&datagram[28..]);
            let incoming = be32(&datagram[32..]);
            let cutoff_version = be16(&datagram[36..]);
            let retransmit = datagram[RETRANSMIT_OFFSET] != 0;

            let mut segments = Vec::new();
            let mut pos = DATA_HDR_LEN;
            while datagram.len() - pos >= SEG_HDR_LEN {
                let offset = be32(&datagram[pos..]);
                let seg_len = be32(&datagram[pos + 4..]) as usize;
                // A zero-length segment is only legitimate as the sole
                // segment of an empty message; anything else is padding.
                if seg_len == 0 && (message_length != 0 || !segments.is_empty()) {
                    break;
                }
                pos += SEG_HDR_LEN;
                if datagram.len() - pos < seg_len {
                    return Err(WireError::Short {
                        need: pos + seg_len,
                        got: datagram.len(),
                    });
                }
                segments.push(DataSegment {
                    offset,
                    data: &datagram[pos..pos + seg_len],
                });
                pos += seg_len;
                if seg_len == 0 {
                    break;
                }
            }
            if segments.is_empty() {
                return Err(WireError::Short {
                    need: DATA_HDR_LEN + SEG_HDR_LEN,
                    got: datagram.len(),
                });
            }
            Ok(Packet::Data {
                common,
                message_length,
                incoming,
                cutoff_version,
                retransmit,
                segments,
            })
        }
        PktType::Grant => {
            need(datagram, GRANT_HDR_LEN)?;
            Ok(Packet::Grant {
                common,
                offset: be32(&datagram[28..]),
                priority: datagram[32],
            })
        }
        PktType::Resend => {
            need(datagram, RESEND_HDR_LEN)?;
            Ok(Packet::Resend {
                common,
                offset: be32(&datagram[28..]),
                length: be32(&datagram[32..]),
                priority: datagram[36],
            })
        }
        PktType::Restart => Ok(Packet::Restart { common }),
        PktType::Busy => Ok(Packet::Busy { common }),
        PktType::Cutoffs => {
            need(datagram, CUTOFFS_HDR_LEN)?;
            let mut cutoffs = [0u32; NUM_PRIORITIES];
            for (i, c) in cutoffs.iter_mut().enumerate() {
                *c = be32(&datagram[28 + 4 * i..]);
            }
            Ok(Packet::Cutoffs {
                common,
                cutoffs,
                version: be16(&datagram[28 + 4 * NUM_PRIORITIES..]),
            })
        }
        PktType::Freeze => Ok(Packet::Freeze { common }),
    }
}

/// Pad a datagram up to the wire minimum.
fn pad_to_min(buf: &mut Vec<u8>) {
    if buf.len() < MIN_PACKET_LEN {
        buf.resize(MIN_PACKET_LEN, 0);
    }
}

/// Build a DATA datagram carrying the given `(offset, payload)` segments.
pub(crate) fn build_data(
    common: CommonHeader,
    message_length: u32,
    incoming: u32,
    cutoff_version: u16,
    retransmit: bool,
    segments: &[(u32, &[u8])],
) -> Vec<u8> {
    debug_assert_eq!(common.pkt_type, PktType::Data);
    let payload: usize = segments.iter().map(|(_, d)| d.len()).sum();
    let mut buf = Vec::with_capacity(DATA_HDR_LEN + segments.len() * SEG_HDR_LEN + payload);
    common.encode(&mut buf);
    buf.extend_from_slice(&message_length.to_be_bytes());
    buf.extend_from_slice(&incoming.to_be_bytes());
    buf.extend_from_slice(&cutoff_version.to_be_bytes());
    buf.push(retransmit as u8);
    buf.push(0); // pad
    for (offset, data) in segments {
        buf.extend_from_slice(&offset.to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(data);
    }
    pad_to_min(&mut buf);
    buf
}

/// Build a GRANT datagram.
pub(crate) fn build_grant(common: CommonHeader, offset: u32, priority: Priority) -> Vec<u8> {
    debug_assert_eq!(common.pkt_type, PktType::Grant);
    let mut buf = Vec::with_capacity(MIN_PACKET_LEN);
    common.encode(&mut buf);
    buf.extend_from_slice(&offset.to_be_bytes());
    buf.push(priority);
    pad_to_min(&mut buf);
    buf
}

/// Build a RESEND datagram.
pub(crate) fn build_resend(
    common: CommonHeader,
    offset: u32,
    length: u32,
    priority: Priority,
) -> Vec<u8> {
    debug_assert_eq!(common.pkt_type, PktType::Resend);
    let mut buf = Vec::with_capacity(MIN_PACKET_LEN);
    common.encode(&mut buf);
    buf.extend_from_slice(&offset.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(priority);
    pad_to_min(&mut buf);
    buf
}

/// Build a CUTOFFS datagram.
pub(crate) fn build_cutoffs(
    common: CommonHeader,
    cutoffs: &[u32; NUM_PRIORITIES],
    version: u16,
) -> Vec<u8> {
    debug_assert_eq!(common.pkt_type, PktType::Cutoffs);
    let mut buf = Vec::with_capacity(MIN_PACKET_LEN);
    common.encode(&mut buf);
    for c in cutoffs {
        buf.extend_from_slice(&c.to_be_bytes());
    }
    buf.extend_from_slice(&version.to_be_bytes());
    pad_to_min(&mut buf);
    buf
}

/// Build a RESTART, BUSY, or FREEZE datagram (common header only).
pub(crate) fn build_control(common: CommonHeader) -> Vec<u8> {
    debug_assert!(matches!(
        common.pkt_type,
        PktType::Restart | PktType::Busy | PktType::Freeze
    ));
    let mut buf = Vec::with_capacity(MIN_PACKET_LEN);
    common.encode(&mut buf);
    pad_to_min(&mut buf);
    buf
}
