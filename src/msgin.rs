//! Inbound message reassembly.
//!
//! Received DATA segments are kept in an offset-sorted set that may
//! contain holes; `bytes_remaining` drives the SRPT ordering of the grant
//! scheduler and reaches zero exactly when the message is complete.

/// Outcome of offering one received segment to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentAdd {
    /// New data accepted.
    Added,

    /// Exact duplicate of a segment already held; dropped silently.
    Duplicate,

    /// The segment extends past the end of the message; the packet is
    /// counted as malformed and dropped.
    OutOfRange,
}

struct Segment {
    offset: usize,
    data: Vec<u8>,
}

/// State of a message being received, for requests and responses alike.
pub(crate) struct MsgIn {
    /// Size of the entire message.
    pub total_length: usize,

    /// Received segments, ascending by offset, no duplicates.
    segments: Vec<Segment>,

    /// Message bytes not yet received.
    pub bytes_remaining: usize,

    /// Bytes the sender will transmit without additional grants. Includes
    /// unscheduled bytes, granted bytes, and batching slack. Monotone
    /// non-decreasing, never larger than `total_length`.
    pub incoming: usize,

    /// True means some bytes of this message must be granted.
    pub scheduled: bool,
}

impl MsgIn {
    pub(crate) fn new(total_length: usize, incoming: usize) -> Self {
        let incoming = incoming.min(total_length);
        Self {
            total_length,
            segments: Vec::new(),
            bytes_remaining: total_length,
            incoming,
            scheduled: total_length > incoming,
        }
    }

    /// Insert one received segment. Duplicates (by offset) are dropped;
    /// segments reaching past the message end are rejected.
    pub(crate) fn add_segment(&mut self, offset: usize, data: &[u8]) -> SegmentAdd {
        if offset + data.len() > self.total_length {
            return SegmentAdd::OutOfRange;
        }
        // The 0-byte message completes on its single empty segment, which
        // is recorded like any other so duplicates stay idempotent.
        match self.segments.binary_search_by(|s| s.offset.cmp(&offset)) {
            Ok(_) => SegmentAdd::Duplicate,
            Err(pos) => {
                self.bytes_remaining -= data.len();
                self.segments.insert(
                    pos,
                    Segment {
                        offset,
                        data: data.to_vec(),
                    },
                );
                SegmentAdd::Added
            }
        }
    }

    /// Raise `incoming`; values beyond the message length are clamped,
    /// and it never moves backwards.
    pub(crate) fn note_incoming(&mut self, incoming: usize) {
        self.incoming = self.incoming.max(incoming.min(self.total_length));
    }

    /// Complete when every byte has arrived; a 0-byte message completes
    /// on its first (empty) DATA segment.
    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        self.bytes_remaining == 0 && (self.total_length > 0 || !self.segments.is_empty())
    }

    /// End of the contiguous prefix received so far.
    pub(crate) fn contiguous_end(&self) -> usize {
        let mut end = 0;
        for seg in &self.segments {
            if seg.offset > end {
                break;
            }
            end = seg.offset + seg.data.len();
        }
        end
    }

    /// The first missing byte range below `authorized` (everything the
    /// sender may transmit, including grants issued out-of-band): the
    /// range a RESEND should ask for. A zero-length result means every
    /// authorized byte has arrived; the remedy for silence is then more
    /// grants, not a RESEND.
    pub(crate) fn resend_range(&self, authorized: usize) -> (usize, usize) {
        let mut expected = 0;
        for seg in &self.segments {
            if seg.offset > expected {
                return (expected, seg.offset - expected);
            }
            expected = expected.max(seg.offset + seg.data.len());
        }
        (expected, authorized.saturating_sub(expected))
    }

    /// Copy the completed message out in order.
    pub(crate) fn assemble(&self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut out = Vec::with_capacity(self.total_length);
        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }

    /// Number of segment buffers held (frame accounting for the reaper).
    pub(crate) fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Drop all buffered segments (reap / restart).
    pub(crate) fn clear(&mut self) {
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(len: usize, fill: u8) -> Vec<u8> {
        vec![fill; len]
    }

    #[test]
    fn test_in_order_completion() {
        let mut m = MsgIn::new(4200, 4200);
        assert!(!m.scheduled);
        for (i, off) in [0usize, 1400, 2800].iter().enumerate() {
            assert_eq!(m.add_segment(*off, &seg(1400, i as u8)), SegmentAdd::Added);
        }
        assert!(m.is_complete());
        assert_eq!(m.bytes_remaining, 0);
        let data = m.assemble();
        assert_eq!(data.len(), 4200);
        assert_eq!(data[0], 0);
        assert_eq!(data[1400], 1);
        assert_eq!(data[2800], 2);
    }

    #[test]
    fn test_any_permutation_same_result() {
        let offsets = [0usize, 1400, 2800, 4200];
        let perms: [[usize; 4]; 3] = [[3, 1, 0, 2], [2, 3, 1, 0], [0, 2, 1, 3]];
        for perm in perms {
            let mut m = MsgIn::new(5600, 5600);
            for &i in &perm {
                m.add_segment(offsets[i], &seg(1400, i as u8));
            }
            assert!(m.is_complete());
            let data = m.assemble();
            for (i, &off) in offsets.iter().enumerate() {
                assert_eq!(data[off], i as u8);
            }
        }
    }

    #[test]
    fn test_duplicates_idempotent() {
        let mut m = MsgIn::new(2800, 2800);
        assert_eq!(m.add_segment(0, &seg(1400, 1)), SegmentAdd::Added);
        assert_eq!(m.add_segment(0, &seg(1400, 1)), SegmentAdd::Duplicate);
        assert_eq!(m.add_segment(0, &seg(1400, 1)), SegmentAdd::Duplicate);
        assert_eq!(m.bytes_remaining, 1400);
        assert_eq!(m.add_segment(1400, &seg(1400, 2)), SegmentAdd::Added);
        assert!(m.is_complete());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut m = MsgIn::new(1000, 1000);
        assert_eq!(m.add_segment(0, &seg(1001, 0)), SegmentAdd::OutOfRange);
        assert_eq!(m.add_segment(600, &seg(401, 0)), SegmentAdd::OutOfRange);
        assert_eq!(m.bytes_remaining, 1000);
    }

    #[test]
    fn test_zero_byte_message() {
        let mut m = MsgIn::new(0, 0);
        // Not complete until the (empty) DATA packet arrives.
        assert!(!m.is_complete());
        assert_eq!(m.add_segment(0, &[]), SegmentAdd::Added);
        assert!(m.is_complete());
        assert_eq!(m.add_segment(0, &[]), SegmentAdd::Duplicate);
        assert_eq!(m.assemble().len(), 0);
    }

    #[test]
    fn test_incoming_monotone_and_clamped() {
        let mut m = MsgIn::new(10_000, 5_000);
        assert!(m.scheduled);
        m.note_incoming(4_000);
        assert_eq!(m.incoming, 5_000);
        m.note_incoming(8_000);
        assert_eq!(m.incoming, 8_000);
        m.note_incoming(20_000);
        assert_eq!(m.incoming, 10_000);
    }

    #[test]
    fn test_resend_range_first_hole() {
        let mut m = MsgIn::new(14_000, 14_000);
        m.add_segment(0, &seg(1400, 0));
        m.add_segment(1400, &seg(1400, 0));
        // Hole at 2800.
        m.add_segment(4200, &seg(1400, 0));
        m.add_segment(5600, &seg(1400, 0));
        assert_eq!(m.resend_range(m.incoming), (2800, 1400));
    }

    #[test]
    fn test_resend_range_no_hole_below_authorized() {
        let mut m = MsgIn::new(14_000, 5_600);
        m.add_segment(0, &seg(1400, 0));
        m.add_segment(1400, &seg(1400, 0));
        // Everything up to 2800 arrived, but the sender was authorized
        // through 5600 and went silent.
        assert_eq!(m.resend_range(m.incoming), (2800, 2800));
    }

    #[test]
    fn test_resend_range_tracks_grants_issued_out_of_band() {
        let mut m = MsgIn::new(50_000, 11_200);
        m.add_segment(0, &seg(1400, 0));
        // Grants pushed the authorization to 20000 even though this
        // message's own window stopped at 11200.
        assert_eq!(m.resend_range(20_000), (1400, 18_600));
    }

    #[test]
    fn test_resend_range_empty_when_nothing_outstanding() {
        let mut m = MsgIn::new(14_000, 2_800);
        m.add_segment(0, &seg(1400, 0));
        m.add_segment(1400, &seg(1400, 0));
        // All authorized bytes arrived; silence means grants are owed.
        assert_eq!(m.resend_range(m.incoming), (2800, 0));
    }

    #[test]
    fn test_contiguous_end() {
        let mut m = MsgIn::new(14_000, 14_000);
        assert_eq!(m.contiguous_end(), 0);
        m.add_segment(0, &seg(1400, 0));
        assert_eq!(m.contiguous_end(), 1400);
        m.add_segment(2800, &seg(1400, 0));
        assert_eq!(m.contiguous_end(), 1400);
        m.add_segment(1400, &seg(1400, 0));
        assert_eq!(m.contiguous_end(), 4200);
    }
}
