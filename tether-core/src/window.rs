//! Bounded sliding windows keyed by sequence number: the sender's in-flight
//! buffer and the receiver's out-of-order reassembly buffer.

use crate::protocol::{seq_before, Segment, SeqNum, Timestamp};
use std::collections::VecDeque;

/// One in-flight segment plus its retransmission bookkeeping.
#[derive(Debug)]
pub struct SendEntry {
    pub seg: Segment,
    /// RTO applied to this entry; grows on backoff
    pub rto: u32,
    /// Deadline for the next retransmission
    pub resend_at: Timestamp,
    /// How many later acks have skipped over this entry
    pub fast_acks: u32,
    /// Transmission attempts so far (0 = not yet sent)
    pub xmit: u32,
}

/// Sender half: segments that have been assigned sequence numbers and are
/// awaiting acknowledgment. Entries stay ordered by sequence number.
#[derive(Debug, Default)]
pub struct SendWindow {
    entries: VecDeque<SendEntry>,
    una: SeqNum,
    next: SeqNum,
}

impl SendWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest unacknowledged sequence number
    pub fn una(&self) -> SeqNum {
        self.una
    }

    /// Next sequence number to assign
    pub fn next_seq(&self) -> SeqNum {
        self.next
    }

    /// Sequence span currently in flight
    pub fn inflight(&self) -> u32 {
        self.next.wrapping_sub(self.una)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Assign the next sequence number to `seg` and take it into flight.
    /// Admission control (window/congestion limits) is the caller's job.
    pub fn enqueue(&mut self, mut seg: Segment) {
        seg.header.seq = self.next;
        self.next = self.next.wrapping_add(1);
        self.entries.push_back(SendEntry {
            seg,
            rto: 0,
            resend_at: 0,
            fast_acks: 0,
            xmit: 0,
        });
    }

    /// Cumulative ack: release every entry before `una`.
    pub fn ack_cumulative(&mut self, una: SeqNum) {
        while let Some(entry) = self.entries.front() {
            if seq_before(entry.seg.header.seq, una) {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        self.sync_una();
    }

    /// Explicit ack for a single sequence number. Returns the transmit count
    /// of the released entry if it was still in flight.
    pub fn ack_seq(&mut self, seq: SeqNum) -> Option<u32> {
        if seq_before(seq, self.una) || !seq_before(seq, self.next) {
            return None;
        }

        let pos = self.entries.iter().position(|e| e.seg.header.seq == seq)?;
        let entry = self.entries.remove(pos)?;
        self.sync_una();
        Some(entry.xmit)
    }

    /// Credit a skipped-over report to every entry older than `seq`.
    /// Fast retransmission triggers off the accumulated count.
    pub fn mark_skipped(&mut self, seq: SeqNum) {
        if seq_before(seq, self.una) || !seq_before(seq, self.next) {
            return;
        }

        for entry in self.entries.iter_mut() {
            if seq_before(entry.seg.header.seq, seq) {
                entry.fast_acks += 1;
            } else if entry.seg.header.seq != seq {
                break;
            }
        }
    }

    /// Iterate in-flight entries for the retransmission scan.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SendEntry> {
        self.entries.iter_mut()
    }

    fn sync_una(&mut self) {
        self.una = match self.entries.front() {
            Some(entry) => entry.seg.header.seq,
            None => self.next,
        };
    }
}

/// Receiver half: out-of-order arrivals held until the contiguous prefix
/// starting at `next` can be released. Never delivers a gap.
#[derive(Debug)]
pub struct RecvWindow {
    buf: VecDeque<Segment>,
    next: SeqNum,
    size: u32,
}

impl RecvWindow {
    pub fn new(size: u32) -> Self {
        Self {
            buf: VecDeque::new(),
            next: 0,
            size,
        }
    }

    /// Next sequence number the application is owed
    pub fn next_seq(&self) -> SeqNum {
        self.next
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether `seq` falls inside the acceptance window. Everything in the
    /// window gets acked, including duplicates of already-released segments.
    pub fn should_ack(&self, seq: SeqNum) -> bool {
        seq_before(seq, self.next.wrapping_add(self.size))
    }

    /// Insert an arrival in sequence order. Returns false for duplicates and
    /// segments outside `[next, next + size)`.
    pub fn insert(&mut self, seg: Segment) -> bool {
        let seq = seg.header.seq;
        if !seq_before(seq, self.next.wrapping_add(self.size)) || seq_before(seq, self.next) {
            return false;
        }

        // Scan from the back; arrivals are usually near-in-order
        let mut pos = self.buf.len();
        for (i, existing) in self.buf.iter().enumerate().rev() {
            if existing.header.seq == seq {
                return false;
            }
            if seq_before(seq, existing.header.seq) {
                pos = i;
            } else {
                break;
            }
        }

        if pos == self.buf.len() {
            self.buf.push_back(seg);
        } else {
            self.buf.insert(pos, seg);
        }
        true
    }

    /// Release the maximal contiguous run starting at `next` into `ready`,
    /// keeping at most `capacity` segments staged there.
    pub fn promote(&mut self, ready: &mut VecDeque<Segment>, capacity: usize) {
        while self
            .buf
            .front()
            .is_some_and(|seg| seg.header.seq == self.next)
            && ready.len() < capacity
        {
            if let Some(seg) = self.buf.pop_front() {
                self.next = self.next.wrapping_add(1);
                ready.push_back(seg);
            }
        }
    }
}
