//! Wire types, constants, and sequence arithmetic

use crate::error::{ArqError, ArqResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol constants
pub mod constants {
    pub const RTO_NDL: u32 = 30; // no-delay min rto
    pub const RTO_MIN: u32 = 100; // normal min rto
    pub const RTO_DEF: u32 = 200; // initial rto before first sample
    pub const RTO_MAX: u32 = 60000; // max rto
    pub const CMD_PUSH: u8 = 81; // cmd: push data
    pub const CMD_ACK: u8 = 82; // cmd: ack
    pub const CMD_PROBE: u8 = 83; // cmd: window probe (ask)
    pub const CMD_PROBE_REPLY: u8 = 84; // cmd: window size (tell)
    pub const CMD_DGRAM: u8 = 85; // cmd: unreliable datagram
    pub const ASK_SEND: u32 = 1; // probe pending: send CMD_PROBE
    pub const ASK_TELL: u32 = 2; // probe pending: send CMD_PROBE_REPLY
    pub const WND_SND: u32 = 32; // default send window
    pub const WND_RCV: u32 = 128; // default receive window
    pub const MTU_DEF: u32 = 1400; // default mtu
    pub const INTERVAL: u32 = 10; // default update interval
    pub const OVERHEAD: u32 = 24; // segment header overhead
    pub const DEADLINK: u32 = 20; // default retry budget per segment
    pub const THRESH_INIT: u32 = 2; // initial slow start threshold
    pub const THRESH_MIN: u32 = 2; // min slow start threshold
    pub const PROBE_INIT: u32 = 7000; // default first window probe delay
    pub const PROBE_LIMIT: u32 = 120000; // probe backoff cap
    pub const FASTACK_LIMIT: u32 = 5; // max fast-retransmit attempts per segment
    pub const MAX_FRAGMENTS: u32 = 255; // frag field is one byte

    pub const OP_HELLO: u8 = 1; // payload opcode: handshake
    pub const OP_PING: u8 = 2; // payload opcode: keepalive
    pub const OP_DATA: u8 = 3; // payload opcode: application data
    pub const OP_BYE: u8 = 4; // payload opcode: disconnect / refusal
}

/// Conversation ID type
pub type ConvId = u32;

/// Generate a random conversation ID using OS-entropy-seeded hashing.
/// Avoids 0 since it's reserved for "unassigned" on the server side.
pub fn random_conv_id() -> ConvId {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    loop {
        let id = RandomState::new().build_hasher().finish() as u32;
        if id != 0 {
            return id;
        }
    }
}

/// Sequence number type
pub type SeqNum = u32;

/// Timestamp type (milliseconds since connection start)
pub type Timestamp = u32;

/// Fixed 24-byte segment header, all fields little-endian on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub conv: ConvId,
    pub cmd: u8,
    pub frag: u8,
    pub wnd: u16,
    pub ts: Timestamp,
    pub seq: SeqNum,
    pub una: SeqNum,
    pub len: u32,
}

impl SegmentHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 24;

    /// Create a new header with zeroed bookkeeping fields
    pub fn new(conv: ConvId, cmd: u8) -> Self {
        Self {
            conv,
            cmd,
            frag: 0,
            wnd: 0,
            ts: 0,
            seq: 0,
            una: 0,
            len: 0,
        }
    }

    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frag);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    /// Decode and validate a header, consuming [`Self::SIZE`] bytes
    pub fn decode(buf: &mut Bytes) -> ArqResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(ArqError::malformed(format!(
                "buffer too short for header: {} bytes",
                buf.len()
            )));
        }

        let header = Self {
            conv: buf.get_u32_le(),
            cmd: buf.get_u8(),
            frag: buf.get_u8(),
            wnd: buf.get_u16_le(),
            ts: buf.get_u32_le(),
            seq: buf.get_u32_le(),
            una: buf.get_u32_le(),
            len: buf.get_u32_le(),
        };

        if !is_valid_cmd(header.cmd) {
            return Err(ArqError::malformed(format!(
                "unknown command {}",
                header.cmd
            )));
        }

        Ok(header)
    }

    /// Get command type as string for debugging
    pub fn cmd_str(&self) -> &'static str {
        match self.cmd {
            constants::CMD_PUSH => "PUSH",
            constants::CMD_ACK => "ACK",
            constants::CMD_PROBE => "PROBE",
            constants::CMD_PROBE_REPLY => "PROBE_REPLY",
            constants::CMD_DGRAM => "DGRAM",
            _ => "UNKNOWN",
        }
    }
}

fn is_valid_cmd(cmd: u8) -> bool {
    (constants::CMD_PUSH..=constants::CMD_DGRAM).contains(&cmd)
}

/// A decoded wire segment: header plus payload.
///
/// Retransmission bookkeeping lives in the send window's entries, not here;
/// this type is purely what travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: SegmentHeader,
    pub payload: Bytes,
}

impl Segment {
    /// Create a segment with `len` derived from the payload
    pub fn new(conv: ConvId, cmd: u8, payload: Bytes) -> Self {
        let mut header = SegmentHeader::new(conv, cmd);
        header.len = payload.len() as u32;
        Self { header, payload }
    }

    /// Create a PUSH segment
    pub fn push(conv: ConvId, seq: SeqNum, frag: u8, payload: Bytes) -> Self {
        let mut seg = Self::new(conv, constants::CMD_PUSH, payload);
        seg.header.seq = seq;
        seg.header.frag = frag;
        seg
    }

    /// Create an ACK segment echoing the acked segment's timestamp
    pub fn ack(conv: ConvId, seq: SeqNum, ts: Timestamp) -> Self {
        let mut seg = Self::new(conv, constants::CMD_ACK, Bytes::new());
        seg.header.seq = seq;
        seg.header.ts = ts;
        seg
    }

    /// Create an unreliable datagram segment
    pub fn dgram(conv: ConvId, payload: Bytes) -> Self {
        Self::new(conv, constants::CMD_DGRAM, payload)
    }

    /// Encode segment into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode one segment from a datagram cursor. Multiple segments may be
    /// packed back-to-back in one datagram; call in a loop until empty.
    pub fn decode(buf: &mut Bytes) -> ArqResult<Self> {
        let header = SegmentHeader::decode(buf)?;

        if header.len as usize > buf.len() {
            return Err(ArqError::malformed(format!(
                "payload length {} exceeds remaining {} bytes",
                header.len,
                buf.len()
            )));
        }

        let payload = buf.split_to(header.len as usize);
        Ok(Self { header, payload })
    }

    /// Total size on the wire
    pub fn wire_size(&self) -> usize {
        SegmentHeader::SIZE + self.payload.len()
    }

    /// Check if this is a data segment
    pub fn is_push(&self) -> bool {
        self.header.cmd == constants::CMD_PUSH
    }

    /// Check if this is an ACK segment
    pub fn is_ack(&self) -> bool {
        self.header.cmd == constants::CMD_ACK
    }
}

/// Read the conversation id off the front of a raw datagram without decoding.
/// Used by the demultiplexer to route packets before any validation.
pub fn peek_conv(datagram: &[u8]) -> Option<ConvId> {
    if datagram.len() < SegmentHeader::SIZE {
        return None;
    }
    Some(u32::from_le_bytes([
        datagram[0],
        datagram[1],
        datagram[2],
        datagram[3],
    ]))
}

/// Recognize a connection-opening datagram and return its conversation id.
///
/// The first segment must be a PUSH with sequence 0, una 0, no further
/// fragments, and a payload starting with the HELLO opcode. Anything else
/// from an unknown conversation is dropped by the listener.
pub fn handshake_conv(datagram: &[u8]) -> Option<ConvId> {
    if datagram.len() < SegmentHeader::SIZE + 1 {
        return None;
    }
    let conv = peek_conv(datagram)?;
    let cmd = datagram[4];
    let frag = datagram[5];
    let seq = le32(datagram, 12);
    let una = le32(datagram, 16);
    let len = le32(datagram, 20);

    let ok = conv != 0
        && cmd == constants::CMD_PUSH
        && frag == 0
        && seq == 0
        && una == 0
        && len >= 1
        && datagram[SegmentHeader::SIZE] == constants::OP_HELLO;
    ok.then_some(conv)
}

fn le32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Stateless refusal datagram for a handshake the server cannot take on:
/// an unreliable goodbye on the rejected conversation id.
pub fn encode_refusal(conv: ConvId) -> Bytes {
    let seg = Segment::dgram(conv, Bytes::from_static(&[constants::OP_BYE]));
    let mut buf = BytesMut::with_capacity(seg.wire_size());
    seg.encode(&mut buf);
    buf.freeze()
}

/// Calculate time difference handling wrapping
pub fn time_diff(later: Timestamp, earlier: Timestamp) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Check if a sequence number is before another (handling wrapping)
pub fn seq_before(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// Check if a sequence number is after another (handling wrapping)
pub fn seq_after(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}
