//! Per-connection ARQ engine.
//!
//! Owns the full reliability pipeline for one conversation: fragmentation,
//! sliding-window admission, ack/una bookkeeping, RTT estimation, timeout and
//! fast retransmission, congestion control, zero-window probing, and the
//! unreliable datagram path. Pure and synchronous. The caller feeds raw
//! datagrams in via [`ArqEngine::input`] and calls [`ArqEngine::update`] on a
//! timer; encoded output accumulates for [`ArqEngine::drain_output`].

use crate::config::ArqConfig;
use crate::error::{ArqError, ArqResult};
use crate::protocol::{
    constants, seq_after, seq_before, time_diff, ConvId, Segment, SegmentHeader, SeqNum, Timestamp,
};
use crate::window::{RecvWindow, SendWindow};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Unreliable arrivals held for the application; oldest gives way on overflow.
const DGRAM_QUEUE_LIMIT: usize = 512;

/// Counters and gauges reported by [`ArqEngine::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ArqStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub dgrams_sent: u64,
    pub dgrams_received: u64,
    pub segments_sent: u64,
    pub segments_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: u64,
    pub fast_retransmits: u64,
    pub duplicates_dropped: u64,
    pub probes_sent: u64,
    /// Times the congestion window was cut (loss or fast-recovery)
    pub congestion_events: u64,
    pub srtt: u32,
    pub rttvar: u32,
    pub rto: u32,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub remote_wnd: u32,
    pub snd_queue_len: u32,
    pub snd_buf_len: u32,
    pub rcv_buf_len: u32,
    pub rcv_queue_len: u32,
}

/// Smoothed RTT estimator state
#[derive(Debug)]
struct RttState {
    srtt: u32,
    rttvar: u32,
    rto: u32,
}

/// Congestion control state
#[derive(Debug)]
struct CongestionState {
    cwnd: u32,
    ssthresh: u32,
    incr: u32,
}

/// Zero-window probing state
#[derive(Debug, Default)]
struct ProbeState {
    flags: u32,
    wait: u32,
    until: Timestamp,
}

pub struct ArqEngine {
    conv: ConvId,
    config: ArqConfig,
    mss: u32,

    /// Clock anchor; all timestamps are milliseconds since this instant
    epoch: Instant,
    last_flush: Timestamp,
    last_input: Timestamp,

    /// Fragmented messages waiting for window admission
    send_queue: VecDeque<Segment>,
    send_win: SendWindow,
    recv_win: RecvWindow,
    /// Contiguous segments staged for reassembly
    recv_queue: VecDeque<Segment>,
    recv_dgrams: VecDeque<Bytes>,

    /// (seq, echoed ts) pairs owed to the peer
    ack_list: Vec<(SeqNum, Timestamp)>,
    remote_wnd: u32,
    rtt: RttState,
    congestion: CongestionState,
    probe: ProbeState,

    /// Encoded datagrams awaiting the transport
    out: VecDeque<Bytes>,
    dead: bool,
    stats: ArqStats,
}

impl ArqEngine {
    pub fn new(conv: ConvId, config: ArqConfig) -> Self {
        let mss = config.mss().max(1);
        Self {
            conv,
            epoch: Instant::now(),
            // First update() must flush immediately
            last_flush: 0u32.wrapping_sub(config.delay.interval),
            last_input: 0,
            send_queue: VecDeque::new(),
            send_win: SendWindow::new(),
            recv_win: RecvWindow::new(config.rcv_wnd),
            recv_queue: VecDeque::new(),
            recv_dgrams: VecDeque::new(),
            ack_list: Vec::new(),
            remote_wnd: constants::WND_RCV,
            rtt: RttState {
                srtt: 0,
                rttvar: 0,
                rto: constants::RTO_DEF,
            },
            congestion: CongestionState {
                cwnd: 1,
                ssthresh: constants::THRESH_INIT,
                incr: mss,
            },
            probe: ProbeState::default(),
            out: VecDeque::new(),
            dead: false,
            stats: ArqStats::default(),
            mss,
            config,
        }
    }

    pub fn conv(&self) -> ConvId {
        self.conv
    }

    /// Milliseconds since this engine was created
    pub fn clock_ms(&self) -> Timestamp {
        self.epoch.elapsed().as_millis() as Timestamp
    }

    /// Milliseconds since the last valid inbound datagram
    pub fn idle_ms(&self) -> u32 {
        self.clock_ms().wrapping_sub(self.last_input)
    }

    /// True once the retry budget was exhausted on some segment
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Queued-plus-inflight reliable segments
    pub fn pending_send(&self) -> usize {
        self.send_queue.len() + self.send_win.len()
    }

    /// True when every reliable segment handed to `send` has been acked
    pub fn all_acked(&self) -> bool {
        self.send_queue.is_empty() && self.send_win.is_empty()
    }

    pub fn remote_window(&self) -> u32 {
        self.remote_wnd
    }

    /// Queue a reliable message, fragmenting as needed.
    ///
    /// Admission is all-or-nothing: either every fragment enters the backlog
    /// or the call fails with `WouldBlock` and nothing is consumed.
    pub fn send(&mut self, data: Bytes) -> ArqResult<()> {
        if data.is_empty() {
            return Err(ArqError::malformed("empty message"));
        }

        let max_fragments = constants::MAX_FRAGMENTS.min(self.config.rcv_wnd);
        let count = data.len().div_ceil(self.mss as usize) as u32;
        if count > max_fragments {
            return Err(ArqError::MessageTooLarge {
                size: data.len(),
                max: (max_fragments * self.mss) as usize,
            });
        }

        if self.pending_send() + count as usize > self.config.send_backlog as usize {
            return Err(ArqError::WouldBlock);
        }

        let mut offset = 0usize;
        for i in 0..count {
            let end = data.len().min(offset + self.mss as usize);
            let chunk = data.slice(offset..end);
            offset = end;
            // frag counts down so the receiver knows how many are still due
            let frag = (count - i - 1) as u8;
            self.send_queue
                .push_back(Segment::push(self.conv, 0, frag, chunk));
        }

        self.stats.messages_sent += 1;
        trace!(conv = %self.conv, size = data.len(), fragments = count, "message queued");
        Ok(())
    }

    /// Fire one unreliable datagram, bypassing the reliability machinery.
    /// Encoded immediately; no sequence number is consumed.
    pub fn send_unreliable(&mut self, data: Bytes) -> ArqResult<()> {
        if data.len() > self.mss as usize {
            return Err(ArqError::MessageTooLarge {
                size: data.len(),
                max: self.mss as usize,
            });
        }

        let now = self.clock_ms();
        let mut seg = Segment::dgram(self.conv, data);
        seg.header.ts = now;
        seg.header.wnd = self.advertised_window();
        seg.header.una = self.recv_win.next_seq();

        let mut buf = BytesMut::with_capacity(seg.wire_size());
        seg.encode(&mut buf);
        self.stats.segments_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        self.stats.dgrams_sent += 1;
        self.out.push_back(buf.freeze());
        Ok(())
    }

    /// Pop the next complete reliable message, reassembled in order.
    pub fn recv(&mut self) -> Option<Bytes> {
        let (size, parts) = self.peek_message()?;
        let was_full = self.recv_queue.len() >= self.config.rcv_wnd as usize;

        let mut message = BytesMut::with_capacity(size);
        for _ in 0..parts {
            if let Some(seg) = self.recv_queue.pop_front() {
                message.extend_from_slice(&seg.payload);
            }
        }

        // Freed staging space may unblock buffered arrivals
        self.promote_ready();

        if was_full && self.recv_queue.len() < self.config.rcv_wnd as usize {
            // Window reopened; tell the peer instead of waiting to be probed
            self.probe.flags |= constants::ASK_TELL;
        }

        self.stats.messages_received += 1;
        Some(message.freeze())
    }

    /// Pop the next unreliable datagram payload.
    pub fn recv_unreliable(&mut self) -> Option<Bytes> {
        self.recv_dgrams.pop_front()
    }

    /// First payload byte of the next complete reliable message without
    /// consuming it; `Some(0)` for an empty payload.
    pub fn peek_message_opcode(&self) -> Option<u8> {
        self.peek_message()?;
        let first = self.recv_queue.front()?;
        Some(first.payload.first().copied().unwrap_or(0))
    }

    /// (total size, fragment count) of the next message, if complete
    fn peek_message(&self) -> Option<(usize, usize)> {
        let first = self.recv_queue.front()?;
        let parts = first.header.frag as usize + 1;
        if self.recv_queue.len() < parts {
            return None;
        }
        let size = self
            .recv_queue
            .iter()
            .take(parts)
            .map(|seg| seg.payload.len())
            .sum();
        Some((size, parts))
    }

    /// Process one inbound datagram, which may carry several packed segments.
    ///
    /// Malformed tails and mismatched conversation ids are dropped after the
    /// valid prefix is processed; only a datagram too short to carry any
    /// header at all is reported as an error.
    pub fn input(&mut self, data: Bytes) -> ArqResult<()> {
        if data.len() < SegmentHeader::SIZE {
            return Err(ArqError::malformed(format!(
                "datagram too short: {} bytes",
                data.len()
            )));
        }

        let now = self.clock_ms();
        self.stats.bytes_received += data.len() as u64;

        let prev_una = self.send_win.una();
        let mut max_ack: Option<SeqNum> = None;
        let mut buf = data;

        while !buf.is_empty() {
            let segment = match Segment::decode(&mut buf) {
                Ok(seg) => seg,
                Err(e) => {
                    debug!(conv = %self.conv, error = %e, "dropping malformed datagram tail");
                    break;
                }
            };

            if segment.header.conv != self.conv {
                debug!(
                    conv = %self.conv,
                    got = segment.header.conv,
                    "conversation id mismatch, dropping datagram"
                );
                break;
            }

            // Only a valid segment for this conversation counts as activity
            self.last_input = now;
            self.stats.segments_received += 1;
            self.remote_wnd = segment.header.wnd as u32;

            let header = segment.header;
            match header.cmd {
                constants::CMD_ACK => {
                    // Explicit ack before the una sweep, so the RTT sample
                    // still sees the entry's transmit count
                    if let Some(xmit) = self.send_win.ack_seq(header.seq) {
                        // Karn: retransmitted segments give ambiguous samples
                        if xmit == 1 && time_diff(now, header.ts) >= 0 {
                            self.update_rtt(now.wrapping_sub(header.ts));
                        }
                    }
                    max_ack = Some(match max_ack {
                        Some(prev) if !seq_after(header.seq, prev) => prev,
                        _ => header.seq,
                    });
                    trace!(conv = %self.conv, seq = header.seq, "ack");
                }
                constants::CMD_PUSH => {
                    if self.recv_win.should_ack(header.seq) {
                        // Ack duplicates too, or the peer retransmits forever
                        self.ack_list.push((header.seq, header.ts));
                        if self.recv_win.insert(segment) {
                            self.promote_ready();
                        } else {
                            self.stats.duplicates_dropped += 1;
                        }
                    }
                }
                constants::CMD_PROBE => {
                    self.probe.flags |= constants::ASK_TELL;
                    trace!(conv = %self.conv, "window probe received");
                }
                constants::CMD_PROBE_REPLY => {
                    // Window already captured from the header
                }
                constants::CMD_DGRAM => {
                    self.stats.dgrams_received += 1;
                    if self.recv_dgrams.len() >= DGRAM_QUEUE_LIMIT {
                        self.recv_dgrams.pop_front();
                    }
                    self.recv_dgrams.push_back(segment.payload);
                }
                _ => {}
            }

            self.send_win.ack_cumulative(header.una);
        }

        if let Some(seq) = max_ack {
            self.send_win.mark_skipped(seq);
        }

        // Congestion window grows only when this round acked new data
        if seq_after(self.send_win.una(), prev_una) {
            self.grow_congestion_window();
        }

        Ok(())
    }

    /// Tick entry point: flushes when the configured interval has elapsed.
    pub fn update(&mut self) -> ArqResult<()> {
        let now = self.clock_ms();
        if time_diff(now, self.last_flush) >= self.config.delay.interval as i32 {
            self.last_flush = now;
            self.flush()?;
        }
        Ok(())
    }

    /// Emit everything currently owed to the wire: acks, probes, admitted
    /// data, and due retransmissions, packed into MTU-sized datagrams.
    pub fn flush(&mut self) -> ArqResult<()> {
        let now = self.clock_ms();
        let mut pkt = BytesMut::with_capacity(self.config.mtu as usize);

        self.flush_acks(&mut pkt);
        self.update_probe_timer(now);
        self.flush_probes(now, &mut pkt);
        self.fill_send_window();
        let result = self.flush_data(now, &mut pkt);

        if !pkt.is_empty() {
            self.stats.bytes_sent += pkt.len() as u64;
            self.out.push_back(pkt.freeze());
        }
        result
    }

    /// Take all encoded datagrams queued for the transport.
    pub fn drain_output(&mut self) -> Vec<Bytes> {
        self.out.drain(..).collect()
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Current statistics with fresh queue gauges.
    pub fn stats(&self) -> ArqStats {
        let mut s = self.stats;
        s.srtt = self.rtt.srtt;
        s.rttvar = self.rtt.rttvar;
        s.rto = self.rtt.rto;
        s.cwnd = self.congestion.cwnd;
        s.ssthresh = self.congestion.ssthresh;
        s.remote_wnd = self.remote_wnd;
        s.snd_queue_len = self.send_queue.len() as u32;
        s.snd_buf_len = self.send_win.len() as u32;
        s.rcv_buf_len = self.recv_win.len() as u32;
        s.rcv_queue_len = self.recv_queue.len() as u32;
        s
    }

    // --- internals -------------------------------------------------------

    fn promote_ready(&mut self) {
        self.recv_win
            .promote(&mut self.recv_queue, self.config.rcv_wnd as usize);
    }

    /// Free receive-queue capacity advertised to the peer
    fn advertised_window(&self) -> u16 {
        let free = (self.config.rcv_wnd as usize).saturating_sub(self.recv_queue.len());
        free.min(u16::MAX as usize) as u16
    }

    fn update_rtt(&mut self, rtt: u32) {
        if self.rtt.srtt == 0 {
            self.rtt.srtt = rtt.max(1);
            self.rtt.rttvar = rtt / 2;
        } else {
            let delta = self.rtt.srtt.abs_diff(rtt);
            self.rtt.rttvar = (3 * self.rtt.rttvar + delta) / 4;
            self.rtt.srtt = ((7 * self.rtt.srtt + rtt) / 8).max(1);
        }
        let rto = self.rtt.srtt + (4 * self.rtt.rttvar).max(self.config.delay.interval);
        self.rtt.rto = rto.clamp(self.config.rto_min, self.config.rto_max);
    }

    fn grow_congestion_window(&mut self) {
        if self.config.delay.no_congestion_control {
            return;
        }
        let mss = self.mss;
        let cg = &mut self.congestion;
        if cg.cwnd >= self.remote_wnd {
            return;
        }
        if cg.cwnd < cg.ssthresh {
            // Slow start: one segment per acked round
            cg.cwnd += 1;
            cg.incr += mss;
        } else {
            // Congestion avoidance: roughly one segment per RTT
            if cg.incr < mss {
                cg.incr = mss;
            }
            cg.incr += (mss * mss) / cg.incr + (mss / 16);
            if (cg.cwnd + 1) * mss <= cg.incr {
                cg.cwnd = (cg.incr + mss - 1) / mss;
            }
        }
        if cg.cwnd > self.remote_wnd {
            cg.cwnd = self.remote_wnd;
            cg.incr = self.remote_wnd * mss;
        }
    }

    /// Append a segment to the working packet, emitting it first when the
    /// addition would exceed the MTU.
    fn push_to_packet(&mut self, pkt: &mut BytesMut, seg: &Segment) {
        if !pkt.is_empty() && pkt.len() + seg.wire_size() > self.config.mtu as usize {
            let full = std::mem::replace(pkt, BytesMut::with_capacity(self.config.mtu as usize));
            self.stats.bytes_sent += full.len() as u64;
            self.out.push_back(full.freeze());
        }
        seg.encode(pkt);
        self.stats.segments_sent += 1;
    }

    fn flush_acks(&mut self, pkt: &mut BytesMut) {
        if self.ack_list.is_empty() {
            return;
        }
        let wnd = self.advertised_window();
        let una = self.recv_win.next_seq();
        let acks = std::mem::take(&mut self.ack_list);
        for (seq, ts) in acks {
            let mut seg = Segment::ack(self.conv, seq, ts);
            seg.header.wnd = wnd;
            seg.header.una = una;
            self.push_to_packet(pkt, &seg);
        }
    }

    fn update_probe_timer(&mut self, now: Timestamp) {
        if self.remote_wnd == 0 {
            if self.probe.wait == 0 {
                self.probe.wait = self.config.probe_init_ms;
                self.probe.until = now.wrapping_add(self.probe.wait);
            } else if time_diff(now, self.probe.until) >= 0 {
                if self.probe.wait < self.config.probe_init_ms {
                    self.probe.wait = self.config.probe_init_ms;
                }
                self.probe.wait += self.probe.wait / 2;
                self.probe.wait = self.probe.wait.min(constants::PROBE_LIMIT);
                self.probe.until = now.wrapping_add(self.probe.wait);
                self.probe.flags |= constants::ASK_SEND;
            }
        } else {
            self.probe.wait = 0;
            self.probe.until = 0;
        }
    }

    fn flush_probes(&mut self, now: Timestamp, pkt: &mut BytesMut) {
        if self.probe.flags == 0 {
            return;
        }
        let wnd = self.advertised_window();
        let una = self.recv_win.next_seq();

        if self.probe.flags & constants::ASK_SEND != 0 {
            let mut seg = Segment::new(self.conv, constants::CMD_PROBE, Bytes::new());
            seg.header.ts = now;
            seg.header.wnd = wnd;
            seg.header.una = una;
            self.push_to_packet(pkt, &seg);
            self.stats.probes_sent += 1;
            debug!(conv = %self.conv, "sending zero-window probe");
        }
        if self.probe.flags & constants::ASK_TELL != 0 {
            let mut seg = Segment::new(self.conv, constants::CMD_PROBE_REPLY, Bytes::new());
            seg.header.ts = now;
            seg.header.wnd = wnd;
            seg.header.una = una;
            self.push_to_packet(pkt, &seg);
        }
        self.probe.flags = 0;
    }

    /// Admit queued segments into flight, bounded by the effective window.
    fn fill_send_window(&mut self) {
        let mut limit = self.config.snd_wnd.min(self.remote_wnd);
        if !self.config.delay.no_congestion_control {
            limit = limit.min(self.congestion.cwnd);
        }
        while seq_before(
            self.send_win.next_seq(),
            self.send_win.una().wrapping_add(limit),
        ) {
            match self.send_queue.pop_front() {
                Some(seg) => self.send_win.enqueue(seg),
                None => break,
            }
        }
    }

    fn flush_data(&mut self, now: Timestamp, pkt: &mut BytesMut) -> ArqResult<()> {
        let resend_threshold = if self.config.delay.resend > 0 {
            self.config.delay.resend
        } else {
            u32::MAX
        };
        let rto_floor = if self.config.delay.nodelay {
            0
        } else {
            self.rtt.rto >> 3
        };
        let nodelay = self.config.delay.nodelay;
        let rto_max = self.config.rto_max;
        let max_retries = self.config.max_retries;
        let current_rto = self.rtt.rto;
        let wnd = self.advertised_window();
        let una = self.recv_win.next_seq();

        let mut lost = false;
        let mut change = false;
        let mut dead_seq = None;
        let mut to_send: Vec<Segment> = Vec::new();

        for entry in self.send_win.iter_mut() {
            let mut needsend = false;

            if entry.xmit == 0 {
                // First transmission
                needsend = true;
                entry.rto = current_rto;
                entry.resend_at = now.wrapping_add(entry.rto + rto_floor);
            } else if time_diff(now, entry.resend_at) >= 0 {
                // RTO expired: retransmit with backoff
                needsend = true;
                entry.rto = if nodelay {
                    entry.rto + entry.rto / 2
                } else {
                    entry.rto.saturating_mul(2)
                }
                .min(rto_max);
                entry.resend_at = now.wrapping_add(entry.rto);
                lost = true;
                self.stats.retransmits += 1;
                debug!(
                    conv = %self.conv,
                    seq = entry.seg.header.seq,
                    xmit = entry.xmit + 1,
                    rto = entry.rto,
                    "timeout retransmit"
                );
            } else if entry.fast_acks >= resend_threshold && entry.xmit <= constants::FASTACK_LIMIT
            {
                // Enough later acks skipped this segment
                needsend = true;
                entry.fast_acks = 0;
                entry.resend_at = now.wrapping_add(entry.rto);
                change = true;
                self.stats.fast_retransmits += 1;
                debug!(conv = %self.conv, seq = entry.seg.header.seq, "fast retransmit");
            }

            if needsend {
                entry.xmit += 1;
                entry.seg.header.ts = now;
                entry.seg.header.wnd = wnd;
                entry.seg.header.una = una;
                to_send.push(entry.seg.clone());

                if entry.xmit >= max_retries {
                    dead_seq = Some(entry.seg.header.seq);
                }
            }
        }

        for seg in &to_send {
            self.push_to_packet(pkt, seg);
        }

        // Congestion response, decided once per flush
        if change {
            let inflight = self.send_win.inflight();
            self.congestion.ssthresh = (inflight / 2).max(constants::THRESH_MIN);
            self.congestion.cwnd = self.congestion.ssthresh + self.config.delay.resend;
            self.congestion.incr = self.congestion.cwnd * self.mss;
            self.stats.congestion_events += 1;
        }
        if lost {
            self.congestion.ssthresh = (self.congestion.cwnd / 2).max(constants::THRESH_MIN);
            self.congestion.cwnd = 1;
            self.congestion.incr = self.mss;
            self.stats.congestion_events += 1;
        }
        if self.congestion.cwnd < 1 {
            self.congestion.cwnd = 1;
            self.congestion.incr = self.mss;
        }

        if let Some(seq) = dead_seq {
            self.dead = true;
            warn!(
                conv = %self.conv,
                seq,
                budget = max_retries,
                "retry budget exhausted, connection dead"
            );
            return Err(ArqError::ConnectionLost);
        }
        Ok(())
    }

    /// Shift the clock backwards so timers fire without real sleeps.
    #[cfg(test)]
    pub(crate) fn advance_clock(&mut self, ms: u64) {
        self.epoch -= std::time::Duration::from_millis(ms);
    }
}
