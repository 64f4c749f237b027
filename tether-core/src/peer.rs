//! Connection lifecycle over the ARQ engine.
//!
//! A [`Peer`] wraps one [`ArqEngine`] with the handshake, keepalive, and
//! goodbye machinery. Reliable messages and unreliable datagrams both carry a
//! one-byte opcode prefix; application payloads use `DATA`, everything else
//! is control traffic the peer consumes internally. Like the engine this is
//! pure and synchronous: the driving layer feeds datagrams in, calls
//! [`Peer::tick`] on a timer, ships [`Peer::drain_output`], and drains
//! lifecycle events.

use crate::config::ArqConfig;
use crate::engine::{ArqEngine, ArqStats};
use crate::error::{ArqError, ArqResult};
use crate::protocol::{constants, time_diff, ConvId, Timestamp};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Unreliable application payloads buffered for the consumer
const DGRAM_BUFFER: usize = 512;

/// Which delivery contract a message used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Reliable,
    Unreliable,
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in flight
    Connecting,
    /// Both sides exchanged hellos
    Connected,
    /// Goodbye sent, waiting for its ack or the grace deadline
    Disconnecting,
    /// Terminal
    Disconnected,
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer said goodbye
    PeerClosed,
    /// This side initiated the close
    LocalClosed,
    /// Nothing valid arrived within the idle timeout
    IdleTimeout,
    /// Handshake did not complete in time
    HandshakeTimeout,
    /// Server had no capacity for the conversation
    Refused,
    /// Retry budget exhausted on a segment
    Lost,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::PeerClosed => "peer closed",
            DisconnectReason::LocalClosed => "locally closed",
            DisconnectReason::IdleTimeout => "idle timeout",
            DisconnectReason::HandshakeTimeout => "handshake timeout",
            DisconnectReason::Refused => "connection refused",
            DisconnectReason::Lost => "connection lost",
        };
        f.write_str(s)
    }
}

/// Lifecycle events surfaced to the driving layer. Emitted at most once
/// each per connection, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
}

/// Which end of the handshake this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

pub struct Peer {
    engine: ArqEngine,
    config: ArqConfig,
    side: Side,
    state: ConnectionState,
    events: VecDeque<PeerEvent>,
    dgrams: VecDeque<Bytes>,
    last_ping: Timestamp,
    close_deadline: Option<Timestamp>,
}

impl Peer {
    /// Client end: queues its hello immediately; the first `tick` puts it on
    /// the wire and the ARQ retransmits it until the server answers.
    pub fn new_client(conv: ConvId, config: ArqConfig) -> Self {
        let mut peer = Self::new(Side::Client, conv, config);
        if let Err(e) = peer.send_control(constants::OP_HELLO) {
            // Fresh engine, empty backlog; only a broken config gets here
            warn!(conv, error = %e, "failed to queue hello");
        }
        peer
    }

    /// Server end for an accepted handshake datagram. Answers with its own
    /// hello once the client's arrives through the engine.
    pub fn new_server(conv: ConvId, config: ArqConfig) -> Self {
        Self::new(Side::Server, conv, config)
    }

    fn new(side: Side, conv: ConvId, config: ArqConfig) -> Self {
        Self {
            engine: ArqEngine::new(conv, config.clone()),
            config,
            side,
            state: ConnectionState::Connecting,
            events: VecDeque::new(),
            dgrams: VecDeque::new(),
            last_ping: 0,
            close_deadline: None,
        }
    }

    pub fn conv(&self) -> ConvId {
        self.engine.conv()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn stats(&self) -> ArqStats {
        self.engine.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    /// Next lifecycle event, if any.
    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        self.events.pop_front()
    }

    /// Send application data on the reliable channel.
    pub fn send(&mut self, data: Bytes) -> ArqResult<()> {
        match self.state {
            ConnectionState::Connected => self.engine.send(frame(constants::OP_DATA, &data)),
            ConnectionState::Connecting => Err(ArqError::WouldBlock),
            _ => Err(ArqError::ConnectionLost),
        }
    }

    /// Fire application data on the unreliable channel.
    pub fn send_unreliable(&mut self, data: Bytes) -> ArqResult<()> {
        match self.state {
            ConnectionState::Connected => {
                self.engine.send_unreliable(frame(constants::OP_DATA, &data))
            }
            ConnectionState::Connecting => Err(ArqError::WouldBlock),
            _ => Err(ArqError::ConnectionLost),
        }
    }

    /// Pop the next reliable application message, in order. Control messages
    /// ahead of it are consumed on the way.
    pub fn recv(&mut self) -> Option<Bytes> {
        self.pump_control();
        let op = self.engine.peek_message_opcode()?;
        if op != constants::OP_DATA {
            return None;
        }
        let msg = self.engine.recv()?;
        Some(msg.slice(1..))
    }

    /// Pop the next unreliable application payload.
    pub fn recv_unreliable(&mut self) -> Option<Bytes> {
        self.dgrams.pop_front()
    }

    /// Feed one raw datagram from the wire.
    pub fn input(&mut self, datagram: Bytes) {
        if let Err(e) = self.engine.input(datagram) {
            // Undecodable noise; the engine kept whatever prefix was valid
            debug!(conv = self.conv(), error = %e, "discarding datagram");
        }
        self.pump_dgrams();
        self.pump_control();
    }

    /// Drive timers: ARQ retransmission, handshake and idle deadlines,
    /// keepalive pings, and close-grace resolution.
    pub fn tick(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        if let Err(e) = self.engine.update() {
            if e.is_fatal() {
                self.finish(DisconnectReason::Lost);
                return;
            }
        }
        self.pump_control();

        let now = self.engine.clock_ms();
        match self.state {
            ConnectionState::Connecting => {
                // Clock starts at creation, so `now` is time spent connecting
                if now >= self.config.handshake_timeout_ms {
                    warn!(conv = self.conv(), side = ?self.side, "handshake timed out");
                    self.finish(DisconnectReason::HandshakeTimeout);
                }
            }
            ConnectionState::Connected => {
                if self.engine.idle_ms() >= self.config.idle_timeout_ms {
                    warn!(
                        conv = self.conv(),
                        idle_ms = self.engine.idle_ms(),
                        "peer went silent"
                    );
                    self.finish(DisconnectReason::IdleTimeout);
                } else if time_diff(now, self.last_ping) >= self.config.ping_interval_ms as i32 {
                    self.last_ping = now;
                    // Skipped under backpressure; a full window is its own
                    // proof of traffic
                    let _ = self.send_control(constants::OP_PING);
                }
            }
            ConnectionState::Disconnecting => {
                let grace_over = self
                    .close_deadline
                    .is_some_and(|d| time_diff(now, d) >= 0);
                if self.engine.all_acked() || grace_over {
                    self.finish(DisconnectReason::LocalClosed);
                }
            }
            ConnectionState::Disconnected => {}
        }
    }

    /// Encode whatever is due right now instead of waiting for the next tick.
    pub fn flush(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if let Err(e) = self.engine.flush() {
            if e.is_fatal() {
                self.finish(DisconnectReason::Lost);
            }
        }
    }

    /// Begin a graceful close: stop accepting writes, say goodbye, resolve
    /// once the goodbye is acked or the grace period runs out.
    pub fn disconnect(&mut self) {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.state = ConnectionState::Disconnecting;
                // A jammed backlog is fine; the grace deadline finishes the job
                let _ = self.send_control(constants::OP_BYE);
                let now = self.engine.clock_ms();
                self.close_deadline = Some(now.wrapping_add(self.config.close_grace_ms));
                debug!(conv = self.conv(), "closing");
            }
            _ => {}
        }
    }

    /// Encoded datagrams owed to the transport.
    pub fn drain_output(&mut self) -> Vec<Bytes> {
        self.engine.drain_output()
    }

    pub fn has_output(&self) -> bool {
        self.engine.has_output()
    }

    // --- internals -------------------------------------------------------

    fn send_control(&mut self, opcode: u8) -> ArqResult<()> {
        self.engine.send(Bytes::copy_from_slice(&[opcode]))
    }

    /// Consume control messages sitting at the front of the ordered stream.
    fn pump_control(&mut self) {
        while let Some(op) = self.engine.peek_message_opcode() {
            if op == constants::OP_DATA {
                break;
            }
            let Some(msg) = self.engine.recv() else { break };
            self.handle_control(op, msg.len());
        }
    }

    fn handle_control(&mut self, opcode: u8, len: usize) {
        match opcode {
            constants::OP_HELLO => self.on_hello(),
            constants::OP_PING => {
                trace!(conv = self.conv(), "ping");
            }
            constants::OP_BYE => self.on_bye(),
            _ => {
                debug!(conv = self.conv(), opcode, len, "unknown control opcode");
            }
        }
    }

    fn on_hello(&mut self) {
        match (self.side, self.state) {
            (Side::Server, ConnectionState::Connecting) => {
                if let Err(e) = self.send_control(constants::OP_HELLO) {
                    warn!(conv = self.conv(), error = %e, "failed to answer hello");
                }
                self.set_connected();
            }
            (Side::Client, ConnectionState::Connecting) => self.set_connected(),
            _ => trace!(conv = self.conv(), "redundant hello ignored"),
        }
    }

    fn on_bye(&mut self) {
        match self.state {
            ConnectionState::Disconnecting => self.finish(DisconnectReason::LocalClosed),
            ConnectionState::Disconnected => {}
            _ => self.finish(DisconnectReason::PeerClosed),
        }
    }

    /// Route buffered unreliable payloads: data to the consumer queue,
    /// goodbye/refusal handled immediately.
    fn pump_dgrams(&mut self) {
        while let Some(payload) = self.engine.recv_unreliable() {
            let Some(op) = payload.first().copied() else {
                continue;
            };
            match op {
                constants::OP_DATA => {
                    if self.state != ConnectionState::Connected {
                        trace!(conv = self.conv(), "datagram before handshake dropped");
                        continue;
                    }
                    if self.dgrams.len() >= DGRAM_BUFFER {
                        self.dgrams.pop_front();
                    }
                    self.dgrams.push_back(payload.slice(1..));
                }
                constants::OP_BYE => match self.state {
                    ConnectionState::Connecting if self.side == Side::Client => {
                        self.finish(DisconnectReason::Refused)
                    }
                    ConnectionState::Disconnected => {}
                    _ => self.finish(DisconnectReason::PeerClosed),
                },
                _ => {
                    trace!(conv = self.conv(), opcode = op, "stray unreliable opcode");
                }
            }
        }
    }

    fn set_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.last_ping = self.engine.clock_ms();
        info!(conv = self.conv(), side = ?self.side, "connected");
        self.events.push_back(PeerEvent::Connected);
    }

    fn finish(&mut self, reason: DisconnectReason) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        // Push out anything still owed, the goodbye's ack in particular,
        // before this peer goes quiet
        let _ = self.engine.flush();
        self.state = ConnectionState::Disconnected;
        info!(conv = self.conv(), %reason, "disconnected");
        self.events.push_back(PeerEvent::Disconnected { reason });
    }
}

/// Prefix `data` with a control opcode.
fn frame(opcode: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 1);
    buf.put_u8(opcode);
    buf.extend_from_slice(data);
    buf.freeze()
}
