//! Actor-based connection driver. Owns the [`Peer`] in a dedicated task
//! and talks to it over channels; no locks on the hot path.

use crate::error::{ConnectionError, Result, TetherError};
use crate::metrics::global_metrics;
use crate::transport::Transport;

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{ArqStats, Channel, ConnectionState, DisconnectReason, Peer, PeerEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Commands sent to the connection actor.
pub(crate) enum PeerCmd {
    Send {
        data: Bytes,
        channel: Channel,
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<ArqStats>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
    Close,
}

/// Clonable, lock-free handle to a connection actor.
#[derive(Clone)]
pub(crate) struct PeerHandle {
    cmd_tx: mpsc::Sender<PeerCmd>,
}

impl PeerHandle {
    pub fn new(cmd_tx: mpsc::Sender<PeerCmd>) -> Self {
        Self { cmd_tx }
    }

    /// Send a command and wait for the reply. Returns a connection-closed
    /// error if the actor has exited.
    async fn request<R>(&self, cmd: impl FnOnce(oneshot::Sender<R>) -> PeerCmd) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(cmd(reply))
            .await
            .map_err(|_| TetherError::connection(ConnectionError::Closed))?;
        rx.await
            .map_err(|_| TetherError::connection(ConnectionError::Closed))
    }

    /// Queue `data` on the reliable channel. Resolves once the engine admits
    /// the message, so a full backlog parks the caller instead of failing.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.request(|reply| PeerCmd::Send {
            data,
            channel: Channel::Reliable,
            reply,
        })
        .await?
    }

    /// Fire `data` on the unreliable channel.
    pub async fn send_unreliable(&self, data: Bytes) -> Result<()> {
        self.request(|reply| PeerCmd::Send {
            data,
            channel: Channel::Unreliable,
            reply,
        })
        .await?
    }

    pub async fn flush(&self) -> Result<()> {
        self.request(|reply| PeerCmd::Flush { reply }).await?
    }

    pub async fn stats(&self) -> Result<ArqStats> {
        self.request(|reply| PeerCmd::Stats { reply }).await
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        self.request(|reply| PeerCmd::State { reply }).await
    }

    /// Begin a graceful close without waiting for it to finish.
    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(PeerCmd::Close);
    }
}

/// Run the connection actor loop.
///
/// - `input_rx`: raw datagrams from the socket task (client) or the
///   listener's router (server).
/// - `data_tx` / `dgram_tx`: application messages out to the stream.
/// - `connected_tx`: fired once when the handshake completes.
/// - `shutdown_tx`: carries the disconnect reason when the connection ends.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_peer_actor<T: Transport>(
    mut peer: Peer,
    mut cmd_rx: mpsc::Receiver<PeerCmd>,
    mut input_rx: mpsc::Receiver<Bytes>,
    data_tx: mpsc::Sender<Bytes>,
    dgram_tx: mpsc::Sender<Bytes>,
    connected_tx: oneshot::Sender<()>,
    shutdown_tx: watch::Sender<Option<DisconnectReason>>,
    transport: Arc<T>,
    peer_addr: T::Addr,
    tick_interval_ms: u64,
) {
    global_metrics().connection_opened();

    let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut connected_tx = Some(connected_tx);
    let mut parked: VecDeque<(Bytes, Channel, oneshot::Sender<Result<()>>)> = VecDeque::new();
    let mut cmd_open = true;
    let mut input_open = true;

    loop {
        tokio::select! {
            biased;

            // Tick first: a busy socket must not starve the retransmission timers
            _ = interval.tick() => {
                peer.tick();
            }

            cmd = cmd_rx.recv(), if cmd_open => {
                match cmd {
                    Some(PeerCmd::Send { data, channel, reply }) => {
                        match try_send(&mut peer, &data, channel) {
                            Err(e) if e.is_backpressure() => {
                                parked.push_back((data, channel, reply));
                            }
                            result => {
                                let _ = reply.send(result);
                            }
                        }
                    }
                    Some(PeerCmd::Flush { reply }) => {
                        let _ = reply.send(flush_result(&peer));
                    }
                    Some(PeerCmd::Stats { reply }) => {
                        let _ = reply.send(peer.stats());
                    }
                    Some(PeerCmd::State { reply }) => {
                        let _ = reply.send(peer.state());
                    }
                    Some(PeerCmd::Close) => {
                        peer.disconnect();
                    }
                    None => {
                        // Every handle dropped; close gracefully
                        cmd_open = false;
                        peer.disconnect();
                    }
                }
            }

            packet = input_rx.recv(), if input_open => {
                match packet {
                    Some(data) => peer.input(data),
                    None => {
                        // Feeder gone; the goodbye and grace timer wind things down
                        trace!(conv = peer.conv(), "input channel closed");
                        input_open = false;
                        peer.disconnect();
                    }
                }
            }
        }

        // Housekeeping after every wakeup
        retry_parked(&mut peer, &mut parked);
        drain_events(&mut peer, &mut connected_tx, &shutdown_tx);
        deliver(&mut peer, &data_tx, &dgram_tx);
        peer.flush();
        flush_output(&mut peer, &transport, &peer_addr).await;

        if peer.is_closed() {
            break;
        }
    }

    // Writers still parked on backpressure never got in
    for (_, _, reply) in parked {
        let _ = reply.send(Err(TetherError::connection(ConnectionError::Closed)));
    }
    global_metrics().connection_closed(&peer.stats());
    debug!(conv = peer.conv(), "connection actor exited");
}

fn try_send(peer: &mut Peer, data: &Bytes, channel: Channel) -> Result<()> {
    let result = match channel {
        Channel::Reliable => peer.send(data.clone()),
        Channel::Unreliable => peer.send_unreliable(data.clone()),
    };
    result.map_err(TetherError::from)
}

/// Retry parked sends in order; head-of-line stays parked until the
/// backlog drains.
fn retry_parked(
    peer: &mut Peer,
    parked: &mut VecDeque<(Bytes, Channel, oneshot::Sender<Result<()>>)>,
) {
    loop {
        let Some((data, channel, _)) = parked.front() else {
            break;
        };
        match try_send(peer, data, *channel) {
            Err(e) if e.is_backpressure() => break,
            result => {
                if let Some((_, _, reply)) = parked.pop_front() {
                    let _ = reply.send(result);
                }
            }
        }
    }
}

fn drain_events(
    peer: &mut Peer,
    connected_tx: &mut Option<oneshot::Sender<()>>,
    shutdown_tx: &watch::Sender<Option<DisconnectReason>>,
) {
    while let Some(event) = peer.poll_event() {
        match event {
            PeerEvent::Connected => {
                if let Some(tx) = connected_tx.take() {
                    let _ = tx.send(());
                }
            }
            PeerEvent::Disconnected { reason } => {
                debug!(conv = peer.conv(), %reason, "peer disconnected");
                let _ = shutdown_tx.send(Some(reason));
            }
        }
    }
}

/// Forward application messages to the stream side.
fn deliver(peer: &mut Peer, data_tx: &mpsc::Sender<Bytes>, dgram_tx: &mpsc::Sender<Bytes>) {
    // Reliable messages are never dropped: when the consumer lags, they stay
    // queued in the engine and the advertised window closes
    while data_tx.capacity() > 0 {
        match peer.recv() {
            Some(msg) => {
                if data_tx.try_send(msg).is_err() {
                    break;
                }
            }
            None => break,
        }
    }
    // Unreliable payloads go stale fast; drop on a full queue
    while let Some(d) = peer.recv_unreliable() {
        let _ = dgram_tx.try_send(d);
    }
}

fn flush_result(peer: &Peer) -> Result<()> {
    if peer.is_closed() {
        Err(TetherError::connection(ConnectionError::Closed))
    } else {
        Ok(())
    }
}

/// Ship every encoded datagram over the transport.
async fn flush_output<T: Transport>(peer: &mut Peer, transport: &Arc<T>, target: &T::Addr) {
    for buf in peer.drain_output() {
        if let Err(e) = transport.send_to(&buf, target).await {
            trace!(error = %e, "transport send failed");
        }
    }
}
