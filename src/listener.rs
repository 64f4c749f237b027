//! Listener accepting incoming connections over a shared transport.
//!
//! One background task owns the socket and routes every datagram by
//! conversation ID to the owning connection actor. Unknown conversations
//! may only open state with a well-formed handshake datagram; everything
//! else is dropped on the floor.

use crate::actor::{run_peer_actor, PeerHandle};
use crate::buffer_pool::{try_get_buffer, try_put_buffer};
use crate::config::TetherConfig;
use crate::error::{ConnectionError, Result, TetherError};
use crate::metrics::global_metrics;
use crate::stream::{
    max_message_for, StreamParts, TetherStream, CMD_QUEUE, DATA_QUEUE, DGRAM_QUEUE, INPUT_QUEUE,
};
use crate::transport::{Addr, Transport, UdpTransport};

use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::protocol::{encode_refusal, handshake_conv, peek_conv, ConvId};
use tether_core::Peer;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Routing entry for one live conversation.
///
/// The address is pinned at handshake; datagrams carrying a known conv from
/// a different source are treated as spoofed and dropped.
struct ConnEntry<A: Addr> {
    addr: A,
    input_tx: mpsc::Sender<Bytes>,
}

/// A connection whose actor is running but which has not been accepted yet.
struct Incoming<T: Transport> {
    parts: StreamParts<T>,
    connected_rx: oneshot::Receiver<()>,
}

/// Accepts connections and routes datagrams to their actors.
pub struct TetherListener<T: Transport = UdpTransport> {
    transport: Arc<T>,
    config: TetherConfig,
    local_addr: T::Addr,
    conns: Arc<DashMap<ConvId, ConnEntry<T::Addr>>>,
    accept_rx: mpsc::UnboundedReceiver<Incoming<T>>,
    listen_task: Option<JoinHandle<()>>,
}

impl TetherListener<UdpTransport> {
    /// Bind a UDP socket on `addr` and start listening.
    pub async fn bind(addr: SocketAddr, config: TetherConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addr).await?;
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> TetherListener<T> {
    /// Start listening on a caller-supplied transport.
    pub fn with_transport(transport: T, config: TetherConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(transport);
        let local_addr = transport.local_addr()?;
        let conns: Arc<DashMap<ConvId, ConnEntry<T::Addr>>> = Arc::new(DashMap::new());
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let listen_task = tokio::spawn(run_listener(
            transport.clone(),
            config.clone(),
            local_addr.clone(),
            conns.clone(),
            accept_tx,
        ));

        info!(addr = %local_addr, "listener started");
        Ok(Self {
            transport,
            config,
            local_addr,
            conns,
            accept_rx,
            listen_task: Some(listen_task),
        })
    }

    /// Wait for the next fully established connection.
    pub async fn accept(&mut self) -> Result<(TetherStream<T>, T::Addr)> {
        loop {
            let Some(incoming) = self.accept_rx.recv().await else {
                return Err(TetherError::connection(ConnectionError::Closed));
            };
            let peer_addr = incoming.parts.peer_addr.clone();
            let conv = incoming.parts.conv;

            // The actor confirms the moment it digests the hello, so this
            // normally resolves instantly; the timeout covers actors that
            // died in between
            match timeout(self.config.connect_timeout, incoming.connected_rx).await {
                Ok(Ok(())) => {
                    info!(peer = %peer_addr, conv, "accepted");
                    return Ok((TetherStream::from_parts(incoming.parts), peer_addr));
                }
                _ => {
                    debug!(peer = %peer_addr, conv, "handshake never completed, discarding");
                    continue;
                }
            }
        }
    }

    pub fn local_addr(&self) -> &T::Addr {
        &self.local_addr
    }

    /// Connections currently routed, accepted or not.
    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// Stop accepting. Established streams keep running on their own actors.
    pub fn close(&mut self) {
        if let Some(task) = self.listen_task.take() {
            task.abort();
        }
        info!(addr = %self.local_addr, "listener closed");
    }

    /// Reference to the shared transport, for sockets shared with other code.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

impl<T: Transport> Drop for TetherListener<T> {
    fn drop(&mut self) {
        if let Some(task) = self.listen_task.take() {
            task.abort();
        }
    }
}

/// Socket loop: route datagrams, open conversations, sweep dead entries.
async fn run_listener<T: Transport>(
    transport: Arc<T>,
    config: TetherConfig,
    local_addr: T::Addr,
    conns: Arc<DashMap<ConvId, ConnEntry<T::Addr>>>,
    accept_tx: mpsc::UnboundedSender<Incoming<T>>,
) {
    let mut buf = try_get_buffer(65536);
    buf.resize(65536, 0);
    let mut cleanup = tokio::time::interval(config.cleanup_interval);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            recv = transport.recv_from(&mut buf) => {
                let (len, src) = match recv {
                    Ok(r) => r,
                    Err(e) => {
                        error!(error = %e, "socket receive failed");
                        break;
                    }
                };
                let data = Bytes::copy_from_slice(&buf[..len]);
                route(&transport, &config, &local_addr, &conns, &accept_tx, data, src).await;
            }

            _ = cleanup.tick() => {
                let before = conns.len();
                conns.retain(|_, entry| !entry.input_tx.is_closed());
                let removed = before - conns.len();
                if removed > 0 {
                    debug!(removed, remaining = conns.len(), "swept finished conversations");
                }
            }
        }
    }
    try_put_buffer(buf);
}

async fn route<T: Transport>(
    transport: &Arc<T>,
    config: &TetherConfig,
    local_addr: &T::Addr,
    conns: &Arc<DashMap<ConvId, ConnEntry<T::Addr>>>,
    accept_tx: &mpsc::UnboundedSender<Incoming<T>>,
    data: Bytes,
    src: T::Addr,
) {
    let Some(conv) = peek_conv(&data) else {
        trace!(%src, len = data.len(), "runt datagram");
        return;
    };

    if let Some(entry) = conns.get(&conv) {
        if entry.addr == src {
            // A full input queue sheds load here; retransmission recovers
            let _ = entry.input_tx.try_send(data);
        } else {
            trace!(conv, %src, "conversation pinned to another address");
        }
        return;
    }

    // Unknown conversation: only a well-formed handshake opens state
    if handshake_conv(&data).is_none() {
        trace!(conv, %src, "datagram for unknown conversation");
        return;
    }

    if conns.len() >= config.max_connections {
        warn!(%src, conv, limit = config.max_connections, "connection table full, refusing");
        global_metrics().connection_refused();
        let refusal = encode_refusal(conv);
        if let Err(e) = transport.send_to(&refusal, &src).await {
            trace!(error = %e, "refusal send failed");
        }
        return;
    }

    let (input_tx, incoming) = spawn_conn(transport, config, local_addr, src.clone(), conv);
    // The hello itself is the first input the new actor sees
    let _ = input_tx.try_send(data);
    conns.insert(
        conv,
        ConnEntry {
            addr: src.clone(),
            input_tx,
        },
    );

    if accept_tx.send(incoming).is_err() {
        // Listener dropped mid-flight; the actor winds itself down
        debug!(conv, "accept queue gone, discarding connection");
        conns.remove(&conv);
        return;
    }
    debug!(conv, peer = %src, "connection queued for accept");
}

/// Build the channel plumbing for one server-side connection and spawn
/// its actor.
fn spawn_conn<T: Transport>(
    transport: &Arc<T>,
    config: &TetherConfig,
    local_addr: &T::Addr,
    peer_addr: T::Addr,
    conv: ConvId,
) -> (mpsc::Sender<Bytes>, Incoming<T>) {
    let peer = Peer::new_server(conv, config.clone().into());

    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE);
    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
    let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);
    let (dgram_tx, dgram_rx) = mpsc::channel(DGRAM_QUEUE);
    let (connected_tx, connected_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(None);

    let actor_task = tokio::spawn(run_peer_actor(
        peer,
        cmd_rx,
        input_rx,
        data_tx,
        dgram_tx,
        connected_tx,
        shutdown_tx,
        transport.clone(),
        peer_addr.clone(),
        config.delay.interval as u64,
    ));

    let parts = StreamParts {
        handle: PeerHandle::new(cmd_tx),
        data_rx,
        dgram_rx,
        shutdown_rx,
        local_addr: local_addr.clone(),
        peer_addr,
        conv,
        max_message: max_message_for(config),
        actor_task,
    };
    (input_tx, Incoming { parts, connected_rx })
}
