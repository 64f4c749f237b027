//! High-level async connection handle.
//!
//! [`TetherStream`] exposes two faces over one connection: a message API
//! (`send` / `recv` keep message boundaries, plus an unreliable channel) and
//! the tokio `AsyncRead` / `AsyncWrite` traits for code that wants a byte
//! stream. Both drive the same actor task owning the [`Peer`].

use crate::actor::{run_peer_actor, PeerHandle};
use crate::buffer_pool::{try_get_buffer, try_put_buffer};
use crate::config::TetherConfig;
use crate::error::{Result, TetherError};
use crate::transport::{Transport, UdpTransport};

use bytes::{Buf, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tether_core::protocol::{constants, random_conv_id, ConvId};
use tether_core::{ArqStats, ConnectionState, DisconnectReason, Peer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info};

/// Queue depths between stream, actor, and socket tasks.
pub(crate) const CMD_QUEUE: usize = 64;
pub(crate) const INPUT_QUEUE: usize = 256;
pub(crate) const DATA_QUEUE: usize = 256;
pub(crate) const DGRAM_QUEUE: usize = 256;

type BoxedOp = Pin<Box<dyn Future<Output = Result<()>> + Send + Sync>>;

/// Reliable-ordered connection with an unreliable side channel.
///
/// Dropping the stream starts a graceful close in the background; call
/// [`disconnect`](Self::disconnect) to wait for the goodbye to be acked.
pub struct TetherStream<T: Transport = UdpTransport> {
    handle: PeerHandle,
    data_rx: mpsc::Receiver<Bytes>,
    dgram_rx: mpsc::Receiver<Bytes>,
    shutdown_rx: watch::Receiver<Option<DisconnectReason>>,

    local_addr: T::Addr,
    peer_addr: T::Addr,
    conv: ConvId,
    max_message: usize,

    // AsyncRead/AsyncWrite state
    read_buf: BytesMut,
    write_in_flight: Option<(BoxedOp, usize)>,
    flush_in_flight: Option<BoxedOp>,

    // Background tasks
    recv_task: Option<JoinHandle<()>>,
    actor_task: Option<JoinHandle<()>>,
}

impl<T: Transport> std::fmt::Debug for TetherStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherStream")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("conv", &self.conv)
            .field("max_message", &self.max_message)
            .finish_non_exhaustive()
    }
}

/// Everything the listener hands over when a server-side stream is assembled.
pub(crate) struct StreamParts<T: Transport> {
    pub handle: PeerHandle,
    pub data_rx: mpsc::Receiver<Bytes>,
    pub dgram_rx: mpsc::Receiver<Bytes>,
    pub shutdown_rx: watch::Receiver<Option<DisconnectReason>>,
    pub local_addr: T::Addr,
    pub peer_addr: T::Addr,
    pub conv: ConvId,
    pub max_message: usize,
    pub actor_task: JoinHandle<()>,
}

impl TetherStream<UdpTransport> {
    /// Connect to `addr` over a fresh UDP socket.
    ///
    /// Resolves once the handshake completes or fails the configured
    /// connect timeout.
    pub async fn connect(addr: SocketAddr, config: TetherConfig) -> Result<Self> {
        let transport = UdpTransport::bind("0.0.0.0:0").await?;
        Self::connect_via(transport, addr, config).await
    }
}

impl<T: Transport> TetherStream<T> {
    /// Connect over a caller-supplied transport.
    pub async fn connect_via(
        transport: T,
        peer_addr: T::Addr,
        config: TetherConfig,
    ) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(transport);
        let local_addr = transport.local_addr()?;
        let conv = random_conv_id();
        let peer = Peer::new_client(conv, config.clone().into());

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);
        let (dgram_tx, dgram_rx) = mpsc::channel(DGRAM_QUEUE);
        let (connected_tx, connected_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(None);

        // Socket task: pull datagrams, keep only those from our peer
        let recv_transport = transport.clone();
        let expected = peer_addr.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = try_get_buffer(65536);
            buf.resize(65536, 0);
            loop {
                match recv_transport.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        if src != expected {
                            continue;
                        }
                        if input_tx.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "socket receive failed");
                        break;
                    }
                }
            }
            try_put_buffer(buf);
        });

        let actor_task = tokio::spawn(run_peer_actor(
            peer,
            cmd_rx,
            input_rx,
            data_tx,
            dgram_tx,
            connected_tx,
            shutdown_tx,
            transport,
            peer_addr.clone(),
            config.delay.interval as u64,
        ));

        let mut stream = Self {
            handle: PeerHandle::new(cmd_tx),
            data_rx,
            dgram_rx,
            shutdown_rx,
            local_addr,
            peer_addr,
            conv,
            max_message: max_message_for(&config),
            read_buf: try_get_buffer(2048),
            write_in_flight: None,
            flush_in_flight: None,
            recv_task: Some(recv_task),
            actor_task: Some(actor_task),
        };

        match timeout(config.connect_timeout, connected_rx).await {
            Ok(Ok(())) => {
                info!(peer = %stream.peer_addr, conv, "connected");
                Ok(stream)
            }
            Ok(Err(_)) => {
                // Actor ended before the handshake finished; the watch says why
                let reason = stream
                    .disconnect_reason()
                    .unwrap_or(DisconnectReason::HandshakeTimeout);
                Err(TetherError::disconnected(reason))
            }
            Err(_) => {
                stream.handle.close();
                Err(TetherError::timeout(config.connect_timeout.as_millis() as u64))
            }
        }
    }

    pub(crate) fn from_parts(parts: StreamParts<T>) -> Self {
        Self {
            handle: parts.handle,
            data_rx: parts.data_rx,
            dgram_rx: parts.dgram_rx,
            shutdown_rx: parts.shutdown_rx,
            local_addr: parts.local_addr,
            peer_addr: parts.peer_addr,
            conv: parts.conv,
            max_message: parts.max_message,
            read_buf: try_get_buffer(2048),
            write_in_flight: None,
            flush_in_flight: None,
            recv_task: None,
            actor_task: Some(parts.actor_task),
        }
    }

    /// Send one message on the reliable, ordered channel.
    ///
    /// Waits while the send backlog is full, so slow links exert
    /// backpressure instead of erroring.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.handle.send(Bytes::copy_from_slice(data)).await
    }

    /// Fire one datagram on the unreliable channel. May be lost, duplicated,
    /// or reordered in transit; must fit a single MTU.
    pub async fn send_unreliable(&self, data: &[u8]) -> Result<()> {
        self.handle.send_unreliable(Bytes::copy_from_slice(data)).await
    }

    /// Receive the next reliable message, preserving boundaries.
    ///
    /// Returns `None` once the connection is closed and everything delivered;
    /// [`disconnect_reason`](Self::disconnect_reason) says why.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }

    /// Receive the next unreliable datagram.
    pub async fn recv_unreliable(&mut self) -> Option<Bytes> {
        self.dgram_rx.recv().await
    }

    /// Close gracefully and wait for the goodbye to be acked or the grace
    /// period to lapse.
    pub async fn disconnect(&mut self) {
        self.handle.close();
        let _ = self.shutdown_rx.wait_for(|r| r.is_some()).await;
        // Join the actor so the goodbye's final datagrams hit the socket
        // before this call returns
        if let Some(task) = self.actor_task.take() {
            let _ = task.await;
        }
    }

    /// Why the connection ended, if it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.shutdown_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.disconnect_reason().is_some()
    }

    pub fn local_addr(&self) -> &T::Addr {
        &self.local_addr
    }

    pub fn peer_addr(&self) -> &T::Addr {
        &self.peer_addr
    }

    /// Conversation ID shared with the remote endpoint.
    pub fn conv(&self) -> ConvId {
        self.conv
    }

    /// Largest message the reliable channel accepts.
    pub fn max_message(&self) -> usize {
        self.max_message
    }

    /// Snapshot of the connection's protocol statistics.
    pub async fn stats(&self) -> Result<ArqStats> {
        self.handle.stats().await
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        self.handle.state().await
    }
}

pub(crate) fn max_message_for(config: &TetherConfig) -> usize {
    let mss = config.mtu.saturating_sub(constants::OVERHEAD).max(1);
    // Mirrors the engine's admission cap, minus the opcode framing byte
    let max_fragments = constants::MAX_FRAGMENTS.min(config.rcv_wnd);
    (mss * max_fragments) as usize - 1
}

fn to_io(e: TetherError) -> io::Error {
    if e.is_closed() {
        io::Error::new(io::ErrorKind::BrokenPipe, e)
    } else {
        io::Error::other(e)
    }
}

impl<T: Transport> Drop for TetherStream<T> {
    fn drop(&mut self) {
        // The actor says goodbye on its own; only the socket task needs killing
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        self.handle.close();

        if self.read_buf.capacity() > 0 {
            let mut buf = std::mem::take(&mut self.read_buf);
            buf.clear();
            try_put_buffer(buf);
        }
    }
}

impl<T: Transport> AsyncRead for TetherStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_buf.is_empty() {
            let n = buf.remaining().min(this.read_buf.len());
            buf.put_slice(&this.read_buf[..n]);
            this.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }

        match this.data_rx.poll_recv(cx) {
            Poll::Ready(Some(msg)) => {
                let n = buf.remaining().min(msg.len());
                buf.put_slice(&msg[..n]);
                if n < msg.len() {
                    this.read_buf.extend_from_slice(&msg[n..]);
                }
                Poll::Ready(Ok(()))
            }
            // Connection over, everything delivered: clean EOF
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Transport> AsyncWrite for TetherStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            // A stored send completes for the chunk captured when it was
            // created; callers keep the data stable across polls per the
            // AsyncWrite contract
            if let Some((fut, len)) = this.write_in_flight.as_mut() {
                let len = *len;
                return match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(())) => {
                        this.write_in_flight = None;
                        Poll::Ready(Ok(len))
                    }
                    Poll::Ready(Err(e)) => {
                        this.write_in_flight = None;
                        Poll::Ready(Err(to_io(e)))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }

            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let n = buf.len().min(this.max_message);
            let data = Bytes::copy_from_slice(&buf[..n]);
            let handle = this.handle.clone();
            this.write_in_flight = Some((Box::pin(async move { handle.send(data).await }), n));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.flush_in_flight.as_mut() {
                return match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(())) => {
                        this.flush_in_flight = None;
                        Poll::Ready(Ok(()))
                    }
                    Poll::Ready(Err(e)) => {
                        this.flush_in_flight = None;
                        Poll::Ready(Err(to_io(e)))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }

            let handle = this.handle.clone();
            this.flush_in_flight = Some(Box::pin(async move { handle.flush().await }));
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.handle.close();
        Poll::Ready(Ok(()))
    }
}
