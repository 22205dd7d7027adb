//! Repliable I2P datagrams through the SAM bridge's UDP forwarding
//!
//! Outbound packets go to the bridge's UDP port prefixed with
//! `3.0 <session id> <destination>\n`. Inbound packets are forwarded by the
//! bridge to our local socket prefixed with `<destination>[ FROM_PORT=.. TO_PORT=..]\n`.

use crate::keys::is_full_destination;
use crate::sam::SamConnection;
use async_trait::async_trait;
use onramp_core::{addr, BoxedConn, Listener, OnrampError, Result};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Largest datagram the bridge forwards
const MAX_DATAGRAM: usize = 65536;

/// Packets buffered per peer before the demultiplexer starts dropping
const PEER_QUEUE: usize = 64;

/// Datagram endpoint of a Garlic session
pub struct GarlicDatagram {
    socket: UdpSocket,
    session_id: String,
    sam_addr: String,
    sam_udp: SocketAddr,
    control_timeout: Duration,
    local_addr: String,
    /// Bridge connection holding the DATAGRAM session open
    session: Mutex<Option<SamConnection>>,
}

impl GarlicDatagram {
    pub(crate) fn new(
        socket: UdpSocket,
        session_id: String,
        sam_addr: String,
        sam_udp: SocketAddr,
        control_timeout: Duration,
        local_addr: String,
        session: Option<SamConnection>,
    ) -> Self {
        GarlicDatagram {
            socket,
            session_id,
            sam_addr,
            sam_udp,
            control_timeout,
            local_addr,
            session: Mutex::new(session),
        }
    }

    /// Our own `.b32.i2p` address
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send one datagram. `destination` is a hostname or full base64 destination.
    pub async fn send_to(&self, payload: &[u8], destination: &str) -> Result<usize> {
        let destination = self.resolve(destination).await?;
        let packet = frame_outbound(&self.session_id, &destination, payload);
        self.socket
            .send_to(&packet, self.sam_udp)
            .await
            .map_err(|e| OnrampError::dial(destination.as_str(), e))?;
        Ok(payload.len())
    }

    /// Receive one datagram and the sender's full destination
    pub async fn recv_from(&self) -> Result<(Vec<u8>, String)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            match parse_inbound(&buf[..n]) {
                Some((source, payload)) => return Ok((payload.to_vec(), source)),
                None => debug!(from = %from, "Dropping datagram without SAM header"),
            }
        }
    }

    /// End the DATAGRAM session
    pub async fn close(&self) -> Result<()> {
        match self.session.lock().await.take() {
            Some(conn) => conn.close().await.map_err(|e| OnrampError::Close {
                session: Some(e.to_string()),
                control: None,
            }),
            None => Ok(()),
        }
    }

    async fn resolve(&self, destination: &str) -> Result<String> {
        if is_full_destination(destination) {
            return Ok(destination.to_string());
        }
        let host = addr::hostname(destination)?;
        let mut conn = SamConnection::connect(&self.sam_addr, self.control_timeout)
            .await
            .map_err(|e| OnrampError::dial(destination, e))?;
        let resolved = conn
            .naming_lookup(&host)
            .await
            .map_err(|e| OnrampError::dial(destination, e))?;
        let _ = conn.close().await;
        Ok(resolved)
    }

    fn poll_send_packet(&self, cx: &mut Context<'_>, packet: &[u8]) -> Poll<io::Result<usize>> {
        self.socket.poll_send_to(cx, packet, self.sam_udp)
    }
}

fn frame_outbound(session_id: &str, destination: &str, payload: &[u8]) -> Vec<u8> {
    let header = format!("3.0 {} {}\n", session_id, destination);
    let mut packet = Vec::with_capacity(header.len() + payload.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

fn parse_inbound(packet: &[u8]) -> Option<(String, &[u8])> {
    let newline = packet.iter().position(|b| *b == b'\n')?;
    let header = std::str::from_utf8(&packet[..newline]).ok()?;
    let source = header.split_whitespace().next()?;
    Some((source.to_string(), &packet[newline + 1..]))
}

/// One peer's view of a datagram endpoint as a byte stream. Each write is
/// sent as one datagram; reads return datagrams in arrival order.
pub struct DatagramConn {
    endpoint: Arc<GarlicDatagram>,
    peer: String,
    inbound: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl DatagramConn {
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl AsyncRead for DatagramConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset >= self.pending.len() {
            match self.inbound.poll_recv(cx) {
                Poll::Ready(Some(packet)) => {
                    self.pending = packet;
                    self.offset = 0;
                }
                // Demultiplexer gone: end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let this = &mut *self;
        let available = &this.pending[this.offset..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for DatagramConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let packet = frame_outbound(&self.endpoint.session_id, &self.peer, buf);
        match self.endpoint.poll_send_packet(cx, &packet) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(buf.len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Listener over a datagram endpoint: the first packet from a new peer
/// yields a connection, later packets from that peer are delivered to it.
pub struct DatagramListener {
    endpoint: Arc<GarlicDatagram>,
    incoming: Mutex<mpsc::Receiver<(DatagramConn, String)>>,
    closed: CancellationToken,
    demux: JoinHandle<()>,
}

impl DatagramListener {
    pub fn new(endpoint: Arc<GarlicDatagram>) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(PEER_QUEUE);
        let closed = CancellationToken::new();
        let demux = tokio::spawn(demultiplex(endpoint.clone(), accept_tx, closed.clone()));

        DatagramListener {
            endpoint,
            incoming: Mutex::new(accept_rx),
            closed,
            demux,
        }
    }

    pub fn endpoint(&self) -> &Arc<GarlicDatagram> {
        &self.endpoint
    }
}

async fn demultiplex(
    endpoint: Arc<GarlicDatagram>,
    accept_tx: mpsc::Sender<(DatagramConn, String)>,
    closed: CancellationToken,
) {
    let mut peers: HashMap<String, mpsc::Sender<Vec<u8>>> = HashMap::new();

    loop {
        let (payload, source) = tokio::select! {
            _ = closed.cancelled() => break,
            received = endpoint.recv_from() => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "Datagram receive failed, stopping listener");
                    break;
                }
            },
        };

        if let Some(tx) = peers.get(&source) {
            match tx.try_send(payload) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(peer = %source, "Peer queue full, dropping datagram");
                    continue;
                }
                // Connection dropped; a new packet starts a new one
                Err(mpsc::error::TrySendError::Closed(payload)) => {
                    peers.remove(&source);
                    if !open_peer(&endpoint, &accept_tx, &mut peers, source, payload) {
                        break;
                    }
                }
            }
        } else if !open_peer(&endpoint, &accept_tx, &mut peers, source, payload) {
            break;
        }
    }
}

/// Track a new peer, forgetting peers whose connection has been dropped
fn register_peer(
    peers: &mut HashMap<String, mpsc::Sender<Vec<u8>>>,
    source: String,
    tx: mpsc::Sender<Vec<u8>>,
) {
    peers.retain(|_, tx| !tx.is_closed());
    peers.insert(source, tx);
}

/// Returns false once nobody will accept new peers
fn open_peer(
    endpoint: &Arc<GarlicDatagram>,
    accept_tx: &mpsc::Sender<(DatagramConn, String)>,
    peers: &mut HashMap<String, mpsc::Sender<Vec<u8>>>,
    source: String,
    first: Vec<u8>,
) -> bool {
    let (tx, rx) = mpsc::channel(PEER_QUEUE);
    // Fresh channel, cannot be full
    let _ = tx.try_send(first);

    let conn = DatagramConn {
        endpoint: endpoint.clone(),
        peer: source.clone(),
        inbound: rx,
        pending: Vec::new(),
        offset: 0,
    };
    // Never wait on the application here: known peers keep receiving
    // while nobody calls accept
    match accept_tx.try_send((conn, source.clone())) {
        Ok(()) => {
            register_peer(peers, source, tx);
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(peer = %source, "Accept queue full, dropping new peer");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[async_trait]
impl Listener for DatagramListener {
    async fn accept(&self) -> Result<(BoxedConn, String)> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(OnrampError::Closed),
            next = incoming.recv() => match next {
                Some((conn, peer)) => Ok((Box::new(conn) as BoxedConn, peer)),
                None => Err(OnrampError::Closed),
            },
        }
    }

    fn addr(&self) -> String {
        self.endpoint.local_addr().to_string()
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.demux.abort();
        Ok(())
    }
}

impl Drop for DatagramListener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}
