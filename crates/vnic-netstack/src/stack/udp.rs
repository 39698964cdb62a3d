//! UDP sockets on the virtual stack, plus a listener that splits one bound
//! port into per-peer sessions.

use super::{Netstack, PortSpace};
use crate::addr::{endpoint_to_socket_addr, full_addr, NetworkProtocol};
use crate::error::{NetError, NetResult};
use bytes::Bytes;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::udp;
use smoltcp::wire::{IpAddress, IpEndpoint};
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vnic_core::LruCache;

const UDP_PACKETS: usize = 64;
const UDP_BUFFER: usize = 64 * 1024;

/// Peers a [`UdpListener`] tracks at once; the least recently active one
/// is dropped to make room.
const MAX_SESSIONS: usize = 256;

/// Datagrams queued per session before new ones are dropped.
const SESSION_QUEUE: usize = 64;

/// New sessions waiting for [`UdpListener::accept`].
const ACCEPT_BACKLOG: usize = 64;

fn to_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(IpAddress::from(addr.ip()), addr.port())
}

/// A UDP socket on the virtual stack.
///
/// When connected, sends go to the remote address and datagrams from any
/// other source are discarded.
pub struct UdpSocket {
    stack: Netstack,
    handle: SocketHandle,
    local: SocketAddr,
    remote: Option<SocketAddr>,
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl UdpSocket {
    pub(super) fn bind(
        stack: &Netstack,
        laddr: Option<SocketAddr>,
        raddr: Option<SocketAddr>,
    ) -> NetResult<Self> {
        let fallback = raddr
            .map(|r| NetworkProtocol::of(r.ip()))
            .unwrap_or(NetworkProtocol::Ipv4);
        let (mut local, protocol) = full_addr(laddr, fallback);

        let mut state = stack.lock()?;
        state.check_local("udp bind", local.addr)?;
        if local.port == 0 {
            local.port = state.ephemeral_port(PortSpace::Udp)?;
        } else if state.port_in_use(PortSpace::Udp, local.addr, local.port) {
            return Err(NetError::Stack {
                op: "udp bind",
                message: format!("port {} already in use", local.port),
            });
        }

        let mut socket = udp::Socket::new(
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; UDP_PACKETS], vec![0u8; UDP_BUFFER]),
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; UDP_PACKETS], vec![0u8; UDP_BUFFER]),
        );
        socket
            .bind(local.listen_endpoint())
            .map_err(|e| NetError::stack("udp bind", e))?;
        let handle = state.sockets.add(socket);

        Ok(Self {
            stack: stack.clone(),
            handle,
            local: local.to_socket_addr(protocol),
            remote: raddr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub(crate) fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<NetResult<usize>> {
        let mut state = match self.stack.lock() {
            Ok(state) => state,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let socket = state.sockets.get_mut::<udp::Socket>(self.handle);
        match socket.send_slice(buf, to_endpoint(target)) {
            Ok(()) => {
                drop(state);
                self.stack.kick();
                Poll::Ready(Ok(buf.len()))
            }
            Err(udp::SendError::BufferFull) => {
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(NetError::stack("udp write", e))),
        }
    }

    /// Receive one datagram, truncating it to `buf`.
    pub(crate) fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<NetResult<(usize, SocketAddr)>> {
        let mut state = match self.stack.lock() {
            Ok(state) => state,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let socket = state.sockets.get_mut::<udp::Socket>(self.handle);
        loop {
            match socket.recv() {
                Ok((data, meta)) => {
                    let from = endpoint_to_socket_addr(meta.endpoint);
                    if self.remote.is_some_and(|remote| remote != from) {
                        continue;
                    }
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Poll::Ready(Ok((n, from)));
                }
                Err(udp::RecvError::Exhausted) => {
                    socket.register_recv_waker(cx.waker());
                    return Poll::Pending;
                }
                Err(e) => return Poll::Ready(Err(NetError::stack("udp read", e))),
            }
        }
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> NetResult<usize> {
        self.stack
            .until_closed(poll_fn(|cx| self.poll_send_to(cx, buf, target)))
            .await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        self.stack
            .until_closed(poll_fn(|cx| self.poll_recv_from(cx, buf)))
            .await
    }

    /// Send to the connected remote.
    pub async fn send(&self, buf: &[u8]) -> NetResult<usize> {
        let remote = self.remote.ok_or(NetError::MissingAddress)?;
        self.send_to(buf, remote).await
    }

    /// Receive from the connected remote.
    pub async fn recv(&self, buf: &mut [u8]) -> NetResult<usize> {
        self.recv_from(buf).await.map(|(n, _)| n)
    }
}

impl AsyncRead for UdpSocket {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.poll_recv_from(cx, buf.initialize_unfilled()) {
            Poll::Ready(Ok((n, _))) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpSocket {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let Some(remote) = self.remote else {
            return Poll::Ready(Err(NetError::MissingAddress.into()));
        };
        self.poll_send_to(cx, buf, remote).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.stack.lock_any().sockets.remove(self.handle);
    }
}

// ── Listener ────────────────────────────────────────────────────────

/// One UDP port demultiplexed into a [`UdpSession`] per remote peer.
///
/// A router task owns the port: it delivers datagrams from known peers to
/// their sessions and queues a new session for [`accept`](Self::accept)
/// when a datagram arrives from an unknown one. Established sessions keep
/// receiving while nobody accepts.
pub struct UdpListener {
    local: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::Receiver<(UdpSession, SocketAddr)>>,
    closed: CancellationToken,
}

impl UdpListener {
    pub(super) fn bind(stack: &Netstack, addr: SocketAddr) -> NetResult<Self> {
        let socket = Arc::new(UdpSocket::bind(stack, Some(addr), None)?);
        let local = socket.local_addr();
        debug!(addr = %local, "udp listening");

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let closed = CancellationToken::new();
        tokio::spawn(route(socket, tx, closed.clone()));
        Ok(Self {
            local,
            incoming: tokio::sync::Mutex::new(rx),
            closed,
        })
    }

    /// Wait for a datagram from a peer without a live session.
    pub async fn accept(&self) -> NetResult<(UdpSession, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::Closed),
            next = incoming.recv() => next.ok_or(NetError::Closed),
        }
    }

    /// Stop routing. Every session reads EOF once its queue drains.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn route(
    socket: Arc<UdpSocket>,
    incoming: mpsc::Sender<(UdpSession, SocketAddr)>,
    closed: CancellationToken,
) {
    let mut sessions: LruCache<SocketAddr, mpsc::Sender<Bytes>> = LruCache::new(MAX_SESSIONS);
    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        let (n, peer) = tokio::select! {
            _ = closed.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(e) => {
                    debug!(addr = %socket.local_addr(), error = %e, "udp listener stopped");
                    break;
                }
            },
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        match sessions.get(&peer).map(|tx| tx.try_send(datagram.clone())) {
            Some(Ok(())) => continue,
            Some(Err(mpsc::error::TrySendError::Full(_))) => {
                trace!(peer = %peer, "udp session queue full, dropping datagram");
                continue;
            }
            Some(Err(mpsc::error::TrySendError::Closed(_))) => {
                sessions.delete(&peer);
            }
            None => {}
        }

        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        // Fresh channel, cannot be full.
        let _ = tx.try_send(datagram);
        let session = UdpSession {
            socket: Arc::clone(&socket),
            peer,
            rx,
        };
        match incoming.try_send((session, peer)) {
            Ok(()) => {
                if let Some((evicted, _)) = sessions.put(peer, tx) {
                    debug!(peer = %evicted, "udp session evicted");
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(peer = %peer, "udp accept backlog full, dropping datagram");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

/// Traffic between a [`UdpListener`]'s port and one peer.
///
/// Reads yield one datagram each and return EOF once the listener drops
/// the session.
pub struct UdpSession {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
}

impl UdpSession {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn recv(&mut self, buf: &mut [u8]) -> NetResult<usize> {
        match self.rx.recv().await {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    pub async fn send(&self, buf: &[u8]) -> NetResult<usize> {
        self.socket.send_to(buf, self.peer).await
    }
}

impl AsyncRead for UdpSession {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpSession {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.socket
            .poll_send_to(cx, buf, self.peer)
            .map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::Pair;
    use std::time::Duration;

    #[tokio::test]
    async fn connected_socket_round_trip() {
        let pair = Pair::new();
        let server = pair.b.listen_udp("10.0.0.1:5300".parse().unwrap()).unwrap();
        let client = pair
            .a
            .dial_udp(None, Some("10.0.0.1:5300".parse().unwrap()))
            .unwrap();

        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.port(), client.local_addr().port());

        server.send_to(b"pong", from).await.unwrap();
        let n = client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn listener_splits_peers_into_sessions() {
        let pair = Pair::new();
        let listener = pair.b.listen("udp", 5301).unwrap();
        let one = pair.a.dial_udp(None, Some("10.0.0.1:5301".parse().unwrap())).unwrap();
        let two = pair.a.dial_udp(None, Some("10.0.0.1:5301".parse().unwrap())).unwrap();

        one.send(b"first").await.unwrap();
        let (inbound, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.ip().to_string(), "10.0.0.2");
        assert_eq!(peer.port(), one.local_addr().port());
        let crate::stack::Inbound::Udp(mut session) = inbound else {
            panic!("expected a udp session");
        };
        let mut buf = [0u8; 16];
        let n = session.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");

        two.send(b"second").await.unwrap();
        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.port(), two.local_addr().port());

        session.send(b"reply").await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), one.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[tokio::test]
    async fn sessions_receive_without_pending_accept() {
        let pair = Pair::new();
        let listener = pair.b.listen("udp", 5303).unwrap();
        let client = pair.a.dial_udp(None, Some("10.0.0.1:5303".parse().unwrap())).unwrap();

        client.send(b"one").await.unwrap();
        let (inbound, _) = listener.accept().await.unwrap();
        let crate::stack::Inbound::Udp(mut session) = inbound else {
            panic!("expected a udp session");
        };

        client.send(b"two").await.unwrap();
        client.send(b"three").await.unwrap();
        let mut buf = [0u8; 16];
        for want in [&b"one"[..], b"two", b"three"] {
            let n = tokio::time::timeout(Duration::from_secs(2), session.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], want);
        }
    }

    #[tokio::test]
    async fn closing_listener_ends_sessions() {
        let pair = Pair::new();
        let listener = pair.b.listen("udp", 5304).unwrap();
        let client = pair.a.dial_udp(None, Some("10.0.0.1:5304".parse().unwrap())).unwrap();

        client.send(b"hello").await.unwrap();
        let (inbound, _) = listener.accept().await.unwrap();
        let crate::stack::Inbound::Udp(mut session) = inbound else {
            panic!("expected a udp session");
        };
        let mut buf = [0u8; 16];
        assert_eq!(session.recv(&mut buf).await.unwrap(), 5);

        listener.close();
        let n = tokio::time::timeout(Duration::from_secs(2), session.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(matches!(listener.accept().await, Err(crate::NetError::Closed)));
    }

    #[tokio::test]
    async fn closing_stack_unblocks_recv() {
        let pair = Pair::new();
        let socket = std::sync::Arc::new(pair.a.listen_udp("10.0.0.2:5302".parse().unwrap()).unwrap());
        let reader = {
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                socket.recv_from(&mut buf).await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pair.a.close();
        let res = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(crate::NetError::Closed)));
    }
}
