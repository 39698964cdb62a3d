//! TCP streams and listeners on the virtual stack.

use super::{Netstack, PortSpace, TCP_BUFFER};
use crate::addr::{convert_to_full_addr, endpoint_to_socket_addr, FullAddress, NetworkProtocol};
use crate::error::{NetError, NetResult};
use parking_lot::Mutex;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp;
use smoltcp::wire::IpListenEndpoint;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::debug;

/// Pending connections a listener can hold before SYNs go unanswered.
const LISTEN_BACKLOG: usize = 4;

fn new_socket() -> tcp::Socket<'static> {
    tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
        tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
    )
}

fn io_err(op: &'static str, err: impl std::fmt::Debug) -> io::Error {
    io::Error::new(io::ErrorKind::Other, NetError::stack(op, err))
}

/// One stack socket shared by a stream and its split halves. Dropping the
/// last owner closes the connection gracefully.
struct TcpHandle {
    stack: Netstack,
    handle: SocketHandle,
    /// Set once a read has seen the peer's FIN. smoltcp forgets the FIN
    /// when TIME-WAIT expires.
    finished: AtomicBool,
}

impl TcpHandle {
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = match self.stack.lock() {
            Ok(state) => state,
            Err(e) => return Poll::Ready(Err(e.into())),
        };
        let socket = state.sockets.get_mut::<tcp::Socket>(self.handle);
        if socket.can_recv() {
            let res = socket.recv_slice(buf.initialize_unfilled());
            drop(state);
            // The receive window opened up.
            self.stack.kick();
            return match res {
                Ok(n) => {
                    buf.advance(n);
                    Poll::Ready(Ok(()))
                }
                Err(e) => Poll::Ready(Err(io_err("tcp read", e))),
            };
        }
        if !socket.may_recv() {
            // smoltcp only reports `Finished` once the peer's FIN arrived;
            // anything else means the connection was reset.
            return match socket.recv_slice(&mut []) {
                Err(tcp::RecvError::InvalidState) if !self.finished.load(Ordering::Acquire) => {
                    Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
                }
                _ => {
                    self.finished.store(true, Ordering::Release);
                    Poll::Ready(Ok(()))
                }
            };
        }
        socket.register_recv_waker(cx.waker());
        Poll::Pending
    }

    fn poll_write(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = match self.stack.lock() {
            Ok(state) => state,
            Err(e) => return Poll::Ready(Err(e.into())),
        };
        let socket = state.sockets.get_mut::<tcp::Socket>(self.handle);
        if !socket.may_send() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if !socket.can_send() {
            socket.register_send_waker(cx.waker());
            return Poll::Pending;
        }
        let res = socket.send_slice(data);
        drop(state);
        self.stack.kick();
        Poll::Ready(res.map_err(|e| io_err("tcp write", e)))
    }

    /// Free space in the transmit buffer, waiting until there is some.
    fn poll_send_window(&self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut state = match self.stack.lock() {
            Ok(state) => state,
            Err(e) => return Poll::Ready(Err(e.into())),
        };
        let socket = state.sockets.get_mut::<tcp::Socket>(self.handle);
        if !socket.may_send() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let free = socket.send_capacity() - socket.send_queue();
        if free == 0 {
            socket.register_send_waker(cx.waker());
            return Poll::Pending;
        }
        Poll::Ready(Ok(free))
    }

    fn shutdown(&self) -> io::Result<()> {
        let mut state = self.stack.lock()?;
        state.sockets.get_mut::<tcp::Socket>(self.handle).close();
        drop(state);
        self.stack.kick();
        Ok(())
    }

    fn set_nodelay(&self, nodelay: bool) -> NetResult<()> {
        let mut state = self.stack.lock()?;
        state
            .sockets
            .get_mut::<tcp::Socket>(self.handle)
            .set_nagle_enabled(!nodelay);
        Ok(())
    }

    /// Sizes every read from `src` to the free transmit window, so each
    /// chunk is enqueued whole. `src` is never polled under the stack
    /// lock: it may itself be a socket of this stack.
    async fn read_from<R>(&self, src: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = vec![0u8; TCP_BUFFER];
        let mut total = 0u64;
        loop {
            let window = poll_fn(|cx| self.poll_send_window(cx)).await?;
            let n = src.read(&mut chunk[..window.min(TCP_BUFFER)]).await?;
            if n == 0 {
                return Ok(total);
            }
            let mut sent = 0;
            while sent < n {
                sent += poll_fn(|cx| self.poll_write(cx, &chunk[sent..n])).await?;
            }
            total += n as u64;
        }
    }

    /// Reset the connection.
    fn abort(&self) {
        let mut state = self.stack.lock_any();
        state.sockets.get_mut::<tcp::Socket>(self.handle).abort();
        drop(state);
        self.stack.kick();
    }
}

impl Drop for TcpHandle {
    fn drop(&mut self) {
        self.stack.release_tcp(self.handle);
    }
}

// ── Stream ──────────────────────────────────────────────────────────

/// A TCP connection on the virtual stack.
///
/// Reads return EOF once the peer has closed its side and fail with
/// `ConnectionReset` if it reset the connection; writes fail with
/// `BrokenPipe` once ours is shut down. After the stack itself is closed,
/// both fail with `NotConnected`.
pub struct TcpStream {
    inner: Arc<TcpHandle>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

impl TcpStream {
    /// Start a handshake with `addr` from an ephemeral port.
    pub(super) fn connect(stack: &Netstack, addr: SocketAddr) -> NetResult<Self> {
        let (remote, protocol) = convert_to_full_addr(addr);
        let remote = remote.endpoint().ok_or(NetError::MissingAddress)?;

        let mut state = stack.lock()?;
        let port = state.ephemeral_port(PortSpace::Tcp)?;
        let mut socket = new_socket();
        socket
            .connect(state.iface.context(), remote, port)
            .map_err(|e| NetError::stack("tcp connect", e))?;
        let local = socket
            .local_endpoint()
            .map(endpoint_to_socket_addr)
            .unwrap_or_else(|| SocketAddr::new(protocol.unspecified(), port));
        let handle = state.sockets.add(socket);
        drop(state);
        stack.kick();

        Ok(Self::from_parts(stack.clone(), handle, local, addr))
    }

    fn from_parts(stack: Netstack, handle: SocketHandle, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            inner: Arc::new(TcpHandle {
                stack,
                handle,
                finished: AtomicBool::new(false),
            }),
            local,
            peer,
        }
    }

    /// Wait for the handshake to finish.
    pub(super) async fn wait_established(&self) -> NetResult<()> {
        poll_fn(|cx| {
            let mut state = match self.inner.stack.lock() {
                Ok(state) => state,
                Err(e) => return Poll::Ready(Err(e)),
            };
            let socket = state.sockets.get_mut::<tcp::Socket>(self.inner.handle);
            match socket.state() {
                tcp::State::Established | tcp::State::CloseWait => Poll::Ready(Ok(())),
                tcp::State::SynSent | tcp::State::SynReceived => {
                    socket.register_recv_waker(cx.waker());
                    socket.register_send_waker(cx.waker());
                    Poll::Pending
                }
                _ => Poll::Ready(Err(NetError::Refused)),
            }
        })
        .await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Disable (`true`) or enable Nagle's algorithm.
    pub fn set_nodelay(&self, nodelay: bool) -> NetResult<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// Copy everything `src` yields into this connection, skipping a
    /// separate relay buffer: each read is sized to the free transmit
    /// window and enqueued as a whole. Returns the byte count once `src` is
    /// at EOF.
    pub async fn read_from<R>(&self, src: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.inner.read_from(src).await
    }

    /// Send a reset and drop whatever is still buffered.
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        (
            OwnedReadHalf {
                inner: Arc::clone(&self.inner),
                peer: self.peer,
            },
            OwnedWriteHalf {
                inner: self.inner,
                peer: self.peer,
            },
        )
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Send FIN. Reading stays possible until the peer closes too.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.shutdown())
    }
}

/// Read half of a [`TcpStream`].
pub struct OwnedReadHalf {
    inner: Arc<TcpHandle>,
    peer: SocketAddr,
}

impl OwnedReadHalf {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for OwnedReadHalf {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_read(cx, buf)
    }
}

/// Write half of a [`TcpStream`].
pub struct OwnedWriteHalf {
    inner: Arc<TcpHandle>,
    peer: SocketAddr,
}

impl OwnedWriteHalf {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// See [`TcpStream::read_from`].
    pub async fn read_from<R>(&self, src: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.inner.read_from(src).await
    }

    /// Reset the whole connection, read half included.
    pub fn abort(&self) {
        self.inner.abort();
    }
}

impl AsyncWrite for OwnedWriteHalf {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.shutdown())
    }
}

// ── Listener ────────────────────────────────────────────────────────

/// A TCP listener on the virtual stack.
///
/// Keeps a small set of sockets in LISTEN on the same port. Each one that
/// completes a handshake is handed out by [`accept`](Self::accept) and
/// replaced with a fresh listening socket.
pub struct TcpListener {
    stack: Netstack,
    endpoint: IpListenEndpoint,
    local: SocketAddr,
    backlog: Mutex<Vec<SocketHandle>>,
    closed: AtomicBool,
}

impl TcpListener {
    pub(super) fn bind(stack: &Netstack, local: FullAddress, protocol: NetworkProtocol) -> NetResult<Self> {
        let mut state = stack.lock()?;
        state.check_local("tcp listen", local.addr)?;

        let port = if local.port == 0 {
            state.ephemeral_port(PortSpace::Tcp)?
        } else if state.port_in_use(PortSpace::Tcp, local.addr, local.port) {
            return Err(NetError::Stack {
                op: "tcp listen",
                message: format!("port {} already in use", local.port),
            });
        } else {
            local.port
        };
        let endpoint = IpListenEndpoint {
            addr: local.addr,
            port,
        };

        let mut backlog = Vec::with_capacity(LISTEN_BACKLOG);
        for _ in 0..LISTEN_BACKLOG {
            let mut socket = new_socket();
            if let Err(e) = socket.listen(endpoint) {
                for handle in backlog {
                    state.sockets.remove(handle);
                }
                return Err(NetError::stack("tcp listen", e));
            }
            backlog.push(state.sockets.add(socket));
        }
        state.tcp_listen_ports.insert((local.addr, port));

        let local = FullAddress { port, ..local }.to_socket_addr(protocol);
        debug!(addr = %local, "tcp listening");
        Ok(Self {
            stack: stack.clone(),
            endpoint,
            local,
            backlog: Mutex::new(backlog),
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for the next established connection.
    ///
    /// # Errors
    ///
    /// [`NetError::Closed`] once the listener or the stack is closed.
    pub async fn accept(&self) -> NetResult<(TcpStream, SocketAddr)> {
        self.stack
            .until_closed(poll_fn(|cx| self.poll_accept(cx)))
            .await
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<NetResult<(TcpStream, SocketAddr)>> {
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(NetError::Closed));
        }
        let mut state = match self.stack.lock() {
            Ok(state) => state,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let mut backlog = self.backlog.lock();

        for slot in backlog.iter_mut() {
            let socket = state.sockets.get_mut::<tcp::Socket>(*slot);
            match socket.state() {
                tcp::State::Listen | tcp::State::SynReceived => {
                    socket.register_recv_waker(cx.waker());
                }
                tcp::State::Established | tcp::State::CloseWait => {
                    let (local, peer) = match (socket.local_endpoint(), socket.remote_endpoint()) {
                        (Some(l), Some(r)) => (endpoint_to_socket_addr(l), endpoint_to_socket_addr(r)),
                        _ => continue,
                    };
                    let mut fresh = new_socket();
                    if let Err(e) = fresh.listen(self.endpoint) {
                        return Poll::Ready(Err(NetError::stack("tcp listen", e)));
                    }
                    let accepted = std::mem::replace(slot, state.sockets.add(fresh));
                    debug!(peer = %peer, local = %local, "tcp accepted");
                    let stream = TcpStream::from_parts(self.stack.clone(), accepted, local, peer);
                    return Poll::Ready(Ok((stream, peer)));
                }
                tcp::State::Closed => {
                    // A half-open attempt was reset; re-arm the slot.
                    if socket.listen(self.endpoint).is_ok() {
                        socket.register_recv_waker(cx.waker());
                    }
                }
                _ => {
                    socket.register_recv_waker(cx.waker());
                }
            }
        }
        Poll::Pending
    }

    /// Stop accepting; pending and future `accept` calls fail with
    /// [`NetError::Closed`]. Connections not yet accepted are reset.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.stack.lock_any();
        for &handle in self.backlog.lock().iter() {
            // Aborting wakes the registered accept waker.
            state.sockets.get_mut::<tcp::Socket>(handle).abort();
        }
        drop(state);
        self.stack.kick();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let mut state = self.stack.lock_any();
        for handle in self.backlog.get_mut().drain(..) {
            state.sockets.remove(handle);
        }
        state.tcp_listen_ports.remove(&(self.endpoint.addr, self.endpoint.port));
    }
}
