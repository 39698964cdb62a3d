//! Port forwarding from listeners on the virtual stack to backends on the
//! host network.
//!
//! Each [`ForwardRule`] opens one listener on the stack. Every accepted
//! connection is paired with a fresh host connection to the rule's backend,
//! and bytes are copied both ways until each side has reached end of
//! stream. Cancelling the token given to [`Forwarder::start`] closes every
//! listener and then the stack itself.

use crate::dial::{split_host_port, Network, Transport};
use crate::error::{NetError, NetResult};
use crate::stack::{Inbound, Listener, Netstack, TcpStream};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vnic_core::{BufferPool, ForwardRule, Target, RELAY_BUFFER_SIZE};

/// A relay with a datagram side ends after this long without traffic.
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Serves a set of forward rules on one stack.
pub struct Forwarder {
    stack: Netstack,
    rules: Vec<ForwardRule>,
    /// Relay buffers, shared by every connection of every rule.
    buffers: Arc<BufferPool>,
}

impl Forwarder {
    /// Forward `rules` from listeners on `stack`. Nothing is opened until
    /// [`start`](Self::start).
    pub fn new(stack: Netstack, rules: Vec<ForwardRule>) -> Self {
        Self {
            stack,
            rules,
            buffers: Arc::new(BufferPool::new(RELAY_BUFFER_SIZE)),
        }
    }

    /// Share relay buffers with other users of `pool`.
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffers = pool;
        self
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Open a listener for every rule and start serving them.
    ///
    /// Listeners are opened in rule order. If any of them fails, the ones
    /// already opened are closed, the stack is closed, and the error is
    /// returned; nothing is served.
    ///
    /// # Arguments
    ///
    /// * `shutdown` - Cancelling it closes all listeners and the stack.
    pub fn start(self, shutdown: CancellationToken) -> NetResult<ForwardHandle> {
        let mut listeners = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            match open_listener(&self.stack, &rule.listen) {
                Ok(listener) => listeners.push(Arc::new(listener)),
                Err(e) => {
                    warn!(listen = %rule.listen, error = %e, "forward listener failed, closing stack");
                    for listener in &listeners {
                        listener.close();
                    }
                    self.stack.close();
                    return Err(e);
                }
            }
        }

        let mut local_addrs = Vec::with_capacity(listeners.len());
        for (listener, rule) in listeners.iter().zip(self.rules) {
            local_addrs.push(listener.local_addr());
            info!(
                listen = %listener.local_addr(),
                backend = %rule.backend,
                "forwarding"
            );
            tokio::spawn(serve(
                Arc::clone(listener),
                rule.backend,
                Arc::clone(&self.buffers),
            ));
        }

        let stack = self.stack;
        let token = shutdown.clone();
        let supervisor = tokio::spawn(async move {
            token.cancelled().await;
            for listener in &listeners {
                listener.close();
            }
            stack.close();
            info!("forwarding stopped");
        });

        Ok(ForwardHandle {
            supervisor,
            shutdown,
            local_addrs,
        })
    }
}

/// Running forwarders started by [`Forwarder::start`].
#[derive(Debug)]
pub struct ForwardHandle {
    /// Closes the listeners and the stack once `shutdown` fires.
    supervisor: JoinHandle<()>,
    shutdown: CancellationToken,
    /// Bound address of each listener, in rule order.
    local_addrs: Vec<SocketAddr>,
}

impl ForwardHandle {
    /// Listener addresses, in rule order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Cancel the shutdown token passed to [`Forwarder::start`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until shutdown has closed the listeners and the stack.
    pub async fn wait(self) {
        if let Err(e) = self.supervisor.await {
            warn!(error = %e, "forward supervisor failed");
        }
    }
}

fn open_listener(stack: &Netstack, target: &Target) -> NetResult<Listener> {
    let (_, port) = split_host_port(&target.address)
        .map_err(|e| NetError::op("listen", target, e))?;
    let port: u16 = port
        .parse()
        .map_err(|_| NetError::op("listen", target, NetError::NumericPort(port.to_string())))?;
    stack
        .listen(&target.scheme, port)
        .map_err(|e| NetError::op("listen", target, e))
}

async fn serve(listener: Arc<Listener>, backend: Target, buffers: Arc<BufferPool>) {
    let local = listener.local_addr();
    loop {
        let (inbound, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(listen = %local, error = %e, "accept loop ended");
                return;
            }
        };
        info!(listen = %local, peer = %peer, backend = %backend, "accepted");

        let host = match HostConn::dial(&backend).await {
            Ok(host) => host,
            Err(e) => {
                warn!(backend = %backend, peer = %peer, error = %e, "backend dial failed");
                continue;
            }
        };
        tokio::spawn(relay(inbound, host, Arc::clone(&buffers)));
    }
}

// ── Host side ───────────────────────────────────────────────────────

enum HostConn {
    Tcp(tokio::net::TcpStream),
    Udp(HostDatagram),
}

impl HostConn {
    /// Connect to `target` on the host network, trying each resolved
    /// address of the scheme's family in turn.
    async fn dial(target: &Target) -> NetResult<Self> {
        let network: Network = target.scheme.parse()?;
        let addrs = tokio::net::lookup_host(target.address.as_str()).await?;

        let mut first_err = None;
        for addr in addrs.filter(|a| network.accepts(a.ip())) {
            let attempt = tokio::time::timeout(BACKEND_DIAL_TIMEOUT, Self::connect(network.transport, addr));
            match attempt.await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(NetError::Timeout);
                }
            }
        }
        Err(first_err.unwrap_or(NetError::NoSuitableAddress))
    }

    async fn connect(transport: Transport, addr: SocketAddr) -> NetResult<Self> {
        match transport {
            Transport::Tcp => Ok(Self::Tcp(tokio::net::TcpStream::connect(addr).await?)),
            Transport::Udp => {
                let bind: SocketAddr = if addr.is_ipv4() {
                    (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = tokio::net::UdpSocket::bind(bind).await?;
                socket.connect(addr).await?;
                Ok(Self::Udp(HostDatagram(socket)))
            }
            Transport::Ping => Err(NetError::UnknownNetwork(transport.as_str().to_string())),
        }
    }
}

/// A connected host UDP socket seen as a stream of datagrams: each read
/// yields one datagram, each write sends one.
struct HostDatagram(tokio::net::UdpSocket);

impl AsyncRead for HostDatagram {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.0.poll_recv(cx, buf)
    }
}

impl AsyncWrite for HostDatagram {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ── Relay ───────────────────────────────────────────────────────────

/// Copy both ways between an accepted connection and its backend. Both
/// connections are dropped, and so closed, once both directions are done.
async fn relay(inbound: Inbound, host: HostConn, buffers: Arc<BufferPool>) {
    let peer = inbound.peer_addr();
    let (upstream, downstream) = match (inbound, host) {
        (Inbound::Tcp(virt), HostConn::Tcp(host)) => relay_tcp(virt, host, &buffers).await,
        (Inbound::Tcp(virt), HostConn::Udp(host)) => {
            relay_streams(virt, host, &buffers, Some(UDP_IDLE_TIMEOUT)).await
        }
        (Inbound::Udp(virt), HostConn::Tcp(host)) => {
            relay_streams(virt, host, &buffers, Some(UDP_IDLE_TIMEOUT)).await
        }
        (Inbound::Udp(virt), HostConn::Udp(host)) => {
            relay_streams(virt, host, &buffers, Some(UDP_IDLE_TIMEOUT)).await
        }
    };
    debug!(peer = %peer, upstream = ?upstream, downstream = ?downstream, "relay finished");
}

/// TCP on both sides. Host-to-stack traffic is read straight into the
/// virtual socket's send window instead of going through a relay buffer.
///
/// A failure in either direction resets the virtual connection, so the
/// peer on the stack sees the backend's reset rather than a clean close.
async fn relay_tcp(
    virt: TcpStream,
    host: tokio::net::TcpStream,
    buffers: &Arc<BufferPool>,
) -> (io::Result<u64>, io::Result<u64>) {
    if let Err(e) = host.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let (mut virt_rd, mut virt_wr) = virt.into_split();
    let (mut host_rd, mut host_wr) = host.into_split();

    let failed = CancellationToken::new();
    let upstream = until_failed(&failed, async {
        let mut buf = buffers.acquire();
        copy(&mut virt_rd, &mut host_wr, &mut buf, None).await
    });
    let downstream = until_failed(&failed, async {
        let n = virt_wr.read_from(&mut host_rd).await?;
        virt_wr.shutdown().await?;
        Ok::<_, io::Error>(n)
    });
    let (upstream, downstream) = tokio::join!(upstream, downstream);
    if upstream.is_err() || downstream.is_err() {
        virt_wr.abort();
    }
    (upstream, downstream)
}

async fn relay_streams<A, B>(
    a: A,
    b: B,
    buffers: &Arc<BufferPool>,
    idle: Option<Duration>,
) -> (io::Result<u64>, io::Result<u64>)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let failed = CancellationToken::new();
    let upstream = until_failed(&failed, async {
        let mut buf = buffers.acquire();
        copy(&mut a_rd, &mut b_wr, &mut buf, idle).await
    });
    let downstream = until_failed(&failed, async {
        let mut buf = buffers.acquire();
        copy(&mut b_rd, &mut a_wr, &mut buf, idle).await
    });
    tokio::join!(upstream, downstream)
}

/// Run one direction of a relay. Once either direction fails, `failed` is
/// cancelled and the other one stops too.
async fn until_failed<F>(failed: &CancellationToken, direction: F) -> io::Result<u64>
where
    F: Future<Output = io::Result<u64>>,
{
    let res = tokio::select! {
        res = direction => res,
        _ = failed.cancelled() => Err(io::ErrorKind::ConnectionAborted.into()),
    };
    if res.is_err() {
        failed.cancel();
    }
    res
}

/// Copy until end of stream, an error, or `idle` without a read. The
/// write side of `dst` is shut down in every case.
async fn copy<R, W>(src: &mut R, dst: &mut W, buf: &mut [u8], idle: Option<Duration>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = copy_until_eof(src, dst, buf, idle).await;
    let shutdown = dst.shutdown().await;
    let n = copied?;
    shutdown?;
    Ok(n)
}

async fn copy_until_eof<R, W>(src: &mut R, dst: &mut W, buf: &mut [u8], idle: Option<Duration>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let read = src.read(buf);
        let n = match idle {
            Some(idle) => match tokio::time::timeout(idle, read).await {
                Ok(n) => n?,
                Err(_) => return Ok(total),
            },
            None => read.await?,
        };
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
