//! ICMP echo "ping sockets" on the virtual stack.
//!
//! A [`PingConn`] is bound to one ICMP echo identifier. Writes take a full
//! ICMP echo request (header included); the identifier field is rewritten
//! to the connection's own before the message is queued, and the stack
//! recomputes the checksum. Reads return whole ICMP messages, typically
//! echo replies, carrying that identifier.
//!
//! Reads block until data arrives or the read deadline passes. The deadline
//! is a resettable timer raced against the socket, so it can be moved at
//! any time, including while a read is blocked.

use crate::error::{NetError, NetResult};
use crate::stack::Netstack;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::icmp;
use smoltcp::wire::IpAddress;
use std::fmt;
use std::future::poll_fn;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

const ICMP_PACKETS: usize = 16;
const ICMP_BUFFER: usize = 16 * 1024;

/// Offset of the identifier in an ICMP echo header.
const IDENT_OFFSET: usize = 4;
const ECHO_HEADER_LEN: usize = 8;

/// Address of a ping endpoint. `None` stands for "no address".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PingAddr(pub Option<IpAddr>);

impl PingAddr {
    pub fn new(ip: IpAddr) -> Self {
        Self(Some(ip))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_some()
    }

    /// `ping4`, `ping6`, or `ping` when the address is unset.
    pub fn network(&self) -> &'static str {
        match self.0 {
            Some(IpAddr::V4(_)) => "ping4",
            Some(IpAddr::V6(_)) => "ping6",
            None => "ping",
        }
    }
}

impl fmt::Display for PingAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ip) => write!(f, "{ip}"),
            None => f.write_str("invalid IP"),
        }
    }
}

impl From<IpAddr> for PingAddr {
    fn from(ip: IpAddr) -> Self {
        Self(Some(ip))
    }
}

/// An ICMP echo socket.
pub struct PingConn {
    stack: Netstack,
    handle: SocketHandle,
    ident: u16,
    laddr: PingAddr,
    raddr: PingAddr,
    v6: bool,
    deadline: watch::Sender<Option<Instant>>,
    /// Set under the stack lock together with removing the socket.
    closed: AtomicBool,
}

impl Netstack {
    /// Open a ping socket. At least one of the addresses must be set; the
    /// IP version is v6 if either of them is. With a local address the
    /// socket is bound to it; with a remote one it only accepts messages
    /// from that peer and [`PingConn::write`] sends there.
    pub fn dial_ping(&self, laddr: Option<IpAddr>, raddr: Option<IpAddr>) -> NetResult<PingConn> {
        PingConn::open(self, laddr, raddr)
    }

    /// Open an unconnected ping socket bound to `laddr`.
    pub fn listen_ping(&self, laddr: IpAddr) -> NetResult<PingConn> {
        PingConn::open(self, Some(laddr), None)
    }
}

impl PingConn {
    fn open(stack: &Netstack, laddr: Option<IpAddr>, raddr: Option<IpAddr>) -> NetResult<Self> {
        if laddr.is_none() && raddr.is_none() {
            return Err(NetError::Stack {
                op: "ping dial",
                message: "invalid address".into(),
            });
        }
        let v6 = laddr.is_some_and(|ip| ip.is_ipv6()) || raddr.is_some_and(|ip| ip.is_ipv6());
        let laddr = laddr.unwrap_or(if v6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        if laddr.is_ipv6() != v6 {
            return Err(NetError::Stack {
                op: "ping bind",
                message: "mismatched protocols".into(),
            });
        }

        let mut state = stack.lock()?;
        if !laddr.is_unspecified() {
            state.check_local("ping bind", Some(IpAddress::from(laddr)))?;
        }

        let mut ident: u16 = rand::random();
        while state.icmp_idents.contains(&ident) {
            ident = ident.wrapping_add(1);
        }
        let mut socket = icmp::Socket::new(
            icmp::PacketBuffer::new(vec![icmp::PacketMetadata::EMPTY; ICMP_PACKETS], vec![0u8; ICMP_BUFFER]),
            icmp::PacketBuffer::new(vec![icmp::PacketMetadata::EMPTY; ICMP_PACKETS], vec![0u8; ICMP_BUFFER]),
        );
        socket
            .bind(icmp::Endpoint::Ident(ident))
            .map_err(|e| NetError::stack("ping socket: endpoint", e))?;
        let handle = state.sockets.add(socket);
        state.icmp_idents.insert(ident);
        drop(state);

        let (deadline, _) = watch::channel(None);
        let conn = Self {
            stack: stack.clone(),
            handle,
            ident,
            laddr: PingAddr::new(laddr),
            raddr: PingAddr(raddr),
            v6,
            deadline,
            closed: AtomicBool::new(false),
        };
        debug!(laddr = %conn.laddr, raddr = %conn.raddr, ident, "ping socket opened");
        Ok(conn)
    }

    pub fn local_addr(&self) -> PingAddr {
        self.laddr
    }

    pub fn remote_addr(&self) -> PingAddr {
        self.raddr
    }

    /// Echo identifier owned by this socket.
    pub fn ident(&self) -> u16 {
        self.ident
    }

    /// Send the ICMP echo message `buf` to `addr`, or to the connected
    /// remote when `addr` is unset. Never blocks.
    ///
    /// # Errors
    ///
    /// [`NetError::ProtocolMismatch`] if `addr` is of the other IP version
    /// than the socket.
    pub fn write_to(&self, buf: &[u8], addr: PingAddr) -> NetResult<usize> {
        let target = match addr.ip().or(self.raddr.ip()) {
            Some(ip) => ip,
            None => return Err(NetError::MissingAddress),
        };
        if target.is_ipv6() != self.v6 {
            return Err(NetError::ProtocolMismatch);
        }
        if buf.len() < ECHO_HEADER_LEN {
            return Err(NetError::Stack {
                op: "ping write",
                message: "message shorter than an echo header".into(),
            });
        }

        let mut message = buf.to_vec();
        message[IDENT_OFFSET..IDENT_OFFSET + 2].copy_from_slice(&self.ident.to_be_bytes());

        let mut state = self.stack.lock()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let socket = state.sockets.get_mut::<icmp::Socket>(self.handle);
        socket
            .send_slice(&message, IpAddress::from(target))
            .map_err(|e| NetError::stack("ping write", e))?;
        drop(state);
        self.stack.kick();
        Ok(buf.len())
    }

    /// Send to the connected remote.
    pub fn write(&self, buf: &[u8]) -> NetResult<usize> {
        self.write_to(buf, PingAddr::default())
    }

    /// Receive one ICMP message and its source.
    ///
    /// # Errors
    ///
    /// [`NetError::Timeout`] once the read deadline passes, which includes
    /// after [`close`](Self::close). [`NetError::Closed`] if the stack shuts
    /// down.
    pub async fn read_from(&self, buf: &mut [u8]) -> NetResult<(usize, PingAddr)> {
        let mut deadline_rx = self.deadline.subscribe();
        loop {
            let deadline = *deadline_rx.borrow_and_update();
            if deadline.is_some_and(|d| d <= Instant::now()) {
                return Err(NetError::Timeout);
            }
            let expiry = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                res = self.stack.until_closed(poll_fn(|cx| self.poll_recv(cx, buf))) => return res,
                _ = expiry => return Err(NetError::Timeout),
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        return Err(NetError::Closed);
                    }
                }
            }
        }
    }

    /// Receive one ICMP message.
    pub async fn read(&self, buf: &mut [u8]) -> NetResult<usize> {
        self.read_from(buf).await.map(|(n, _)| n)
    }

    fn poll_recv(&self, cx: &mut std::task::Context<'_>, buf: &mut [u8]) -> Poll<NetResult<(usize, PingAddr)>> {
        let mut state = match self.stack.lock() {
            Ok(state) => state,
            Err(e) => return Poll::Ready(Err(e)),
        };
        // Closing expires the deadline.
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(NetError::Timeout));
        }
        let socket = state.sockets.get_mut::<icmp::Socket>(self.handle);
        loop {
            match socket.recv() {
                Ok((data, from)) => {
                    let from = IpAddr::from(from);
                    if self.raddr.ip().is_some_and(|r| r != from) {
                        continue;
                    }
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Poll::Ready(Ok((n, PingAddr::new(from))));
                }
                Err(_) => {
                    socket.register_recv_waker(cx.waker());
                    return Poll::Pending;
                }
            }
        }
    }

    /// Set the read deadline; `None` blocks indefinitely. Takes effect
    /// immediately, also for a read already in progress.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> NetResult<()> {
        self.set_read_deadline(deadline)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> NetResult<()> {
        self.deadline.send_replace(deadline);
        Ok(())
    }

    /// Writes never block, so there is nothing to bound.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> NetResult<()> {
        Err(NetError::NotImplemented)
    }

    /// Expire the read deadline, unblocking any pending read, and release
    /// the socket. Later calls fail with [`NetError::Closed`].
    pub fn close(&self) -> NetResult<()> {
        self.deadline.send_replace(Some(Instant::now()));
        self.release();
        Ok(())
    }

    fn release(&self) {
        let mut state = self.stack.lock_any();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        state.sockets.remove(self.handle);
        state.icmp_idents.remove(&self.ident);
    }
}

impl Drop for PingConn {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PingConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PingConn")
            .field("laddr", &self.laddr)
            .field("raddr", &self.raddr)
            .field("ident", &self.ident)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Pair;
    use std::sync::Arc;
    use std::time::Duration;

    fn echo_request(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut msg = vec![8, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&seq.to_be_bytes());
        msg.extend_from_slice(payload);
        msg
    }

    #[test]
    fn ping_addr_network() {
        assert_eq!(PingAddr::new("10.0.0.1".parse().unwrap()).network(), "ping4");
        assert_eq!(PingAddr::new("fd00::1".parse().unwrap()).network(), "ping6");
        assert_eq!(PingAddr::default().network(), "ping");
        assert!(!PingAddr::default().is_valid());
    }

    #[tokio::test]
    async fn echo_reply_from_peer_stack() {
        let pair = Pair::new();
        let conn = pair.a.dial_ping(None, Some("10.0.0.1".parse().unwrap())).unwrap();
        conn.set_deadline(Some(Instant::now() + Duration::from_secs(5))).unwrap();

        conn.write(&echo_request(1, b"hello")).unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = conn.read_from(&mut buf).await.unwrap();
        assert_eq!(from, PingAddr::new("10.0.0.1".parse().unwrap()));
        assert_eq!(buf[0], 0, "echo reply type");
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), conn.ident());
        assert_eq!(&buf[8..n], b"hello");
    }

    #[tokio::test]
    async fn read_deadline_expires() {
        let pair = Pair::new();
        let conn = pair.a.dial_ping(None, Some("10.0.0.77".parse().unwrap())).unwrap();
        conn.write(&echo_request(1, b"x")).unwrap();
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 64];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let pair = Pair::new();
        let conn = Arc::new(pair.a.dial_ping(None, Some("10.0.0.77".parse().unwrap())).unwrap());
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                conn.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().unwrap();
        let res = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(res.unwrap_err().is_timeout());

        let mut buf = [0u8; 8];
        assert!(matches!(conn.read(&mut buf).await, Err(NetError::Timeout)));
        assert!(matches!(conn.write(&echo_request(2, b"")), Err(NetError::Closed)));
    }

    #[tokio::test]
    async fn write_checks_family_and_deadlines() {
        let pair = Pair::new();
        let conn = pair.a.listen_ping("10.0.0.2".parse().unwrap()).unwrap();
        let err = conn
            .write_to(&echo_request(1, b""), PingAddr::new("fd00::1".parse().unwrap()))
            .unwrap_err();
        assert!(matches!(err, NetError::ProtocolMismatch));
        assert_eq!(err.to_string(), "ping write: mismatched protocols");
        assert!(matches!(conn.write(&echo_request(1, b"")), Err(NetError::MissingAddress)));
        assert!(matches!(conn.set_write_deadline(None), Err(NetError::NotImplemented)));
    }

    #[tokio::test]
    async fn dial_requires_an_address() {
        let pair = Pair::new();
        assert!(pair.a.dial_ping(None, None).is_err());
        assert!(pair.a.listen_ping("10.0.0.99".parse().unwrap()).is_err());
    }
}
